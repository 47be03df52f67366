use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use etude::{Discipline, Server, ServerConfig, logging};

#[derive(Parser)]
#[command(name = "etude", version, about = "Epoll-based HTTP/1.1 file and login server")]
struct Cli {
    /// TOML configuration file; flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Worker-thread count.
    #[arg(short, long)]
    workers: Option<usize>,

    /// 0 = listen LT + conn LT, 1 = LT + ET, 2 = ET + LT, 3 = ET + ET.
    #[arg(short = 'm', long)]
    trig_mode: Option<u8>,

    /// Who performs connection I/O: the workers or the event loop.
    #[arg(short = 'a', long, value_enum)]
    discipline: Option<Discipline>,

    /// Enable SO_LINGER on the listening socket.
    #[arg(short = 'o', long)]
    opt_linger: bool,

    /// Document root served for file requests.
    #[arg(short = 'r', long)]
    doc_root: Option<PathBuf>,

    /// TOML file seeding the credential store.
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log);

    let mut config = match cli.config.as_deref().map(ServerConfig::from_file).transpose() {
        Ok(loaded) => loaded.unwrap_or_default(),
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(trig_mode) = cli.trig_mode {
        config.trig_mode = trig_mode;
    }
    if let Some(discipline) = cli.discipline {
        config.discipline = discipline;
    }
    if cli.opt_linger {
        config.opt_linger = true;
    }
    if let Some(doc_root) = cli.doc_root {
        config.doc_root = doc_root;
    }
    if let Some(credentials) = cli.credentials {
        config.credentials = Some(credentials);
    }

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start server");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = server.run() {
        error!(error = %e, "server terminated");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
