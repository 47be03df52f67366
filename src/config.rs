//! Startup configuration: TOML file plus CLI overrides, every field with a
//! default mirroring the original deployment.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ServerError, ServerResult};

/// Who performs the connection syscalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Discipline {
    /// Worker threads perform the I/O themselves on readiness.
    Reactor,
    /// The event-loop thread performs the I/O and hands workers parsed work.
    Proactor,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// TCP listen port.
    pub port: u16,
    /// Fixed worker-thread count; defaults to the number of cores.
    pub workers: usize,
    /// Bounded task-queue capacity.
    pub max_queue: usize,
    /// 0 = listen LT + conn LT, 1 = LT + ET, 2 = ET + LT, 3 = ET + ET.
    pub trig_mode: u8,
    pub discipline: Discipline,
    /// Enable SO_LINGER on the listening socket.
    pub opt_linger: bool,
    /// Eviction tick interval in seconds; idle deadline is three ticks.
    pub tick_secs: u64,
    /// Document root served for file requests.
    pub doc_root: PathBuf,
    /// Credential-store connection pool size.
    pub store_pool: usize,
    /// Connection-table capacity (slots are preallocated).
    pub max_connections: usize,
    /// Optional TOML file seeding the credential store.
    pub credentials: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9006,
            workers: num_cpus::get().max(1),
            max_queue: 10_000,
            trig_mode: 0,
            discipline: Discipline::Proactor,
            opt_linger: false,
            tick_secs: 5,
            doc_root: PathBuf::from("./staticResources"),
            store_pool: 8,
            max_connections: 1024,
            credentials: None,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> ServerResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        let config: ServerConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.workers == 0 {
            return Err(ServerError::Config("workers must be at least 1".into()));
        }
        if self.max_queue == 0 {
            return Err(ServerError::Config("max_queue must be at least 1".into()));
        }
        if self.trig_mode > 3 {
            return Err(ServerError::Config(format!(
                "trig_mode must be 0-3, got {}",
                self.trig_mode
            )));
        }
        if self.tick_secs == 0 {
            return Err(ServerError::Config("tick_secs must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Config(
                "max_connections must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// (listen edge-triggered, connection edge-triggered).
    pub fn trigger_modes(&self) -> (bool, bool) {
        match self.trig_mode {
            0 => (false, false),
            1 => (false, true),
            2 => (true, false),
            _ => (true, true),
        }
    }

    /// Idle connections are evicted after three ticks without activity.
    pub fn idle_deadline(&self) -> u64 {
        3 * self.tick_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_mode_table() {
        let mut cfg = ServerConfig::default();
        let expected = [(false, false), (false, true), (true, false), (true, true)];
        for (mode, modes) in expected.iter().enumerate() {
            cfg.trig_mode = mode as u8;
            assert_eq!(cfg.trigger_modes(), *modes);
        }
    }

    #[test]
    fn test_parse_toml() {
        let cfg: ServerConfig = toml::from_str(
            r#"
            port = 8080
            workers = 4
            discipline = "reactor"
            trig_mode = 3
            doc_root = "/srv/www"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.discipline, Discipline::Reactor);
        assert_eq!(cfg.trigger_modes(), (true, true));
        assert_eq!(cfg.doc_root, PathBuf::from("/srv/www"));
        // Unset fields fall back to defaults.
        assert_eq!(cfg.tick_secs, 5);
        assert_eq!(cfg.max_queue, 10_000);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut cfg = ServerConfig::default();
        cfg.trig_mode = 4;
        assert!(cfg.validate().is_err());
        cfg.trig_mode = 0;
        cfg.workers = 0;
        assert!(cfg.validate().is_err());
    }
}
