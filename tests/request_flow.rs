//! End-to-end request flows against a live server on a loopback socket.
//!
//! The signal bridge and the alarm are process-global, so tests that start
//! a server serialize on a gate; the most recently started server owns the
//! relay and the tick.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use etude::{Discipline, Server, ServerConfig};

static GATE: Mutex<()> = Mutex::new(());

fn scratch_root(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("etude-{}-{name}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("judge.html"), "<html>judge</html>").unwrap();
    fs::write(dir.join("welcome.html"), "<html>welcome</html>").unwrap();
    fs::write(dir.join("logError.html"), "<html>logError</html>").unwrap();
    fs::write(dir.join("log.html"), "<html>log</html>").unwrap();
    fs::write(dir.join("registerError.html"), "<html>registerError</html>").unwrap();
    fs::write(dir.join("empty.html"), "").unwrap();
    fs::create_dir_all(dir.join("subdir")).unwrap();

    fs::write(dir.join("secret.html"), "private").unwrap();
    let mut perms = fs::metadata(dir.join("secret.html")).unwrap().permissions();
    perms.set_mode(0o200);
    fs::set_permissions(dir.join("secret.html"), perms).unwrap();

    dir
}

fn base_config(doc_root: PathBuf) -> ServerConfig {
    ServerConfig {
        port: 0,
        workers: 2,
        doc_root,
        ..ServerConfig::default()
    }
}

/// Start the server on an ephemeral port; the loop thread runs until the
/// test process exits.
fn start_server(config: ServerConfig) -> u16 {
    let mut server = Server::new(config).unwrap();
    let port = server.port();
    thread::spawn(move || {
        let _ = server.run();
    });
    port
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

/// One request on a fresh connection, response read to EOF (the server
/// closes after a response without keep-alive).
fn roundtrip(port: u16, request: &str) -> String {
    let mut stream = connect(port);
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

/// Read exactly one framed response off a kept-alive stream.
fn read_response(stream: &mut TcpStream) -> (String, String) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let len = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length:"))
        .map(|v| v.trim().parse::<usize>().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, String::from_utf8(body).unwrap())
}

fn post(target: &str, body: &str) -> String {
    format!(
        "POST {target} HTTP/1.1\r\nContent-Length:{}\r\n\r\n{body}",
        body.len()
    )
}

#[test]
fn test_get_static_file() {
    let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
    let port = start_server(base_config(scratch_root("get")));

    let response = roundtrip(port, "GET /judge.html HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("Content-Length:18\r\n"), "{response}");
    assert!(response.contains("Connection:close\r\n"), "{response}");
    assert!(response.ends_with("<html>judge</html>"), "{response}");
}

#[test]
fn test_root_serves_landing_page() {
    let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
    let port = start_server(base_config(scratch_root("root")));

    let response = roundtrip(port, "GET / HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("<html>judge</html>"), "{response}");
}

#[test]
fn test_error_statuses() {
    let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
    let port = start_server(base_config(scratch_root("errors")));

    let response = roundtrip(port, "GET /missing.html HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");

    // A directory target is malformed, not missing.
    let response = roundtrip(port, "GET /subdir HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");

    let response = roundtrip(port, "GET /judge.html HTTP/1.0\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");

    let response = roundtrip(port, "GET /secret.html HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{response}");

    // A target climbing out of the document root is refused outright.
    let response = roundtrip(port, "GET /../judge.html HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
}

#[test]
fn test_empty_file_gets_generated_body() {
    let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
    let port = start_server(base_config(scratch_root("empty")));

    let response = roundtrip(port, "GET /empty.html HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("<html><body></body></html>"), "{response}");
}

#[test]
fn test_login_and_register_flow() {
    let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
    let root = scratch_root("accounts");
    let creds = root.join("creds.toml");
    fs::write(&creds, "[users]\nalice = \"secret\"\n").unwrap();
    let mut config = base_config(root);
    config.credentials = Some(creds);
    let port = start_server(config);

    let response = roundtrip(port, &post("/2CGISQL.cgi", "user=alice&passwd=secret"));
    assert!(response.ends_with("<html>welcome</html>"), "{response}");

    let response = roundtrip(port, &post("/2CGISQL.cgi", "user=alice&passwd=wrong"));
    assert!(response.ends_with("<html>logError</html>"), "{response}");

    let response = roundtrip(port, &post("/3CGISQL.cgi", "user=bob&passwd=pw"));
    assert!(response.ends_with("<html>log</html>"), "{response}");

    // The fresh registration is immediately usable for login.
    let response = roundtrip(port, &post("/2CGISQL.cgi", "user=bob&passwd=pw"));
    assert!(response.ends_with("<html>welcome</html>"), "{response}");

    // Re-registering the same name fails.
    let response = roundtrip(port, &post("/3CGISQL.cgi", "user=bob&passwd=other"));
    assert!(response.ends_with("<html>registerError</html>"), "{response}");
}

#[test]
fn test_keep_alive_serves_two_requests() {
    let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
    let port = start_server(base_config(scratch_root("keepalive")));

    let mut stream = connect(port);
    for _ in 0..2 {
        stream
            .write_all(b"GET /judge.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        assert!(head.contains("Connection:keep-alive\r\n"), "{head}");
        assert_eq!(body, "<html>judge</html>");
    }
}

#[test]
fn test_reactor_discipline_and_edge_triggering() {
    let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
    let mut config = base_config(scratch_root("reactor"));
    config.discipline = Discipline::Reactor;
    config.trig_mode = 3;
    let port = start_server(config);

    let response = roundtrip(port, "GET /judge.html HTTP/1.1\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("<html>judge</html>"), "{response}");
}

#[test]
fn test_full_table_refuses_with_busy_reply() {
    let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
    let mut config = base_config(scratch_root("busy"));
    config.max_connections = 1;
    let port = start_server(config);

    let _held = connect(port);
    thread::sleep(Duration::from_millis(200));

    let mut refused = connect(port);
    let mut reply = String::new();
    refused.read_to_string(&mut reply).unwrap();
    assert_eq!(reply, "Internal server busy");
}

#[test]
fn test_idle_connection_evicted() {
    let _gate = GATE.lock().unwrap_or_else(|e| e.into_inner());
    let mut config = base_config(scratch_root("evict"));
    config.tick_secs = 1;
    let port = start_server(config);

    // Send nothing: the server must close the socket after three ticks.
    let mut stream = connect(port);
    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0);
}
