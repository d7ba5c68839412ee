use etude_core::{Server, ServerConfig, ShutdownHandle};
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Running {
    addr: SocketAddr,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<etude_core::EtudeResult<()>>>,
    metrics: Arc<etude_core::ServerMetrics>,
    _root: tempfile::TempDir,
}

impl Running {
    fn stop(mut self) -> etude_core::EtudeResult<()> {
        self.handle.shutdown();
        self.thread.take().unwrap().join().unwrap()
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            let _ = thread.join();
        }
    }
}

fn populate(root: &Path) {
    fs::write(root.join("index.html"), b"<h1>home</h1>").unwrap();
    fs::write(root.join("style.css"), b"body{}").unwrap();
    fs::write(root.join("empty.txt"), b"").unwrap();
    fs::create_dir(root.join("docs")).unwrap();
    fs::write(root.join("docs/index.html"), b"<p>docs</p>").unwrap();

    let secret = root.join("secret.txt");
    fs::write(&secret, b"hidden").unwrap();
    fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();

    fs::create_dir(root.join("cgi-bin")).unwrap();
    let script = root.join("cgi-bin/echo.sh");
    fs::write(
        &script,
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\n'\nprintf '%s:%s:' \"$REQUEST_METHOD\" \"$QUERY_STRING\"\ncat\n",
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let slow = root.join("cgi-bin/slow.sh");
    fs::write(
        &slow,
        "#!/bin/sh\nsleep 2\nprintf 'Content-Type: text/plain\\r\\n\\r\\nslow'\n",
    )
    .unwrap();
    fs::set_permissions(&slow, fs::Permissions::from_mode(0o755)).unwrap();
}

fn start_with(tweak: impl FnOnce(&mut ServerConfig)) -> Running {
    let root = tempfile::tempdir().unwrap();
    populate(root.path());
    let mut config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        doc_root: root.path().to_path_buf(),
        workers: 2,
        shutdown_grace_ms: 500,
        ..ServerConfig::default()
    };
    tweak(&mut config);

    let server = Server::bind(config).unwrap();
    let addr = server.local_addr();
    let handle = server.shutdown_handle();
    let metrics = server.metrics();
    let thread = thread::spawn(move || server.run());
    Running {
        addr,
        handle,
        thread: Some(thread),
        metrics,
        _root: root,
    }
}

fn start() -> Running {
    start_with(|_| {})
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Read exactly one response. `head` responses carry a Content-Length but
/// no body.
fn read_response(stream: &mut TcpStream, head: bool) -> Response {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert_eq!(n, 1, "connection closed inside the header block");
        raw.push(byte[0]);
    }

    let text = String::from_utf8(raw).unwrap();
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap();
    let status = status_line.split(' ').nth(1).unwrap().parse().unwrap();
    let headers: Vec<(String, String)> = lines
        .filter(|l| !l.is_empty())
        .map(|l| {
            let (n, v) = l.split_once(':').unwrap();
            (n.trim().to_string(), v.trim().to_string())
        })
        .collect();

    let mut res = Response {
        status,
        headers,
        body: Vec::new(),
    };
    let len: usize = res.header("Content-Length").unwrap().parse().unwrap();
    if !head {
        res.body = vec![0; len];
        stream.read_exact(&mut res.body).unwrap();
    }
    res
}

fn get(stream: &mut TcpStream, path: &str) -> Response {
    write!(
        stream,
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n"
    )
    .unwrap();
    read_response(stream, false)
}

fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected EOF, got {n} bytes"),
        // A reset also means the server let go.
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("expected EOF, got {e}"),
    }
}

#[test]
fn test_keep_alive_serves_several_requests() {
    let server = start();
    let mut stream = connect(server.addr);

    let res = get(&mut stream, "/");
    assert_eq!(res.status, 200);
    assert_eq!(res.text(), "<h1>home</h1>");
    assert_eq!(res.header("Content-Type"), Some("text/html"));
    assert_eq!(res.header("Connection"), Some("keep-alive"));
    assert_eq!(res.header("Server"), Some("etude"));

    let res = get(&mut stream, "/style.css");
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Type"), Some("text/css"));
    assert_eq!(res.body, b"body{}");

    let res = get(&mut stream, "/docs/");
    assert_eq!(res.text(), "<p>docs</p>");

    drop(stream);
    server.stop().unwrap();
}

#[test]
fn test_directory_without_slash_serves_index_as_html() {
    let server = start();
    let mut stream = connect(server.addr);
    let res = get(&mut stream, "/docs");
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Type"), Some("text/html"));
    assert_eq!(res.text(), "<p>docs</p>");
}

#[test]
fn test_connection_close_without_keep_alive() {
    let server = start();
    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let res = read_response(&mut stream, false);
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Connection"), Some("close"));
    assert_closed(&mut stream);
}

#[test]
fn test_pipelined_requests_answer_in_order() {
    let server = start();
    let mut stream = connect(server.addr);
    stream
        .write_all(
            b"GET /style.css HTTP/1.1\r\nConnection: keep-alive\r\n\r\n\
              GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n\
              GET /missing HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();

    assert_eq!(read_response(&mut stream, false).body, b"body{}");
    assert_eq!(read_response(&mut stream, false).body, b"<h1>home</h1>");
    assert_eq!(read_response(&mut stream, false).status, 404);
}

#[test]
fn test_request_split_across_writes() {
    let server = start();
    let mut stream = connect(server.addr);
    stream.set_nodelay(true).unwrap();
    for part in [
        &b"GE"[..],
        b"T /style.c",
        b"ss HTTP/1.1\r\nConnec",
        b"tion: keep-alive\r",
        b"\n\r\n",
    ] {
        stream.write_all(part).unwrap();
        thread::sleep(Duration::from_millis(20));
    }
    let res = read_response(&mut stream, false);
    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"body{}");
}

#[test]
fn test_error_statuses() {
    let server = start();
    let mut stream = connect(server.addr);

    let res = get(&mut stream, "/nope.html");
    assert_eq!(res.status, 404);
    assert_eq!(res.header("Content-Type"), Some("text/html"));
    assert!(res.text().contains("404 Not Found"));

    let res = get(&mut stream, "/secret.txt");
    assert_eq!(res.status, 403);

    let res = get(&mut stream, "/../etc/passwd");
    assert_eq!(res.status, 403);

    // Still usable after error responses.
    assert_eq!(get(&mut stream, "/").status, 200);
}

#[test]
fn test_malformed_request_gets_400_and_close() {
    let server = start();
    let mut stream = connect(server.addr);
    stream.write_all(b"NONSENSE\r\n\r\n").unwrap();
    let res = read_response(&mut stream, false);
    assert_eq!(res.status, 400);
    assert_eq!(res.header("Connection"), Some("close"));
    assert_closed(&mut stream);
}

#[test]
fn test_head_has_length_but_no_body() {
    let server = start();
    let mut stream = connect(server.addr);
    stream
        .write_all(b"HEAD /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let res = read_response(&mut stream, true);
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Length"), Some("13"));

    // The next response starts right where the header block ended.
    let res = get(&mut stream, "/style.css");
    assert_eq!(res.body, b"body{}");
}

#[test]
fn test_empty_file_gets_default_page() {
    let server = start();
    let mut stream = connect(server.addr);
    let res = get(&mut stream, "/empty.txt");
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Type"), Some("text/html"));
    assert!(res.text().contains("200 OK"));
}

#[test]
fn test_cgi_post_and_query() {
    let server = start();
    let mut stream = connect(server.addr);

    stream
        .write_all(
            b"POST /cgi-bin/echo.sh HTTP/1.1\r\nConnection: keep-alive\r\n\
              Content-Type: text/plain\r\nContent-Length: 11\r\n\r\nhello world",
        )
        .unwrap();
    let res = read_response(&mut stream, false);
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Type"), Some("text/plain"));
    assert_eq!(res.text(), "POST::hello world");

    let res = get(&mut stream, "/cgi-bin/echo.sh?name=etude");
    assert_eq!(res.status, 200);
    assert_eq!(res.text(), "GET:name=etude:");
}

#[test]
fn test_post_to_static_file_is_rejected() {
    let server = start();
    let mut stream = connect(server.addr);
    stream
        .write_all(b"POST /index.html HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi")
        .unwrap();
    assert_eq!(read_response(&mut stream, false).status, 400);
}

#[test]
fn test_idle_connection_times_out() {
    let server = start_with(|c| {
        c.idle_timeout_secs = 1;
        c.tick_interval_secs = 1;
    });
    let mut stream = connect(server.addr);
    assert_eq!(get(&mut stream, "/").status, 200);

    // Nothing more is sent; the sweep closes the socket.
    assert_closed(&mut stream);
    assert_eq!(server.metrics.snapshot().timed_out, 1);
}

#[test]
fn test_slow_script_outlives_idle_timeout() {
    let server = start_with(|c| {
        c.idle_timeout_secs = 1;
        c.tick_interval_secs = 1;
    });
    let mut stream = connect(server.addr);

    // Several sweeps run while the worker is busy.
    let res = get(&mut stream, "/cgi-bin/slow.sh");
    assert_eq!(res.status, 200);
    assert_eq!(res.text(), "slow");
    assert_eq!(server.metrics.snapshot().timed_out, 0);

    assert_eq!(get(&mut stream, "/style.css").body, b"body{}");
}

#[test]
fn test_full_dispatch_queue_drops_connection() {
    let server = start_with(|c| {
        c.workers = 1;
        c.queue_capacity = 1;
    });
    let request = b"GET /cgi-bin/slow.sh HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";

    let mut busy = connect(server.addr);
    busy.write_all(request).unwrap();
    thread::sleep(Duration::from_millis(300));

    let mut queued = connect(server.addr);
    queued.write_all(b"GET /style.css HTTP/1.1\r\n\r\n").unwrap();
    thread::sleep(Duration::from_millis(300));

    let mut dropped = connect(server.addr);
    dropped.write_all(request).unwrap();
    assert_closed(&mut dropped);

    assert_eq!(read_response(&mut busy, false).text(), "slow");
    assert_eq!(read_response(&mut queued, false).body, b"body{}");
}

#[test]
fn test_connections_above_limit_are_refused() {
    let server = start_with(|c| c.max_connections = 1);
    let mut first = connect(server.addr);
    assert_eq!(get(&mut first, "/").status, 200);

    let mut second = connect(server.addr);
    assert_closed(&mut second);
    assert_eq!(server.metrics.snapshot().refused, 1);

    // The admitted connection is unaffected.
    assert_eq!(get(&mut first, "/style.css").status, 200);
}

#[test]
fn test_shutdown_closes_idle_connections() {
    let server = start();
    let mut stream = connect(server.addr);
    assert_eq!(get(&mut stream, "/").status, 200);
    let addr = server.addr;

    server.stop().unwrap();
    assert_closed(&mut stream);
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
}

#[test]
fn test_metrics_count_requests_and_bytes() {
    let server = start();
    let mut stream = connect(server.addr);
    get(&mut stream, "/");
    get(&mut stream, "/style.css");
    drop(stream);

    // Counted right after the last write, which may land after our read.
    let mut snap = server.metrics.snapshot();
    for _ in 0..100 {
        if snap.requests == 2 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
        snap = server.metrics.snapshot();
    }
    assert_eq!(snap.requests, 2);
    assert_eq!(snap.accepted, 1);
    assert!(snap.bytes_sent > 19);
}
