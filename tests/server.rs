//! Server lifecycle over real TCP: dispatch, body limits, graceful drain and
//! the shutdown deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harrow::{Config, Engine, Error, Server, ShutdownHandle};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

async fn start(engine: Engine) -> (SocketAddr, ShutdownHandle, JoinHandle<Result<(), Error>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(engine);
    let handle = server.handle();
    let task = tokio::spawn(server.serve(listener));
    (addr, handle, task)
}

/// Sends `raw` and reads until the server closes the connection.
async fn roundtrip(addr: SocketAddr, raw: String) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    // A reset after a partial response is still a finished exchange here.
    let _ = stream.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_requests_over_tcp() {
    let mut engine = Engine::default();
    engine
        .get("/users/:id", |c| {
            let id = c.param("id").unwrap_or_default().to_owned();
            c.string(StatusCode::OK, &id)
        })
        .get("/abc", |c| c.no_content(StatusCode::NO_CONTENT));
    let (addr, handle, task) = start(engine).await;

    let res = roundtrip(addr, get("/users/42")).await;
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.ends_with("\r\n\r\n42"), "{res}");

    let res = roundtrip(addr, get("/nope")).await;
    assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"), "{res}");

    let res = roundtrip(addr, "DELETE /abc HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n".to_owned()).await;
    assert!(res.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{res}");

    handle.shutdown(Duration::from_secs(1)).await;
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_body_is_413() {
    let config = Config { body_limit: 16, ..Config::default() };
    let mut engine = Engine::new(config);
    engine.post("/upload", |c| {
        let len = c.request().body().len();
        c.string(StatusCode::OK, &len.to_string())
    });
    let (addr, handle, task) = start(engine).await;

    let small = "x".repeat(8);
    let res = roundtrip(
        addr,
        format!("POST /upload HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{small}", small.len()),
    )
    .await;
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.ends_with("\r\n\r\n8"), "{res}");

    let large = "x".repeat(100);
    let res = roundtrip(
        addr,
        format!("POST /upload HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{large}", large.len()),
    )
    .await;
    assert!(res.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{res}");

    handle.shutdown(Duration::from_secs(1)).await;
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_in_flight_requests() {
    let started = Arc::new(Notify::new());
    let signal = Arc::clone(&started);

    let mut engine = Engine::default();
    engine.get("/slow", move |c| {
        signal.notify_one();
        std::thread::sleep(Duration::from_millis(300));
        c.string(StatusCode::OK, "done")
    });
    let (addr, handle, task) = start(engine).await;

    let client = tokio::spawn(roundtrip(addr, get("/slow")));
    started.notified().await;

    handle.shutdown(Duration::from_secs(5)).await;

    let res = client.await.unwrap();
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.ends_with("done"), "{res}");

    // The listener is closed once shutdown has returned.
    assert!(TcpStream::connect(addr).await.is_err());
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_keep_alive_connections_do_not_block_shutdown() {
    let mut engine = Engine::default();
    engine.get("/", |c| c.string(StatusCode::OK, "ok"));
    let (addr, handle, task) = start(engine).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
    let mut buf = Vec::new();
    while !buf.ends_with(b"ok") {
        let mut chunk = [0u8; 512];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed early");
        buf.extend_from_slice(&chunk[..n]);
    }

    let start = Instant::now();
    handle.shutdown(Duration::from_secs(10)).await;
    assert!(start.elapsed() < Duration::from_secs(5), "{:?}", start.elapsed());
    task.await.unwrap().unwrap();

    // The server closed its side.
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_deadline_abandons_slow_requests() {
    let started = Arc::new(Notify::new());
    let signal = Arc::clone(&started);

    let mut engine = Engine::default();
    engine.get("/stuck", move |c| {
        signal.notify_one();
        std::thread::sleep(Duration::from_secs(1));
        c.string(StatusCode::OK, "too late")
    });
    let (addr, handle, task) = start(engine).await;

    let client = tokio::spawn(roundtrip(addr, get("/stuck")));
    started.notified().await;

    let start = Instant::now();
    handle.shutdown(Duration::from_millis(100)).await;
    assert!(start.elapsed() < Duration::from_millis(800), "{:?}", start.elapsed());
    task.await.unwrap().unwrap();

    let res = client.await.unwrap();
    assert!(!res.contains("too late"), "{res}");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_before_serve_returns_immediately() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = Server::new(Engine::default());
    let handle = server.handle();

    handle.trigger(Duration::from_secs(1));
    server.serve(listener).await.unwrap();
    handle.shutdown(Duration::from_secs(1)).await;
}
