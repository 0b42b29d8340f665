//! HTTP server and graceful shutdown.
//!
//! # Graceful shutdown
//!
//! [`ShutdownHandle::shutdown`] (or SIGTERM / Ctrl-C under [`Server::run`])
//! makes the server:
//! 1. Stop calling `listener.accept()` immediately.
//! 2. Ask every open connection to finish its in-flight request and close.
//! 3. Wait for those connections until the deadline; whatever is still open
//!    then is closed without waiting further.
//! 4. Return from [`Server::serve`].
//!
//! # Zero-downtime restarts
//!
//! [`Engine::listen`] prefers a listening socket inherited from a
//! supervisor over binding a new one. Two conventions are understood:
//! `SERVER_STARTER_PORT=addr=fd[;addr=fd...]` (Server::Starter; the first
//! descriptor is used) and systemd's `LISTEN_PID` / `LISTEN_FDS` (fd 3).

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, LengthLimitError, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::{Error, HttpError};
use crate::request::Request;
use crate::response::ResponseTarget;

type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

/// Serves an [`Engine`] over HTTP/1.1 and HTTP/2.
pub struct Server {
    engine: Arc<Engine>,
    deadline: Arc<watch::Sender<Option<Instant>>>,
    stopped: watch::Sender<bool>,
}

/// Stops a running [`Server`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle {
    deadline: Arc<watch::Sender<Option<Instant>>>,
    stopped: watch::Receiver<bool>,
}

impl ShutdownHandle {
    /// Starts a graceful shutdown that gives in-flight requests `timeout` to
    /// finish. Returns immediately. Later calls cannot move the deadline.
    pub fn trigger(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        self.deadline.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(deadline);
            true
        });
    }

    /// Triggers a graceful shutdown and waits until [`Server::serve`] has
    /// returned.
    pub async fn shutdown(&self, timeout: Duration) {
        self.trigger(timeout);
        let mut stopped = self.stopped.clone();
        // Err means the server was dropped, which is stopped too.
        let _ = stopped.wait_for(|s| *s).await;
    }
}

impl Server {
    pub fn new(engine: Engine) -> Self {
        let (deadline, _) = watch::channel(None);
        let (stopped, _) = watch::channel(false);
        Self { engine: Arc::new(engine), deadline: Arc::new(deadline), stopped }
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            deadline: Arc::clone(&self.deadline),
            stopped: self.stopped.subscribe(),
        }
    }

    /// Listens via [`Engine::listen`] and serves until SIGTERM or Ctrl-C,
    /// draining for the configured `shutdown_timeout`.
    pub async fn run(self) -> Result<(), Error> {
        let listener = self.engine.listen().await?;
        let handle = self.handle();
        let timeout = self.engine.config().shutdown_timeout;

        tokio::spawn(async move {
            shutdown_signal().await;
            info!(timeout_secs = timeout.as_secs(), "shutdown signal received");
            handle.trigger(timeout);
        });

        self.serve(listener).await
    }

    /// Accepts connections on `listener` and dispatches their requests until
    /// a shutdown is triggered, then drains.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Error> {
        let addr = listener.local_addr()?;
        info!(%addr, "harrow listening");

        let mut tasks = tokio::task::JoinSet::new();
        let mut shutdown = self.deadline.subscribe();

        let deadline = loop {
            tokio::select! {
                // Checked first so a shutdown stops accepting even when more
                // connections are queued.
                biased;

                res = shutdown.wait_for(Option::is_some) => {
                    let deadline = match res {
                        Ok(d) => *d,
                        Err(_) => None,
                    };
                    info!(in_flight = tasks.len(), "shutting down, draining connections");
                    break deadline.unwrap_or_else(|| Instant::now() + self.engine.config().shutdown_timeout);
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    let engine = Arc::clone(&self.engine);
                    let stop = self.deadline.subscribe();
                    tasks.spawn(connection(engine, TokioIo::new(stream), remote_addr, stop));
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        };

        drop(listener);

        let drain = async { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout_at(deadline, drain).await.is_err() {
            warn!(abandoned = tasks.len(), "shutdown deadline reached, closing remaining connections");
            tasks.shutdown().await;
        }

        self.stopped.send_replace(true);
        info!("harrow stopped");
        Ok(())
    }
}

/// Serves one connection until the peer closes it or a shutdown asks it to
/// wind down.
async fn connection(
    engine: Arc<Engine>,
    io: TokioIo<tokio::net::TcpStream>,
    remote_addr: SocketAddr,
    mut stop: watch::Receiver<Option<Instant>>,
) {
    let svc = service_fn(move |req| {
        let engine = Arc::clone(&engine);
        async move { Ok::<_, Infallible>(dispatch(engine, req, remote_addr).await) }
    });

    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(io, svc);
    tokio::pin!(conn);

    let res = tokio::select! {
        res = conn.as_mut() => res,
        () = async { let _ = stop.wait_for(Option::is_some).await; } => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = res {
        debug!(peer = %remote_addr, "connection error: {e}");
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Reads the body, runs the engine on a blocking thread and answers with
/// whatever head the handler chain commits.
async fn dispatch(
    engine: Arc<Engine>,
    mut req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
) -> hyper::Response<ResponseBody> {
    let on_upgrade = hyper::upgrade::on(&mut req);
    let (parts, body) = req.into_parts();
    let collected = Limited::new(body, engine.config().body_limit).collect().await;

    let (head_tx, head_rx) = oneshot::channel();
    let target = StreamTarget::new(head_tx, Some(on_upgrade));

    tokio::task::spawn_blocking(move || match collected {
        Ok(body) => {
            let request = Request::from_parts(parts, body.to_bytes()).with_remote_addr(remote_addr);
            engine.serve(request, Box::new(target));
        }
        Err(e) => {
            let request = Request::from_parts(parts, Bytes::new()).with_remote_addr(remote_addr);
            engine.reject(request, Box::new(target), body_error(&*e));
        }
    });

    match head_rx.await {
        Ok(res) => res,
        Err(_) => {
            error!(peer = %remote_addr, "request finished without a response head");
            let mut res = hyper::Response::new(Empty::new().boxed_unsync());
            *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            res
        }
    }
}

fn body_error(e: &(dyn std::error::Error + Send + Sync + 'static)) -> Error {
    if e.is::<LengthLimitError>() {
        HttpError::PAYLOAD_TOO_LARGE.into()
    } else {
        HttpError::BAD_REQUEST.with_message(e.to_string()).into()
    }
}

/// The hyper side of a [`Response`](crate::Response).
///
/// A committed head is parked until the first flush or the end of the
/// request. Closing with the head still parked sends the buffered body in one
/// piece, with a `Content-Length`. After a flush the body streams: buffered
/// bytes are pushed to the connection on every flush and at the end.
struct StreamTarget {
    head: Option<oneshot::Sender<hyper::Response<ResponseBody>>>,
    parked: Option<(StatusCode, HeaderMap)>,
    chunks: Option<mpsc::UnboundedSender<Bytes>>,
    pending: BytesMut,
    upgrade: Option<OnUpgrade>,
}

impl StreamTarget {
    fn new(head: oneshot::Sender<hyper::Response<ResponseBody>>, upgrade: Option<OnUpgrade>) -> Self {
        Self { head: Some(head), parked: None, chunks: None, pending: BytesMut::new(), upgrade }
    }

    fn send_head(&mut self, status: StatusCode, headers: HeaderMap, body: ResponseBody) {
        let mut res = hyper::Response::new(body);
        *res.status_mut() = status;
        *res.headers_mut() = headers;
        if let Some(head) = self.head.take() {
            // The receiver is gone only when the connection is.
            let _ = head.send(res);
        }
    }

    /// Sends the parked head with a body fed by `chunks`.
    fn open_stream(&mut self) {
        let Some((status, headers)) = self.parked.take() else { return };
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let stream = futures::stream::poll_fn(move |cx| {
            rx.poll_recv(cx).map(|chunk| chunk.map(|b| Ok::<_, Infallible>(Frame::data(b))))
        });
        self.chunks = Some(tx);
        self.send_head(status, headers, StreamBody::new(stream).boxed_unsync());
    }

    fn push(&mut self) -> io::Result<()> {
        let Some(chunks) = &self.chunks else { return Ok(()) };
        if self.pending.is_empty() {
            return Ok(());
        }
        chunks
            .send(self.pending.split().freeze())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }
}

impl ResponseTarget for StreamTarget {
    fn write_head(&mut self, status: StatusCode, headers: HeaderMap) {
        self.parked = Some((status, headers));
    }

    fn write_body(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.open_stream();
        Ok(self.push()?)
    }

    fn hijack(&mut self) -> Result<OnUpgrade, Error> {
        self.upgrade.take().ok_or(Error::Unsupported("hijack"))
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some((status, headers)) = self.parked.take() {
            let body = Full::new(self.pending.split().freeze()).boxed_unsync();
            self.send_head(status, headers, body);
            return Ok(());
        }
        let res = self.push();
        self.chunks = None;
        res
    }
}

// ── Socket activation ─────────────────────────────────────────────────────────

const SD_LISTEN_FDS_START: i32 = 3;

/// The listening socket passed down by a supervisor, if any.
pub(crate) fn activated_listener() -> Result<Option<std::net::TcpListener>, Error> {
    let var = |name| std::env::var(name).ok();
    let fd = activation_fd(
        var("SERVER_STARTER_PORT").as_deref(),
        var("LISTEN_PID").as_deref(),
        var("LISTEN_FDS").as_deref(),
        std::process::id(),
    )?;

    #[cfg(unix)]
    {
        fd.map(adopt).transpose()
    }

    #[cfg(not(unix))]
    {
        let _ = fd;
        Ok(None)
    }
}

/// Takes ownership of an inherited listening socket. A descriptor that is
/// not a bound socket is left open and reported.
#[cfg(unix)]
fn adopt(fd: i32) -> Result<std::net::TcpListener, Error> {
    use std::os::fd::{FromRawFd, IntoRawFd};

    // SAFETY: the supervisor hands this descriptor to us as an open
    // listening socket, and nothing else in the process owns it.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    if let Err(e) = listener.local_addr() {
        let _ = listener.into_raw_fd();
        return Err(Error::SocketActivation(format!("inherited fd {fd} is not a socket: {e}")));
    }
    Ok(listener)
}

/// Picks the inherited descriptor out of the activation variables.
fn activation_fd(
    server_starter: Option<&str>,
    listen_pid: Option<&str>,
    listen_fds: Option<&str>,
    pid: u32,
) -> Result<Option<i32>, Error> {
    if let Some(ports) = server_starter {
        let first = ports.split(';').next().unwrap_or_default();
        let fd = first
            .rsplit_once('=')
            .and_then(|(_, fd)| fd.trim().parse::<i32>().ok())
            .ok_or_else(|| Error::SocketActivation(format!("malformed SERVER_STARTER_PORT `{ports}`")))?;
        return Ok(Some(fd));
    }

    let (Some(listen_pid), Some(listen_fds)) = (listen_pid, listen_fds) else {
        return Ok(None);
    };
    let listen_pid: u32 = listen_pid
        .trim()
        .parse()
        .map_err(|_| Error::SocketActivation(format!("malformed LISTEN_PID `{listen_pid}`")))?;
    if listen_pid != pid {
        return Ok(None);
    }
    let count: u32 = listen_fds
        .trim()
        .parse()
        .map_err(|_| Error::SocketActivation(format!("malformed LISTEN_FDS `{listen_fds}`")))?;
    Ok((count > 0).then_some(SD_LISTEN_FDS_START))
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (sent by supervisors and the
/// Kubernetes control plane) and **SIGINT** (Ctrl-C, for local dev).
/// On Windows only Ctrl-C is available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_task_is_spawnable() {
        fn assert_send<T: Send>(_: &T) {}

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let (_tx, rx) = watch::channel(None);

        let fut = connection(Arc::new(Engine::default()), TokioIo::new(stream), peer, rx);
        assert_send(&fut);
    }

    #[cfg(unix)]
    #[test]
    fn adopting_a_listener() {
        use std::os::fd::IntoRawFd;

        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let adopted = adopt(std_listener.into_raw_fd()).unwrap();
        assert_eq!(adopted.local_addr().unwrap(), addr);
    }

    #[cfg(unix)]
    #[test]
    fn non_socket_descriptor_is_rejected_and_left_open() {
        use std::os::fd::AsRawFd;

        let file = std::fs::File::open(std::env::current_exe().unwrap()).unwrap();
        assert!(matches!(adopt(file.as_raw_fd()), Err(Error::SocketActivation(_))));
        assert!(file.metadata().is_ok());
    }

    #[test]
    fn no_activation_variables() {
        assert_eq!(activation_fd(None, None, None, 42).unwrap(), None);
    }

    #[test]
    fn server_starter_uses_first_descriptor() {
        assert_eq!(activation_fd(Some("0.0.0.0:80=5;8080=6"), None, None, 42).unwrap(), Some(5));
        assert_eq!(activation_fd(Some("3000=4"), None, None, 42).unwrap(), Some(4));
    }

    #[test]
    fn server_starter_takes_precedence_over_systemd() {
        assert_eq!(activation_fd(Some("80=7"), Some("42"), Some("1"), 42).unwrap(), Some(7));
    }

    #[test]
    fn malformed_server_starter_is_an_error() {
        for bad in ["", "80", "80=x"] {
            assert!(matches!(
                activation_fd(Some(bad), None, None, 42),
                Err(Error::SocketActivation(_))
            ), "{bad}");
        }
    }

    #[test]
    fn systemd_requires_matching_pid() {
        assert_eq!(activation_fd(None, Some("42"), Some("1"), 42).unwrap(), Some(3));
        assert_eq!(activation_fd(None, Some("41"), Some("1"), 42).unwrap(), None);
        assert_eq!(activation_fd(None, Some("42"), Some("0"), 42).unwrap(), None);
        assert!(activation_fd(None, Some("pid"), Some("1"), 42).is_err());
        assert!(activation_fd(None, Some("42"), Some("many"), 42).is_err());
    }

    #[tokio::test]
    async fn body_errors_map_to_statuses() {
        let body = http_body_util::Full::new(Bytes::from_static(b"0123456789"));
        let e = Limited::new(body, 4).collect().await.unwrap_err();
        let too_large = body_error(&*e);
        assert!(matches!(too_large, Error::Http(ref he) if he.code == StatusCode::PAYLOAD_TOO_LARGE));

        let broken = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(body_error(&broken), Error::Http(ref he) if he.code == StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn unflushed_response_has_a_fixed_length() {
        let (head_tx, head_rx) = oneshot::channel();
        let mut target = StreamTarget::new(head_tx, None);

        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, "text/plain".parse().unwrap());
        target.write_head(StatusCode::CREATED, headers);
        target.write_body(b"hello ").unwrap();
        target.write_body(b"world").unwrap();
        target.close().unwrap();

        let res = head_rx.await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(res.headers()[http::header::CONTENT_TYPE], "text/plain");
        assert_eq!(hyper::body::Body::size_hint(res.body()).exact(), Some(11));
        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "hello world");
    }

    #[tokio::test]
    async fn flush_switches_to_streaming() {
        let (head_tx, mut head_rx) = oneshot::channel();
        let mut target = StreamTarget::new(head_tx, None);

        target.flush().unwrap();
        assert!(head_rx.try_recv().is_err(), "nothing committed yet");

        target.write_head(StatusCode::OK, HeaderMap::new());
        target.write_body(b"first ").unwrap();
        target.flush().unwrap();
        let res = head_rx.await.unwrap();
        assert_eq!(hyper::body::Body::size_hint(res.body()).exact(), None);

        target.write_body(b"second").unwrap();
        target.close().unwrap();
        assert!(matches!(target.hijack(), Err(Error::Unsupported("hijack"))));

        let body = res.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "first second");
    }
}
