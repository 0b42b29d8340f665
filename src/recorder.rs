//! In-memory response target.
//!
//! Drive [`Engine::serve`](crate::Engine::serve) with a [`Recorder`] to see
//! exactly what would have gone over the wire, without a socket:
//!
//! ```rust
//! use bytes::Bytes;
//! use harrow::{Context, Engine, Recorder, Request};
//! use http::StatusCode;
//!
//! let mut engine = Engine::default();
//! engine.get("/", |c: &mut Context| c.string(StatusCode::OK, "OK"));
//!
//! let rec = Recorder::new();
//! let req = Request::new(http::Request::get("/").body(Bytes::new()).unwrap());
//! engine.serve(req, Box::new(rec.clone()));
//!
//! assert_eq!(rec.status(), StatusCode::OK);
//! assert_eq!(rec.body_string(), "OK");
//! ```

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};

use crate::error::Error;
use crate::response::ResponseTarget;

#[derive(Default)]
struct Recorded {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
    head_writes: usize,
    flushes: usize,
    closed: bool,
}

/// A [`ResponseTarget`] that keeps everything in memory.
///
/// Clones share the same recording: hand one clone to the engine and inspect
/// the other.
#[derive(Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<Recorded>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The committed status; `200 OK` if no head was written.
    pub fn status(&self) -> StatusCode {
        self.lock().status.unwrap_or(StatusCode::OK)
    }

    pub fn headers(&self) -> HeaderMap {
        self.lock().headers.clone()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.lock()
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock().body)
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.lock().body).into_owned()
    }

    /// How many times the head reached the target. Never more than one.
    pub fn head_writes(&self) -> usize {
        self.lock().head_writes
    }

    pub fn flushes(&self) -> usize {
        self.lock().flushes
    }

    pub fn closed(&self) -> bool {
        self.lock().closed
    }
}

impl ResponseTarget for Recorder {
    fn write_head(&mut self, status: StatusCode, headers: HeaderMap) {
        let mut rec = self.lock();
        rec.status = Some(status);
        rec.headers = headers;
        rec.head_writes += 1;
    }

    fn write_body(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.lock().flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}
