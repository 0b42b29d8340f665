//! Response wrapper with single-commit semantics.
//!
//! Handlers never talk to the transport directly. They write through
//! [`Response`], which owns the pending headers, remembers whether the head
//! has gone out, and counts body bytes. The transport side is abstracted as a
//! [`ResponseTarget`]: the hyper connection in production, a
//! [`Recorder`](crate::Recorder) in tests.

use std::io;

use http::{HeaderMap, HeaderValue, StatusCode};
use hyper::upgrade::OnUpgrade;
use tracing::warn;

use crate::error::Error;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Content-type values used by the [`Context`](crate::Context) writers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    FormData,     // application/x-www-form-urlencoded
    Html,         // text/html; charset=utf-8
    Json,         // application/json; charset=utf-8
    Multipart,    // multipart/form-data
    OctetStream,  // application/octet-stream  (binary / file download)
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml; charset=utf-8
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FormData    => "application/x-www-form-urlencoded",
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json; charset=utf-8",
            Self::Multipart   => "multipart/form-data",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml; charset=utf-8",
        }
    }

    /// The media type without parameters, for matching request headers.
    pub fn essence(self) -> &'static str {
        let s = self.as_str();
        s.split(';').next().unwrap_or(s)
    }
}

// ── ResponseTarget ────────────────────────────────────────────────────────────

/// The writable stream underneath a [`Response`].
///
/// `write_head` is called at most once per request; [`Response`] enforces
/// that. The optional capabilities default to [`Error::Unsupported`]; a
/// caller asking a target for something it cannot do is a caller error.
pub trait ResponseTarget: Send {
    fn write_head(&mut self, status: StatusCode, headers: HeaderMap);

    fn write_body(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Pushes buffered body bytes to the peer.
    fn flush(&mut self) -> Result<(), Error> {
        Err(Error::Unsupported("flush"))
    }

    /// Hands out the connection upgrade (e.g. for WebSockets). It resolves
    /// once a `101 Switching Protocols` head has been sent.
    fn hijack(&mut self) -> Result<OnUpgrade, Error> {
        Err(Error::Unsupported("hijack"))
    }

    /// End of the request. Pending body bytes are delivered; afterwards the
    /// target is dropped.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Target of an idle context. Swallows everything.
pub(crate) struct Discard;

impl ResponseTarget for Discard {
    fn write_head(&mut self, _status: StatusCode, _headers: HeaderMap) {}

    fn write_body(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

/// The per-request response wrapper.
///
/// The head is committed at most once: by [`write_header`](Response::write_header)
/// or implicitly with `200 OK` by the first [`write`](Response::write). After
/// that, status and header changes have no effect on the wire.
pub struct Response {
    target: Box<dyn ResponseTarget>,
    headers: HeaderMap,
    status: StatusCode,
    size: u64,
    committed: bool,
}

impl Response {
    pub(crate) fn new() -> Self {
        Self {
            target: Box::new(Discard),
            headers: HeaderMap::new(),
            status: StatusCode::OK,
            size: 0,
            committed: false,
        }
    }

    /// Headers that will be sent with the head. Edits after commit are not
    /// transmitted.
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }

    /// The committed status, or `200 OK` while nothing has been written.
    pub fn status(&self) -> StatusCode { self.status }

    /// Body bytes written so far.
    pub fn size(&self) -> u64 { self.size }

    pub fn committed(&self) -> bool { self.committed }

    /// Sets a header, replacing any previous value.
    pub fn set_header(&mut self, name: http::header::HeaderName, value: &str) -> Result<(), Error> {
        self.headers.insert(name, HeaderValue::from_str(value)?);
        Ok(())
    }

    /// Commits the head with `code`. A second call is a no-op: several layers
    /// finalising the same response is normal, not an error.
    pub fn write_header(&mut self, code: StatusCode) {
        if self.committed {
            warn!(status = self.status.as_u16(), ignored = code.as_u16(), "response already committed");
            return;
        }
        self.status = code;
        self.target.write_head(code, self.headers.clone());
        self.committed = true;
    }

    /// Writes body bytes, committing `200 OK` first if nothing was committed.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if !self.committed {
            self.write_header(StatusCode::OK);
        }
        let n = self.target.write_body(buf)?;
        self.size += n as u64;
        Ok(n)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.target.flush()
    }

    pub fn hijack(&mut self) -> Result<OnUpgrade, Error> {
        self.target.hijack()
    }

    /// Rebinds to a fresh target with zeroed state.
    pub(crate) fn reset(&mut self, target: Box<dyn ResponseTarget>) {
        let Response { target: t, headers, status, size, committed } = self;
        *t = target;
        headers.clear();
        *status = StatusCode::OK;
        *size = 0;
        *committed = false;
    }

    /// Commits whatever is pending and closes the target. A handler that wrote
    /// nothing still produces a `200 OK` head.
    pub(crate) fn finish(&mut self) -> io::Result<()> {
        if !self.committed {
            self.write_header(self.status);
        }
        self.target.close()
    }
}

impl io::Write for Response {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Response::write(self, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        match Response::flush(self) {
            Ok(()) | Err(Error::Unsupported(_)) => Ok(()),
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::Recorder;

    fn bound(rec: &Recorder) -> Response {
        let mut res = Response::new();
        res.reset(Box::new(rec.clone()));
        res
    }

    #[test]
    fn first_write_header_wins() {
        let rec = Recorder::new();
        let mut res = bound(&rec);

        res.write_header(StatusCode::CREATED);
        assert!(res.committed());
        res.write_header(StatusCode::BAD_REQUEST);

        assert!(res.committed());
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(rec.status(), StatusCode::CREATED);
        assert_eq!(rec.head_writes(), 1);
    }

    #[test]
    fn write_implies_ok_and_counts_bytes() {
        let rec = Recorder::new();
        let mut res = bound(&rec);

        assert_eq!(res.write(b"hello ").unwrap(), 6);
        res.write(b"world").unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.size(), 11);
        assert_eq!(rec.body_string(), "hello world");
        assert_eq!(rec.head_writes(), 1);
    }

    #[test]
    fn headers_after_commit_are_not_sent() {
        let rec = Recorder::new();
        let mut res = bound(&rec);

        res.set_header(http::header::CONTENT_TYPE, "text/plain").unwrap();
        res.write_header(StatusCode::OK);
        res.set_header(http::header::LOCATION, "/late").unwrap();

        assert_eq!(rec.header("content-type").as_deref(), Some("text/plain"));
        assert_eq!(rec.header("location"), None);
    }

    #[test]
    fn reset_zeroes_state() {
        let rec = Recorder::new();
        let mut res = bound(&rec);
        res.set_header(http::header::LOCATION, "/x").unwrap();
        res.write_header(StatusCode::FOUND);
        res.write(b"abc").unwrap();

        let next = Recorder::new();
        res.reset(Box::new(next.clone()));

        assert!(!res.committed());
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.size(), 0);
        assert!(res.headers().is_empty());

        res.write(b"z").unwrap();
        assert_eq!(next.body_string(), "z");
        assert_eq!(rec.body_string(), "abc");
    }

    #[test]
    fn capabilities_are_forwarded() {
        let rec = Recorder::new();
        let mut res = bound(&rec);
        res.write(b"a").unwrap();
        res.flush().unwrap();
        assert_eq!(rec.flushes(), 1);
        assert!(matches!(res.hijack(), Err(Error::Unsupported("hijack"))));

        let mut idle = Response::new();
        assert!(matches!(idle.flush(), Err(Error::Unsupported("flush"))));
    }

    #[test]
    fn finish_commits_default_status() {
        let rec = Recorder::new();
        let mut res = bound(&rec);
        res.finish().unwrap();
        assert_eq!(rec.head_writes(), 1);
        assert_eq!(rec.status(), StatusCode::OK);
        assert!(rec.closed());
    }
}
