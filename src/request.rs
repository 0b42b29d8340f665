//! Incoming HTTP request type.

use std::net::SocketAddr;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::request::Parts;
use http::{HeaderMap, Uri};

/// An incoming HTTP request: the head as parsed by the transport plus the
/// fully-read body.
///
/// A [`Context`](crate::Context) holds exactly one of these while a request
/// is in flight and gives it up when the request is finished.
#[derive(Debug)]
pub struct Request {
    head: Parts,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
}

impl Request {
    /// Wraps an `http::Request` whose body has already been read.
    ///
    /// ```rust
    /// use bytes::Bytes;
    /// use harrow::Request;
    ///
    /// let req = Request::new(
    ///     http::Request::get("/users/42?full=1").body(Bytes::new()).unwrap(),
    /// );
    /// assert_eq!(req.path(), "/users/42");
    /// assert_eq!(req.query(), Some("full=1"));
    /// ```
    pub fn new(req: http::Request<Bytes>) -> Self {
        let (head, body) = req.into_parts();
        Self::from_parts(head, body)
    }

    pub(crate) fn from_parts(head: Parts, body: Bytes) -> Self {
        Self { head, body, remote_addr: None }
    }

    /// Records the peer address the request arrived from.
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn method(&self) -> &http::Method { &self.head.method }
    pub fn uri(&self) -> &Uri { &self.head.uri }
    pub fn path(&self) -> &str { self.head.uri.path() }
    pub fn query(&self) -> Option<&str> { self.head.uri.query() }
    pub fn headers(&self) -> &HeaderMap { &self.head.headers }
    pub fn body(&self) -> &Bytes { &self.body }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Case-insensitive header lookup. Values that are not visible ASCII are
    /// treated as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The declared `Content-Type`, parameters included.
    pub fn content_type(&self) -> Option<&str> {
        self.head.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

/// An empty `GET /` request. This is what an idle pooled context holds, so
/// that nothing from the previous request stays reachable.
impl Default for Request {
    fn default() -> Self {
        let (head, ()) = http::Request::new(()).into_parts();
        Self { head, body: Bytes::new(), remote_addr: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = Request::new(
            http::Request::post("/")
                .header("Content-Type", "application/json")
                .header("X-Trace", "abc")
                .body(Bytes::from_static(b"{}"))
                .unwrap(),
        );
        assert_eq!(req.header("x-trace"), Some("abc"));
        assert_eq!(req.content_type(), Some("application/json"));
        assert_eq!(req.body().as_ref(), b"{}");
    }

    #[test]
    fn default_is_empty() {
        let req = Request::default();
        assert_eq!(req.path(), "/");
        assert!(req.headers().is_empty());
        assert!(req.body().is_empty());
        assert_eq!(req.remote_addr(), None);
    }
}
