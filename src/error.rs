//! Unified error type and the top-level error handler.
//!
//! Handlers and middleware return errors upward instead of writing error
//! responses themselves. Exactly one place turns an error into bytes on the
//! wire: the engine's error handler, [`default_error_handler`] unless
//! replaced.

use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;

use http::StatusCode;
use tracing::{error, warn};

use crate::context::Context;

/// The error type returned by harrow's fallible operations and by handlers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error that already knows which status it should produce.
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A route pattern that is malformed or conflicts with one already
    /// registered for the same method.
    #[error("invalid route `{pattern}`: {reason}")]
    Route { pattern: String, reason: String },

    #[error("invalid redirect status code {0}")]
    InvalidRedirectCode(u16),

    #[error("cookie not found")]
    CookieNotFound,

    #[error("renderer not registered")]
    RendererNotRegistered,

    /// The underlying response target lacks a capability (flush, hijack).
    #[error("{0} is not supported by the response target")]
    Unsupported(&'static str),

    /// A handler panicked; the payload message is preserved for the logs.
    #[error("panic: {0}")]
    Panic(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid header value: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),

    /// Inherited-listener environment was present but unusable.
    #[error("socket activation: {0}")]
    SocketActivation(String),

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error. The default error handler answers it with 500.
    pub fn other(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Other(e.into())
    }
}

/// An error carrying the status code and message the client should see.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("code={}, message={message}", .code.as_u16())]
pub struct HttpError {
    pub code: StatusCode,
    pub message: Cow<'static, str>,
}

impl HttpError {
    pub const BAD_REQUEST: Self = Self::canonical(StatusCode::BAD_REQUEST, "Bad Request");
    pub const UNAUTHORIZED: Self = Self::canonical(StatusCode::UNAUTHORIZED, "Unauthorized");
    pub const FORBIDDEN: Self = Self::canonical(StatusCode::FORBIDDEN, "Forbidden");
    pub const NOT_FOUND: Self = Self::canonical(StatusCode::NOT_FOUND, "Not Found");
    pub const METHOD_NOT_ALLOWED: Self =
        Self::canonical(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    pub const PAYLOAD_TOO_LARGE: Self =
        Self::canonical(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large");
    pub const UNSUPPORTED_MEDIA_TYPE: Self =
        Self::canonical(StatusCode::UNSUPPORTED_MEDIA_TYPE, "Unsupported Media Type");
    pub const INTERNAL_SERVER_ERROR: Self =
        Self::canonical(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");

    const fn canonical(code: StatusCode, message: &'static str) -> Self {
        Self { code, message: Cow::Borrowed(message) }
    }

    /// An error whose message is the status code's reason phrase.
    pub fn new(code: StatusCode) -> Self {
        Self { code, message: Cow::Borrowed(code.canonical_reason().unwrap_or("")) }
    }

    /// Replaces the message shown to the client.
    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = message.into();
        self
    }
}

/// Extracts the message of a panic payload (`&str` or `String`).
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

// ── Error handler ─────────────────────────────────────────────────────────────

/// The engine-wide error handler. It receives every error the composed chain
/// returns, plus errors raised before dispatch (oversized bodies).
pub type ErrorHandler = Arc<dyn Fn(Error, &mut Context) + Send + Sync + 'static>;

/// Maps an error to a response.
///
/// [`HttpError`] keeps its code and message; anything else becomes a 500 whose
/// body never leaks the underlying detail. The body is `{"message": "..."}`,
/// except for `HEAD` requests, which get the status alone. If the response is
/// already committed nothing is written.
pub fn default_error_handler(err: Error, c: &mut Context) {
    let (code, message) = match &err {
        Error::Http(he) => (he.code, he.message.clone()),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            HttpError::INTERNAL_SERVER_ERROR.message,
        ),
    };

    if c.response().committed() {
        error!(error = %err, path = c.path(), "response already committed, error not written");
        return;
    }

    let written = if *c.request().method() == http::Method::HEAD {
        c.no_content(code)
    } else {
        c.json(code, &serde_json::json!({ "message": message }))
    };
    if let Err(e) = written {
        error!(error = %e, "failed to write error response");
    }

    if code.is_server_error() {
        error!(error = %err, status = code.as_u16(), path = c.path(), "request failed");
    } else {
        warn!(error = %err, status = code.as_u16(), path = c.path(), "request rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_defaults_to_reason_phrase() {
        let he = HttpError::new(StatusCode::NOT_FOUND);
        assert_eq!(he, HttpError::NOT_FOUND);
        assert_eq!(he.to_string(), "code=404, message=Not Found");
    }

    #[test]
    fn http_error_message_override() {
        let he = HttpError::new(StatusCode::INTERNAL_SERVER_ERROR).with_message("Too Bad...");
        assert_eq!(he.code, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(he.to_string(), "code=500, message=Too Bad...");
    }

    #[test]
    fn panic_payload_messages() {
        let payload = std::panic::catch_unwind(|| -> u8 { panic!("static") }).unwrap_err();
        assert_eq!(panic_message(&*payload), "static");

        let payload = std::panic::catch_unwind(|| -> u8 { panic!("formatted {}", 7) }).unwrap_err();
        assert_eq!(panic_message(&*payload), "formatted 7");
    }

    #[test]
    fn http_error_converts_transparently() {
        let err: Error = HttpError::FORBIDDEN.into();
        assert_eq!(err.to_string(), "code=403, message=Forbidden");
        assert!(matches!(err, Error::Http(ref he) if he.code == StatusCode::FORBIDDEN));
    }
}
