use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use http::StatusCode;
use tracing::info;

use crate::context::Context;
use crate::error::Error;
use crate::handler::{handler, BoxedHandler};

/// Logs one `info` event per request: status, method, path, user agent,
/// client address and latency in microseconds.
///
/// When the handler fails before anything was committed, the logged status
/// is the one the error handler will send. A panic is logged as a 500 and
/// then resumed, so register this outside [`recover`](super::recover).
pub fn access_log(next: BoxedHandler) -> BoxedHandler {
    handler(move |c| {
        let start = Instant::now();
        match panic::catch_unwind(AssertUnwindSafe(|| next(&mut *c))) {
            Ok(res) => {
                log_request(c, status_of(c, &res), start);
                res
            }
            Err(payload) => {
                log_request(c, StatusCode::INTERNAL_SERVER_ERROR, start);
                panic::resume_unwind(payload)
            }
        }
    })
}

fn log_request(c: &Context, status: StatusCode, start: Instant) {
    let latency_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
    info!(
        status = status.as_u16(),
        method = %c.request().method(),
        path = c.path(),
        user_agent = c.request().header("user-agent").unwrap_or_default(),
        remote_ip = real_ip(c).as_deref().unwrap_or_default(),
        latency_us,
        "request",
    );
}

fn status_of(c: &Context, res: &Result<(), Error>) -> StatusCode {
    match res {
        _ if c.response().committed() => c.response().status(),
        Ok(()) => c.response().status(),
        Err(Error::Http(he)) => he.code,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// The client address, honouring the usual proxy headers.
fn real_ip(c: &Context) -> Option<String> {
    let req = c.request();
    if let Some(ip) = req.header("x-real-ip") {
        return Some(ip.trim().to_owned());
    }
    if let Some(forwarded) = req.header("x-forwarded-for") {
        return forwarded.split(',').next().map(|ip| ip.trim().to_owned());
    }
    req.remote_addr().map(|addr| addr.ip().to_string())
}
