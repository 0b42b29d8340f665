use std::panic::{self, AssertUnwindSafe};

use tracing::error;

use crate::error::{panic_message, Error};
use crate::handler::{handler, BoxedHandler};

/// Turns a panic anywhere below it into [`Error::Panic`], so the error
/// handler can still answer the request.
///
/// Register it first: it only sees panics from middleware registered after
/// it and from the route handler.
pub fn recover(next: BoxedHandler) -> BoxedHandler {
    handler(move |c| match panic::catch_unwind(AssertUnwindSafe(|| next(&mut *c))) {
        Ok(res) => res,
        Err(payload) => {
            let message = panic_message(&*payload);
            error!(panic = %message, method = %c.request().method(), path = c.path(), "handler panicked");
            Err(Error::Panic(message))
        }
    })
}
