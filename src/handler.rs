//! Handler and middleware types.
//!
//! # Shapes
//!
//! A handler takes the request's [`Context`] and returns `Ok(())` or an
//! [`Error`] for the engine's error handler:
//!
//! ```text
//! fn(&mut Context) -> Result<(), Error>
//! ```
//!
//! A middleware takes the next handler and returns a handler that wraps it:
//!
//! ```text
//! fn(BoxedHandler) -> BoxedHandler
//! ```
//!
//! Both are stored type-erased behind an `Arc` so the router and the
//! middleware list can hold values of different concrete types, and so a
//! resolved handler can be shared by concurrent requests with one atomic
//! increment.
//!
//! # Writing middleware
//!
//! ```rust
//! use harrow::{handler, BoxedHandler, Context};
//!
//! fn powered_by(next: BoxedHandler) -> BoxedHandler {
//!     handler(move |c: &mut Context| {
//!         c.response_mut().set_header(http::header::SERVER, "harrow")?;
//!         next(c)
//!     })
//! }
//! ```
//!
//! Not calling `next` short-circuits the chain; that is how auth gates work.

use std::sync::Arc;

use crate::context::Context;
use crate::error::Error;

/// A heap-allocated, type-erased handler shared across concurrent requests.
pub type BoxedHandler = Arc<dyn Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static>;

/// A heap-allocated, type-erased middleware.
pub type BoxedMiddleware = Arc<dyn Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static>;

/// Erases a handler closure or function.
///
/// The `Fn` bound sits directly on `F` so closure parameter and return types
/// are inferred: `handler(|c| c.no_content(StatusCode::OK))` needs no
/// annotations.
pub fn handler<F>(f: F) -> BoxedHandler
where
    F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Erases a middleware closure or function.
pub fn middleware<F>(f: F) -> BoxedMiddleware
where
    F: Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps `handler` in `chain`, first element outermost.
///
/// Wrapping runs from the last element to the first, so for `[A, B, C]` the
/// result is `A(B(C(handler)))`: `A` sees the request first and the response
/// last.
pub(crate) fn compose(chain: &[BoxedMiddleware], handler: BoxedHandler) -> BoxedHandler {
    chain.iter().rev().fold(handler, |next, mw| mw(next))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn tag(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> BoxedMiddleware {
        let log = Arc::clone(log);
        middleware(move |next| {
            let log = Arc::clone(&log);
            handler(move |c| {
                log.lock().unwrap().push(format!("{name}>"));
                let res = next(c);
                log.lock().unwrap().push(format!("<{name}"));
                res
            })
        })
    }

    #[test]
    fn composes_as_an_onion() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = vec![tag(&log, "A"), tag(&log, "B"), tag(&log, "C")];

        let inner_log = Arc::clone(&log);
        let h = compose(&chain, handler(move |_| {
            inner_log.lock().unwrap().push("handler".to_owned());
            Ok(())
        }));

        let mut c = Context::detached();
        h(&mut c).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            ["A>", "B>", "C>", "handler", "<C", "<B", "<A"],
        );
    }

    #[test]
    fn empty_chain_is_the_handler_itself() {
        let h = handler(|_| Err(Error::CookieNotFound));
        let composed = compose(&[], Arc::clone(&h));
        assert!(Arc::ptr_eq(&h, &composed));
    }
}
