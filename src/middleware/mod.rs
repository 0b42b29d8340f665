//! Built-in middleware.
//!
//! Middleware wraps the next handler in the chain and is the right place for
//! cross-cutting concerns: panic recovery, access logging, request ids, auth
//! gates. Register with [`Engine::use_middleware`](crate::Engine::use_middleware);
//! the first one registered runs outermost.
//!
//! ```rust
//! use harrow::{middleware, Engine};
//!
//! let mut engine = Engine::default();
//! engine
//!     .use_middleware(middleware::access_log)
//!     .use_middleware(middleware::recover);
//! ```

mod access_log;
mod recover;

pub use access_log::access_log;
pub use recover::recover;
