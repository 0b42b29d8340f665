//! # harrow
//!
//! A small HTTP request-dispatch engine: radix-tree routing, onion-ordered
//! middleware, pooled per-request contexts and a response wrapper that
//! commits its head exactly once.
//!
//! ## The contract
//!
//! Handlers are plain functions of the request's [`Context`]. They return
//! `Ok(())` after writing a response, or an [`Error`] and let the engine's
//! error handler write one. Only the error handler turns errors into bytes,
//! and only while nothing has been committed yet.
//!
//! What harrow owns:
//!
//! - Routing: `:name` parameters, trailing `*name` wildcards, 404 vs 405
//! - Middleware: `(next) -> handler`, first registered runs outermost
//! - Context pooling: every field is cleared between requests
//! - Lifecycle: socket activation, graceful drain bounded by a deadline
//!
//! What it leaves to collaborators: templates (through [`Renderer`]),
//! sessions and auth (through middleware and [`Key`]), persistence, TLS.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use harrow::{middleware, Context, Engine, Error, HttpError, Server};
//! use http::StatusCode;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let mut engine = Engine::default();
//!     engine
//!         .use_middleware(middleware::access_log)
//!         .use_middleware(middleware::recover)
//!         .get("/users/:id", get_user)
//!         .delete("/users/:id", |c| c.no_content(StatusCode::NO_CONTENT));
//!
//!     Server::new(engine).run().await
//! }
//!
//! fn get_user(c: &mut Context) -> Result<(), Error> {
//!     let id: u64 = c
//!         .param("id")
//!         .and_then(|id| id.parse().ok())
//!         .ok_or_else(|| HttpError::BAD_REQUEST.with_message("id must be a number"))?;
//!     c.json(StatusCode::OK, &serde_json::json!({ "id": id, "name": "alice" }))
//! }
//! ```

mod config;
mod context;
mod engine;
mod error;
mod form;
mod handler;
mod method;
mod pool;
mod recorder;
mod render;
mod request;
mod response;
mod router;
mod server;

pub mod middleware;

pub use config::{Config, Options};
pub use context::{Context, Key};
pub use engine::Engine;
pub use error::{default_error_handler, Error, ErrorHandler, HttpError};
pub use form::{FormFile, MultipartForm, Values};
pub use handler::{handler, middleware, BoxedHandler, BoxedMiddleware};
pub use method::Method;
pub use recorder::Recorder;
pub use render::{Renderer, Vars};
pub use request::Request;
pub use response::{ContentType, Response, ResponseTarget};
pub use router::{Params, Router};
pub use server::{Server, ShutdownHandle};
