//! The engine: routes, middleware, context pool and error handling.
//!
//! Build an [`Engine`] during startup, then hand it to a
//! [`Server`](crate::Server). Registration takes `&mut self`; once the engine
//! is serving it is only ever reached through `&self`.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::context::{Context, Shared};
use crate::error::{panic_message, Error, HttpError};
use crate::handler::{compose, handler, BoxedHandler, BoxedMiddleware};
use crate::method::Method;
use crate::pool::ContextPool;
use crate::render::Renderer;
use crate::request::Request;
use crate::response::ResponseTarget;
use crate::router::{Params, Router};
use crate::server;

/// Owns everything needed to turn a request into a response.
pub struct Engine {
    config: Config,
    router: Router,
    middleware: Vec<BoxedMiddleware>,
    pool: ContextPool,
    shared: Arc<Shared>,
    not_found: BoxedHandler,
    method_not_allowed: BoxedHandler,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let shared = Shared {
            max_multipart_memory: config.max_multipart_memory,
            ..Shared::default()
        };
        Self {
            pool: ContextPool::new(config.pool_capacity),
            config,
            router: Router::new(),
            middleware: Vec::new(),
            shared: Arc::new(shared),
            not_found: handler(|_| Err(HttpError::NOT_FOUND.into())),
            method_not_allowed: handler(|_| Err(HttpError::METHOD_NOT_ALLOWED.into())),
        }
    }

    pub fn config(&self) -> &Config { &self.config }
    pub fn router(&self) -> &Router { &self.router }

    // ── Middleware ───────────────────────────────────────────────────────────

    /// Appends a middleware. The first one registered is the outermost: it
    /// sees every request first and every response last.
    pub fn use_middleware<F>(&mut self, mw: F) -> &mut Self
    where
        F: Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static,
    {
        self.middleware.push(Arc::new(mw));
        self
    }

    // ── Routes ───────────────────────────────────────────────────────────────

    pub fn get<F>(&mut self, path: &str, h: F) -> &mut Self
    where
        F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.handle(Method::Get, path, h)
    }

    pub fn post<F>(&mut self, path: &str, h: F) -> &mut Self
    where
        F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.handle(Method::Post, path, h)
    }

    pub fn put<F>(&mut self, path: &str, h: F) -> &mut Self
    where
        F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.handle(Method::Put, path, h)
    }

    pub fn patch<F>(&mut self, path: &str, h: F) -> &mut Self
    where
        F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.handle(Method::Patch, path, h)
    }

    pub fn delete<F>(&mut self, path: &str, h: F) -> &mut Self
    where
        F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.handle(Method::Delete, path, h)
    }

    pub fn head<F>(&mut self, path: &str, h: F) -> &mut Self
    where
        F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.handle(Method::Head, path, h)
    }

    pub fn options<F>(&mut self, path: &str, h: F) -> &mut Self
    where
        F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.handle(Method::Options, path, h)
    }

    /// Registers a route.
    ///
    /// # Panics
    ///
    /// Panics if `path` is malformed or conflicts with a route already
    /// registered for `method`. Routes are fixed at startup, so this is a
    /// programming error; use [`try_handle`](Engine::try_handle) to recover.
    pub fn handle<F>(&mut self, method: Method, path: &str, h: F) -> &mut Self
    where
        F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
    {
        if let Err(e) = self.try_handle(method, path, h) {
            panic!("{e}");
        }
        self
    }

    pub fn try_handle<F>(&mut self, method: Method, path: &str, h: F) -> Result<(), Error>
    where
        F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.add(method, path, handler(h))
    }

    /// Registers an already-erased handler.
    pub fn add(&mut self, method: Method, path: &str, h: BoxedHandler) -> Result<(), Error> {
        self.router.add(method, path, h)
    }

    // ── Collaborators ────────────────────────────────────────────────────────

    /// Replaces [`default_error_handler`](crate::default_error_handler).
    pub fn set_error_handler<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Error, &mut Context) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.shared).error_handler = Arc::new(f);
        self.pool.clear();
        self
    }

    pub fn set_renderer(&mut self, renderer: impl Renderer) -> &mut Self {
        Arc::make_mut(&mut self.shared).renderer = Some(Arc::new(renderer));
        self.pool.clear();
        self
    }

    /// Handler for paths no method has a route for. Middleware still wraps it.
    pub fn set_not_found_handler<F>(&mut self, h: F) -> &mut Self
    where
        F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.not_found = handler(h);
        self
    }

    /// Handler for paths that have a route, but not for the request's method.
    pub fn set_method_not_allowed_handler<F>(&mut self, h: F) -> &mut Self
    where
        F: Fn(&mut Context) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.method_not_allowed = handler(h);
        self
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    /// Handles one request to completion, writing the response to `target`.
    ///
    /// Blocks for as long as the handler chain runs. Never panics: a panic in
    /// the chain becomes an [`Error::Panic`] for the error handler.
    pub fn serve(&self, request: Request, target: Box<dyn ResponseTarget>) {
        let resolved = Method::from_http(request.method())
            .and_then(|m| self.router.resolve(m, request.path()));

        let (route, params) = match resolved {
            Some(found) => found,
            None if self.router.any_method_matches(request.path()) => {
                (Arc::clone(&self.method_not_allowed), Params::default())
            }
            None => (Arc::clone(&self.not_found), Params::default()),
        };

        let mut pooled = self.pool.acquire(&self.shared);
        let c: &mut Context = &mut pooled;
        c.reset(target, request, params);
        c.set_handler(Arc::clone(&route));

        let chain = compose(&self.middleware, route);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| chain(&mut *c)));
        let err = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(payload) => Some(Error::Panic(panic_message(&*payload))),
        };
        complete(c, err);
    }

    /// Answers a request that never reached routing, such as one whose body
    /// could not be read, with `err` through the error handler.
    pub(crate) fn reject(&self, request: Request, target: Box<dyn ResponseTarget>, err: Error) {
        let mut pooled = self.pool.acquire(&self.shared);
        let c: &mut Context = &mut pooled;
        c.reset(target, request, Params::default());
        complete(c, Some(err));
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Opens the listener to serve on.
    ///
    /// A listener passed down by a supervisor (`SERVER_STARTER_PORT`, or
    /// systemd's `LISTEN_FDS`) takes precedence; otherwise `0.0.0.0:<port>`
    /// is bound.
    pub async fn listen(&self) -> Result<TcpListener, Error> {
        if let Some(inherited) = server::activated_listener()? {
            inherited.set_nonblocking(true)?;
            let listener = TcpListener::from_std(inherited)?;
            info!(addr = ?listener.local_addr().ok(), "using inherited listener");
            return Ok(listener);
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr).await?;
        debug!(%addr, "listener bound");
        Ok(listener)
    }
}

/// Runs the error handler if needed, then closes the response.
fn complete(c: &mut Context, err: Option<Error>) {
    if let Some(err) = err {
        if panic::catch_unwind(AssertUnwindSafe(|| c.error(err))).is_err() {
            error!(path = c.path(), "error handler panicked");
        }
    }
    if let Err(e) = c.response_mut().finish() {
        debug!(error = %e, "closing response failed");
    }
}
