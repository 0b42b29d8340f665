//! Per-request state and the handler-facing API.
//!
//! A [`Context`] is pooled by the engine: the same allocation serves many
//! requests, one at a time. Everything a request can leave behind (request,
//! response target, path parameters, parsed query and form, stored values,
//! handler reference) is cleared by [`Context::reset`] before the next
//! request sees it. `reset` destructures the struct field by field, so adding
//! a field without deciding how to clear it does not compile.

use std::any::Any;
use std::cell::OnceCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use cookie::Cookie;
use http::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use http::{HeaderValue, StatusCode};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;

use crate::error::{default_error_handler, Error, ErrorHandler, HttpError};
use crate::form::{parse_multipart, MultipartForm, Values};
use crate::handler::BoxedHandler;
use crate::render::{Renderer, Vars};
use crate::request::Request;
use crate::response::{ContentType, Response, ResponseTarget};
use crate::router::Params;

/// Engine-wide collaborators a context needs while handling a request.
/// Fixed for the lifetime of the context.
#[derive(Clone)]
pub(crate) struct Shared {
    pub(crate) error_handler: ErrorHandler,
    pub(crate) renderer: Option<Arc<dyn Renderer>>,
    pub(crate) max_multipart_memory: usize,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            error_handler: Arc::new(default_error_handler),
            renderer: None,
            max_multipart_memory: 32 << 20,
        }
    }
}

/// The state of one in-flight request.
///
/// Handlers receive `&mut Context`; it is never shared between threads while
/// a request is running.
pub struct Context {
    shared: Arc<Shared>,
    request: Request,
    response: Response,
    params: Params,
    query: OnceCell<Values>,
    form: Option<MultipartForm>,
    store: HashMap<String, Box<dyn Any + Send + Sync>>,
    handler: Option<BoxedHandler>,
}

impl Context {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            request: Request::default(),
            response: Response::new(),
            params: Params::default(),
            query: OnceCell::new(),
            form: None,
            store: HashMap::new(),
            handler: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new(Arc::new(Shared::default()))
    }

    /// Installs a new request/response pair and its bound parameters, dropping
    /// every trace of the previous request.
    pub(crate) fn reset(&mut self, target: Box<dyn ResponseTarget>, request: Request, params: Params) {
        let Context {
            shared: _,
            request: current_request,
            response,
            params: current_params,
            query,
            form,
            store,
            handler,
        } = self;

        *current_request = request;
        response.reset(target);
        *current_params = params;
        *query = OnceCell::new();
        *form = None;
        store.clear();
        *handler = None;
    }

    /// Returns the context to its idle state so a pooled instance keeps no
    /// reference to the finished request or its connection.
    pub(crate) fn release(&mut self) {
        self.reset(Box::new(crate::response::Discard), Request::default(), Params::default());
    }

    pub(crate) fn set_handler(&mut self, handler: BoxedHandler) {
        self.handler = Some(handler);
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn request(&self) -> &Request { &self.request }
    pub fn response(&self) -> &Response { &self.response }
    pub fn response_mut(&mut self) -> &mut Response { &mut self.response }

    /// The request path, without the query string.
    pub fn path(&self) -> &str { self.request.path() }

    /// The handler that resolved for this request: the route's handler, or the
    /// not-found / method-not-allowed fallback.
    pub fn handler(&self) -> Option<&BoxedHandler> { self.handler.as_ref() }

    pub fn params(&self) -> &Params { &self.params }

    /// A path parameter. For `/users/:id` on `/users/42`, `param("id")` is
    /// `Some("42")`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    /// The parsed query string, decoded on first use.
    pub fn query_params(&self) -> &Values {
        self.query
            .get_or_init(|| Values::parse(self.request.query().unwrap_or_default().as_bytes()))
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params().get(name)
    }

    /// The decoded form body.
    ///
    /// `multipart/form-data` and `application/x-www-form-urlencoded` are
    /// understood; a request without a content type has no form values; any
    /// other content type is a 415. A malformed body is a 400 and a multipart
    /// body above the configured memory threshold a 413.
    pub fn form_params(&mut self) -> Result<&Values, Error> {
        Ok(&self.multipart_form()?.values)
    }

    /// Like [`form_params`](Context::form_params), including uploaded files.
    pub fn multipart_form(&mut self) -> Result<&MultipartForm, Error> {
        let form = match self.form.take() {
            Some(form) => form,
            None => self.decode_form()?,
        };
        Ok(self.form.insert(form))
    }

    fn decode_form(&self) -> Result<MultipartForm, Error> {
        let Some(content_type) = self.request.content_type() else {
            return Ok(MultipartForm::default());
        };
        let essence = content_type.split(';').next().unwrap_or_default().trim();

        if essence.eq_ignore_ascii_case(ContentType::Multipart.essence()) {
            parse_multipart(
                content_type,
                self.request.body().clone(),
                self.shared.max_multipart_memory,
            )
        } else if essence.eq_ignore_ascii_case(ContentType::FormData.essence()) {
            Ok(MultipartForm { values: Values::parse_body(self.request.body())?, files: Vec::new() })
        } else {
            Err(HttpError::UNSUPPORTED_MEDIA_TYPE.into())
        }
    }

    // ── Store ────────────────────────────────────────────────────────────────

    /// A value set earlier in this request by middleware or a handler.
    ///
    /// Prefer a typed [`Key`] over raw string lookups.
    pub fn get(&self, key: &str) -> Option<&(dyn Any + Send + Sync)> {
        self.store.get(key).map(|v| &**v)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Any + Send + Sync) {
        self.store.insert(key.into(), Box::new(value));
    }

    // ── Cookies ──────────────────────────────────────────────────────────────

    /// All cookies sent with the request. Unparseable pairs are skipped.
    pub fn cookies(&self) -> Vec<Cookie<'static>> {
        self.request
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(Cookie::split_parse)
            .filter_map(Result::ok)
            .map(Cookie::into_owned)
            .collect()
    }

    pub fn cookie(&self, name: &str) -> Result<Cookie<'static>, Error> {
        self.cookies()
            .into_iter()
            .find(|c| c.name() == name)
            .ok_or(Error::CookieNotFound)
    }

    /// Adds a `Set-Cookie` header to the response.
    pub fn set_cookie(&mut self, cookie: &Cookie<'_>) -> Result<(), Error> {
        let value = HeaderValue::from_str(&cookie.to_string())?;
        self.response.headers_mut().append(SET_COOKIE, value);
        Ok(())
    }

    // ── Writers ──────────────────────────────────────────────────────────────

    /// Commits `code` with no body.
    pub fn no_content(&mut self, code: StatusCode) -> Result<(), Error> {
        self.response.write_header(code);
        Ok(())
    }

    /// Commits a redirect to `location`. Only 300–308 are accepted.
    pub fn redirect(&mut self, code: StatusCode, location: &str) -> Result<(), Error> {
        if !(300..=308).contains(&code.as_u16()) {
            return Err(Error::InvalidRedirectCode(code.as_u16()));
        }
        self.response.set_header(LOCATION, location)?;
        self.response.write_header(code);
        Ok(())
    }

    pub fn blob(&mut self, code: StatusCode, content_type: ContentType, body: &[u8]) -> Result<(), Error> {
        self.response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type.as_str()));
        self.response.write_header(code);
        self.response.write(body)?;
        Ok(())
    }

    pub fn string(&mut self, code: StatusCode, body: &str) -> Result<(), Error> {
        self.blob(code, ContentType::Text, body.as_bytes())
    }

    pub fn html(&mut self, code: StatusCode, body: &str) -> Result<(), Error> {
        self.blob(code, ContentType::Html, body.as_bytes())
    }

    /// Serialises `value` as JSON, newline-terminated. A `pretty` query
    /// parameter switches to indented output.
    pub fn json<T: Serialize + ?Sized>(&mut self, code: StatusCode, value: &T) -> Result<(), Error> {
        let mut body = if self.query_params().contains_key("pretty") {
            let mut buf = Vec::new();
            let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
            value.serialize(&mut ser)?;
            buf
        } else {
            serde_json::to_vec(value)?
        };
        body.push(b'\n');
        self.blob(code, ContentType::Json, &body)
    }

    /// Renders template `name` through the registered [`Renderer`].
    pub fn render(&mut self, code: StatusCode, name: &str, vars: &Vars) -> Result<(), Error> {
        let renderer = self.shared.renderer.clone().ok_or(Error::RendererNotRegistered)?;
        let mut buf = Vec::new();
        renderer.render(&mut buf, name, vars)?;
        self.blob(code, ContentType::Html, &buf)
    }

    /// Hands `err` to the engine's error handler right away.
    pub fn error(&mut self, err: Error) {
        let handler = Arc::clone(&self.shared.error_handler);
        handler(err, self);
    }
}

// ── Typed keys ────────────────────────────────────────────────────────────────

/// A typed handle on one entry of the context store.
///
/// ```rust
/// use harrow::{Context, Key};
///
/// pub struct User { pub name: String }
/// pub const USER: Key<User> = Key::new("user");
///
/// fn greet(c: &mut Context) -> Result<(), harrow::Error> {
///     let name = USER.get(c).map_or("guest", |u| u.name.as_str()).to_owned();
///     c.string(http::StatusCode::OK, &format!("hello {name}"))
/// }
/// ```
pub struct Key<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: Any + Send + Sync> Key<T> {
    /// The stored value, if present and of type `T`.
    pub fn get<'c>(&self, c: &'c Context) -> Option<&'c T> {
        c.get(self.name)?.downcast_ref()
    }

    pub fn set(&self, c: &mut Context, value: T) {
        c.set(self.name, value);
    }
}
