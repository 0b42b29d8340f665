//! Radix-tree request router.
//!
//! One tree per HTTP method, O(path-length) lookup. Patterns use the classic
//! colon syntax and are translated to [`matchit`]'s brace syntax on
//! registration:
//!
//! | Pattern segment | Matches | Bound value |
//! |---|---|---|
//! | `users` | the literal segment | nothing |
//! | `:id` | exactly one segment | the segment |
//! | `*path` (last only) | the rest of the path, possibly empty | the rest, with its leading `/` |
//!
//! At every node a literal beats a parameter and a parameter beats a
//! wildcard. Two patterns that would match the same concrete path at the same
//! priority (`/users/:id` and `/users/:name`) are rejected at registration.

use std::collections::HashMap;
use std::sync::Arc;

use matchit::Router as MatchitRouter;
use tracing::debug;

use crate::error::Error;
use crate::handler::BoxedHandler;
use crate::method::Method;

/// Path parameters bound by a match, in the order they appear in the pattern.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    /// Linear lookup; patterns are a handful of segments deep.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub(crate) fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// What a tree leaf stores: the handler, and the wildcard name if the
/// pattern ends in one.
struct Route {
    handler: BoxedHandler,
    wildcard: Option<String>,
    /// Set on the bare prefix of a wildcard pattern (`/files/` for
    /// `/files/*path`), which binds the wildcard to `/`.
    empty_tail: bool,
}

/// The application router.
///
/// Build it once at startup. Registration is not synchronised; lookups are
/// read-only and safe from any number of threads.
#[derive(Default)]
pub struct Router {
    routes: HashMap<Method, MatchitRouter<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method` + `pattern`.
    ///
    /// Fails if the pattern is malformed or ambiguous with one already
    /// registered for the same method.
    pub fn add(&mut self, method: Method, pattern: &str, handler: BoxedHandler) -> Result<(), Error> {
        let (translated, wildcard) = translate(pattern)?;
        let conflict = |e: matchit::InsertError| Error::Route { pattern: pattern.to_owned(), reason: e.to_string() };
        let tree = self.routes.entry(method).or_default();

        let bare = wildcard.as_ref().map(|name| {
            let prefix = translated[..translated.len() - name.len() - 3].to_owned();
            (prefix, Route { handler: Arc::clone(&handler), wildcard: wildcard.clone(), empty_tail: true })
        });
        tree.insert(translated.as_str(), Route { handler, wildcard, empty_tail: false })
            .map_err(conflict)?;
        if let Some((prefix, route)) = bare {
            if let Err(e) = tree.insert(prefix, route) {
                tree.remove(&translated);
                return Err(conflict(e));
            }
        }
        debug!(%method, pattern, "route registered");
        Ok(())
    }

    /// Finds the handler for a concrete path and binds its parameters.
    ///
    /// `None` is not an error here: the engine decides between 404 and 405.
    pub fn resolve(&self, method: Method, path: &str) -> Option<(BoxedHandler, Params)> {
        let tree = self.routes.get(&method)?;
        let matched = tree.at(path).ok()?;
        let route = matched.value;
        let mut params: Params = matched
            .params
            .iter()
            .map(|(k, v)| match &route.wildcard {
                Some(w) if w == k => (k.to_owned(), format!("/{v}")),
                _ => (k.to_owned(), v.to_owned()),
            })
            .collect();
        if let (true, Some(name)) = (route.empty_tail, &route.wildcard) {
            params.push(name.as_str(), "/");
        }
        Some((Arc::clone(&route.handler), params))
    }

    /// Whether any routable method has a route for `path`. A miss that still
    /// answers `true` here is a 405, not a 404.
    pub fn any_method_matches(&self, path: &str) -> bool {
        Method::ALL.iter().any(|m| {
            self.routes
                .get(m)
                .is_some_and(|tree| tree.at(path).is_ok())
        })
    }
}

/// Converts `/users/:id/*rest` into `/users/{id}/{*rest}`, escaping literal
/// braces, and reports the wildcard name.
fn translate(pattern: &str) -> Result<(String, Option<String>), Error> {
    let invalid = |reason: &str| Error::Route { pattern: pattern.to_owned(), reason: reason.to_owned() };

    if !pattern.starts_with('/') {
        return Err(invalid("path must begin with '/'"));
    }

    let mut out = String::with_capacity(pattern.len() + 4);
    let mut wildcard = None;
    let segments: Vec<&str> = pattern[1..].split('/').collect();
    let last = segments.len() - 1;

    for (i, seg) in segments.iter().enumerate() {
        out.push('/');
        if let Some(name) = seg.strip_prefix(':') {
            if name.is_empty() {
                return Err(invalid("parameter needs a name"));
            }
            out.push('{');
            out.push_str(name);
            out.push('}');
        } else if let Some(name) = seg.strip_prefix('*') {
            if name.is_empty() {
                return Err(invalid("wildcard needs a name"));
            }
            if i != last {
                return Err(invalid("wildcard must be the last segment"));
            }
            out.push_str("{*");
            out.push_str(name);
            out.push('}');
            wildcard = Some(name.to_owned());
        } else {
            for ch in seg.chars() {
                match ch {
                    '{' => out.push_str("{{"),
                    '}' => out.push_str("}}"),
                    _ => out.push(ch),
                }
            }
        }
    }

    Ok((out, wildcard))
}
