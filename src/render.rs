//! Template rendering seam.
//!
//! harrow does not interpret templates. A rendering collaborator implements
//! [`Renderer`] and is registered with
//! [`Engine::set_renderer`](crate::Engine::set_renderer); handlers call
//! [`Context::render`](crate::Context::render).

use std::io;

use crate::error::Error;

/// Template variables.
pub type Vars = serde_json::Map<String, serde_json::Value>;

pub trait Renderer: Send + Sync + 'static {
    /// Renders template `name` with `vars` into `out`.
    fn render(&self, out: &mut dyn io::Write, name: &str, vars: &Vars) -> Result<(), Error>;
}
