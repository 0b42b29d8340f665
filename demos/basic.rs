//! Minimal harrow example: path parameters, wildcards, JSON, forms, cookies
//! and panic recovery.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic -- --port 3000
//!
//! Try:
//!   curl http://localhost:3000/test/hello
//!   curl http://localhost:3000/users/42?pretty
//!   curl -X DELETE http://localhost:3000/users/42      # 405
//!   curl http://localhost:3000/files/css/site.css
//!   curl -d 'name=alice' http://localhost:3000/users
//!   curl http://localhost:3000/panic                   # 500, logged

use clap::Parser;
use cookie::Cookie;
use harrow::{middleware, Context, Engine, Error, HttpError, Options, Server};
use http::StatusCode;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Serialize)]
struct User {
    id: u64,
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Options::parse().into_config();
    let mut engine = Engine::new(config);

    engine
        .use_middleware(middleware::access_log)
        .use_middleware(middleware::recover)
        .get("/test/:arg", |c| {
            let arg = c.param("arg").unwrap_or_default().to_owned();
            c.string(StatusCode::OK, &arg)
        })
        .get("/panic", |_| panic!("this handler always panics"))
        .get("/users/:id", get_user)
        .post("/users", create_user)
        .get("/files/*path", |c| {
            let path = c.param("path").unwrap_or("/").to_owned();
            c.string(StatusCode::OK, &format!("would serve {path}"))
        });

    Server::new(engine).run().await
}

// GET /users/:id
fn get_user(c: &mut Context) -> Result<(), Error> {
    let id = c
        .param("id")
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| HttpError::BAD_REQUEST.with_message("id must be a number"))?;
    c.json(StatusCode::OK, &User { id, name: "alice".to_owned() })
}

// POST /users  (application/x-www-form-urlencoded or multipart/form-data)
fn create_user(c: &mut Context) -> Result<(), Error> {
    let name = c
        .form_params()?
        .get("name")
        .map(str::to_owned)
        .ok_or_else(|| HttpError::BAD_REQUEST.with_message("name is required"))?;

    c.set_cookie(&Cookie::build(("last_created", name.clone())).path("/").http_only(true).build())?;
    c.response_mut().set_header(http::header::LOCATION, "/users/99")?;
    c.json(StatusCode::CREATED, &User { id: 99, name })
}
