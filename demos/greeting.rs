//! Path parameters, cookies and redirects.
//!
//! ```text
//! curl -i http://127.0.0.1:8080/hello/Ada
//! curl -i --cookie "name=Ada" http://127.0.0.1:8080/
//! ```

use pico_web::{handler_fn, Cookie, Server, StatusCode};
use std::time::Duration;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), pico_web::Error> {
    tracing_subscriber::fmt::init();

    let mut server = Server::new();
    server
        .get("/", handler_fn(|req, resp| {
            match req.cookie("name") {
                Some(name) => format!("Welcome back, {name}!"),
                None => {
                    resp.redirect("/hello/stranger");
                    String::new()
                }
            }
        }))?
        .get("/hello/{name}", handler_fn(|req, resp| {
            let name = req.param("name").unwrap_or("stranger").to_owned();
            resp.set_cookie(
                Cookie::new("name", name.clone())
                    .max_age(Duration::from_secs(3600))
                    .path("/")
                    .http_only(),
            );
            (format!("Hello, {name}!"), StatusCode::Ok)
        }))?
        .get("/files/{*path}", handler_fn(|req, _| {
            format!("You asked for {}", req.param("path").unwrap_or_default())
        }))?;

    server.run("127.0.0.1", 8080).await
}
