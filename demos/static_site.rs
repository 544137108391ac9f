//! Serves `./public` under `/` with a small API next to it.
//!
//! ```text
//! cargo run --example static_site -- ./public
//! curl http://127.0.0.1:8080/index.html
//! curl http://127.0.0.1:8080/api/uptime
//! ```

use pico_web::{handler_fn, limits::RespLimits, Json, Server};
use std::{collections::HashMap, time::Instant};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), pico_web::Error> {
    tracing_subscriber::fmt::init();

    let root = std::env::args().nth(1).unwrap_or_else(|| "./public".to_owned());
    let started = Instant::now();

    let mut server = Server::new();
    server
        .response_limits(RespLimits {
            file_chunk_size: 1024,
            ..RespLimits::default()
        })
        // Explicit routes win over the mount below
        .get("/api/uptime", handler_fn(move |_, _| {
            Json(HashMap::from([("uptime_secs", started.elapsed().as_secs())]))
        }))?
        .add_static_route("/", root)?;

    server.run("127.0.0.1", 8080).await
}
