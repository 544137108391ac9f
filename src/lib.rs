//! pico_web - Minimal async HTTP/1.1 server with bounded per-connection memory
//!
//! A small routing HTTP server for devices with tens of kilobytes of RAM and
//! for ordinary hosts alike. Every connection reads through one fixed-size
//! buffer from a bounded pool, so memory use is known before the first
//! request arrives.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, pipelining, `Content-Length` bodies
//! - **HTTP/1.0**: closes after each response unless `Connection: keep-alive`
//! - No chunked transfer encoding (`501 Not Implemented`), no TLS, no HTTP/2
//!
//! # Features
//!
//! - **Routing** - literal, `{param}` and `{*wildcard}` segments, automatic
//!   `HEAD`, `OPTIONS` and `405` with `Allow`
//! - **Static files** - streamed in small chunks, never outside the mount root
//! - **Streaming bodies** - large request bodies stay on the socket until read
//! - **Timeouts** - idle, read, write and connection lifetime limits
//! - **Responders** - return strings, bytes, tuples or [`Json`] from handlers
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use pico_web::{handler_fn, Server};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), pico_web::Error> {
//!     let mut server = Server::new();
//!     server.get("/hello", handler_fn(|_, _| ("Hello, world!", 201)))?;
//!
//!     server.run("0.0.0.0", 8080).await
//! }
//! ```
//! Handlers with state and request bodies:
//! ```no_run
//! use pico_web::{Handler, HandlerError, Json, Request, Response, Server};
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! struct Counter(AtomicU32);
//!
//! impl Handler for Counter {
//!     type Output = Json<u32>;
//!
//!     async fn handle(&self, req: &mut Request<'_>, _: &mut Response) -> Result<Json<u32>, HandlerError> {
//!         let step: u32 = req.text().await?.trim().parse()?;
//!         Ok(Json(self.0.fetch_add(step, Ordering::Relaxed) + step))
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), pico_web::Error> {
//!     let mut server = Server::new();
//!     server
//!         .post("/counter", Counter(AtomicU32::new(0)))?
//!         .add_static_route("/", "./public")?;
//!
//!     server.run("0.0.0.0", 80).await
//! }
//! ```
//! Tight limits for a small device:
//! ```no_run
//! use pico_web::{handler_fn, Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), pico_web::Error> {
//!     let mut server = Server::new();
//!     server
//!         .server_limits(ServerLimits {
//!             max_connections: 2,
//!             json_errors: false, // Empty error bodies
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             keep_alive_timeout: Duration::from_secs(1),
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             buffer_size: 512,
//!             body_size: 256,
//!             ..ReqLimits::default()
//!         })
//!         .get("/led", handler_fn(|_, _| "on"))?;
//!
//!     server.run("0.0.0.0", 80).await
//! }
//! ```

pub(crate) mod http {
    pub mod query;
    pub(crate) mod reader;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
    pub(crate) mod writer;
}
pub(crate) mod server {
    pub(crate) mod access_log;
    pub(crate) mod connection;
    pub(crate) mod pool;
    pub(crate) mod router;
    pub(crate) mod server_impl;
    pub(crate) mod static_files;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::{Error, HandlerError, Limit},
    http::{
        query,
        query::QueryMap,
        reader::ByteStreamReader,
        request::{ParseState, Request, RequestBody, RequestParser},
        response::{
            BodyProducer, BodyWriter, Cookie, IntoStatus, Json, Responder, Response, WriteBuffer,
        },
        types::{Headers, Method, StatusCode, Version},
    },
    server::{
        access_log::{AccessEvent, AccessLog, NoAccessLog, TracingAccessLog},
        server_impl::{handler_fn, FnHandler, Handler, Server},
        static_files::{mime_type, resolve as resolve_static, StaticFile},
    },
};

/// Runs `f` on a detached `GET /` request and a fresh response.
#[doc(hidden)]
pub fn run_test<F: FnOnce(&mut Request<'_>, &mut Response)>(f: F) {
    run_test_with("/", f)
}

/// Like [`run_test`] with a custom request target.
#[doc(hidden)]
pub fn run_test_with<F: FnOnce(&mut Request<'_>, &mut Response)>(target: &str, f: F) {
    if let Ok(mut request) = Request::detached(Method::Get, target) {
        f(
            &mut request,
            &mut Response::new(&limits::RespLimits::default()),
        );
    }
}

#[cfg(test)]
pub mod tools {
    use std::str::from_utf8;

    #[inline]
    pub fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}
