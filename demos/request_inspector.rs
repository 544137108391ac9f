//! Answers every request with a JSON description of it.

use pico_web::{Handler, HandlerError, Json, Method, Request, Response, Server};
use serde_json::{json, Value};

struct Inspector;

impl Handler for Inspector {
    type Output = Json<Value>;

    async fn handle(&self, req: &mut Request<'_>, _: &mut Response) -> Result<Json<Value>, HandlerError> {
        let headers: Vec<_> = req.headers().iter().map(|(n, v)| json!([n, v])).collect();
        let query: Vec<_> = req.query_map().iter().map(|(k, v)| json!([k, v])).collect();

        let mut info = json!({
            "method": req.method().as_str(),
            "version": req.version().as_str(),
            "path": req.path(),
            "client": req.client_addr().to_string(),
            "user_agent": req.user_agent(),
            "query": query,
            "headers": headers,
        });
        info["body"] = json!(String::from_utf8_lossy(req.bytes().await?));

        Ok(Json(info))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), pico_web::Error> {
    tracing_subscriber::fmt::init();

    let mut server = Server::new();
    for method in [Method::Get, Method::Post, Method::Put, Method::Delete, Method::Patch] {
        server.add_route(method, "/{*path}", Inspector)?;
    }

    server.run("127.0.0.1", 8080).await
}
