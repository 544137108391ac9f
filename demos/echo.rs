//! JSON and form echo service.
//!
//! ```text
//! curl -d '{"name":"lamp","value":3}' http://127.0.0.1:8080/json
//! curl -d 'name=lamp&value=3' http://127.0.0.1:8080/form
//! ```

use pico_web::{Handler, HandlerError, Json, Request, Response, Server};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize, Serialize)]
struct Reading {
    name: String,
    value: i64,
}

struct JsonEcho;

impl Handler for JsonEcho {
    type Output = Json<Reading>;

    async fn handle(&self, req: &mut Request<'_>, _: &mut Response) -> Result<Json<Reading>, HandlerError> {
        Ok(Json(req.json().await?))
    }
}

struct FormEcho;

impl Handler for FormEcho {
    type Output = Json<BTreeMap<String, String>>;

    async fn handle(&self, req: &mut Request<'_>, _: &mut Response) -> Result<Self::Output, HandlerError> {
        let form = req.form().await?;
        let fields = form
            .iter()
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();
        Ok(Json(fields))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), pico_web::Error> {
    tracing_subscriber::fmt::init();

    let mut server = Server::new();
    server.post("/json", JsonEcho)?.post("/form", FormEcho)?;

    server.run("127.0.0.1", 8080).await
}
