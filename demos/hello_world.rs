use pico_web::{Handler, HandlerError, Request, Response, Server, StatusCode};

struct HelloWorld;

impl Handler for HelloWorld {
    type Output = ();

    async fn handle(&self, _: &mut Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        resp.status(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .body("Hello, world!");
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), pico_web::Error> {
    tracing_subscriber::fmt::init();

    let mut server = Server::new();
    server.get("/", HelloWorld)?;

    server.run("127.0.0.1", 8080).await
}
