use crate::{
    http::{
        reader::ByteStreamReader,
        request::{Request, RequestParser},
        response::{allow_value, Response},
        types::Version,
        writer::{ResponseWriter, WriteContext},
    },
    server::{
        access_log::AccessEvent,
        router::Resolution,
        server_impl::{DynHandler, Shared},
    },
    Error, Method, StatusCode,
};
use futures::FutureExt;
use std::{
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Instant,
};
use tokio::io::{split, AsyncRead, AsyncWrite};
use tracing::{debug, error, warn};

/// Serves one accepted connection until it closes.
///
/// Requests are answered strictly in order. The task ends when either side
/// asks to close, the connection expires, the peer goes away or a request
/// can't be parsed. Nothing here is fatal to the server.
pub(crate) async fn serve_connection<S>(shared: Arc<Shared>, stream: S, client_addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = split(stream);
    let mut writer = ResponseWriter::new(
        write_half,
        &shared.resp_limits,
        shared.conn_limits.socket_write_timeout,
    );

    let Some(buffer) = shared.pool.acquire() else {
        warn!(%client_addr, "All connection buffers are busy, answering 503");
        let response = Response::from_error(
            &Error::ServiceUnavailable,
            &shared.resp_limits,
            shared.json_errors,
        );
        let _ = writer.write(response, REJECT).await;
        writer.shutdown().await;
        return;
    };

    let reader = ByteStreamReader::with_buffer(read_half, buffer, shared.conn_limits.socket_read_timeout);
    let mut connection = Connection {
        shared: &shared,
        parser: RequestParser::new(shared.req_limits.clone()),
        reader,
        client_addr,
        created: Instant::now(),
        request_count: 0,
    };

    connection.run(&mut writer).await;
    writer.shutdown().await;
}

/// Context for answers to requests that could not be parsed.
const REJECT: WriteContext = WriteContext {
    version: Version::Http11,
    head_only: false,
    keep_alive: false,
};

struct Connection<'s> {
    shared: &'s Shared,
    parser: RequestParser,
    reader: ByteStreamReader,
    client_addr: SocketAddr,
    created: Instant,
    request_count: usize,
}

impl Connection<'_> {
    async fn run<W: AsyncWrite + Unpin>(&mut self, writer: &mut ResponseWriter<W>) {
        let shared = self.shared;

        loop {
            let idle = match self.request_count {
                0 => shared.conn_limits.socket_read_timeout,
                _ => shared.conn_limits.keep_alive_timeout,
            };
            // Idle clients are dropped without an answer
            if self.reader.wait_for_data(idle).await.is_err() {
                return;
            }

            let started = Instant::now();
            self.request_count += 1;
            let expired = self.is_expired();

            let mut request = match self.parser.parse(&mut self.reader, self.client_addr).await {
                Ok(request) => request,
                Err(err) => {
                    if !err.is_silent() {
                        debug!(client_addr = %self.client_addr, cause = %err, "Rejected request");
                        let response = Response::from_error(&err, &shared.resp_limits, shared.json_errors);
                        let _ = writer.write(response, REJECT).await;
                    }
                    return;
                }
            };

            let mut response = Response::new(&shared.resp_limits);
            // The peer left while the handler was reading its body
            if !dispatch(shared, &mut request, &mut response).await {
                return;
            }

            let drained = match request.drain().await {
                Ok(()) => true,
                Err(err) => {
                    debug!(client_addr = %self.client_addr, cause = %err, "Failed to discard request body");
                    false
                }
            };

            if shared.server_timing {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                response.header("server-timing", format!("req;dur={elapsed:.3}"));
            }

            let ctx = WriteContext {
                version: request.version(),
                head_only: request.method() == Method::Head,
                keep_alive: request.keep_alive() && drained && !expired,
            };
            let status = response.status_code();
            let written = writer.write(response, ctx).await;

            shared.access_log.record(&AccessEvent {
                client_addr: self.client_addr,
                method: request.method(),
                path: request.path().to_owned(),
                status,
                duration: started.elapsed(),
            });

            match written {
                Ok(true) => continue,
                Ok(false) | Err(_) => return,
            }
        }
    }

    /// Whether the current request is the last one this connection may serve.
    #[inline]
    fn is_expired(&self) -> bool {
        let limits = &self.shared.conn_limits;
        self.request_count >= limits.max_requests_per_connection
            || self.created.elapsed() > limits.connection_lifetime
    }
}

/// Routes `request` and runs its handler; failures become error responses.
///
/// Returns `false` when the connection is gone and nothing can be answered.
async fn dispatch(shared: &Shared, request: &mut Request<'_>, response: &mut Response) -> bool {
    let result = match shared.router.resolve(request.method(), request.raw_path()) {
        Ok(Resolution::Options { allowed }) => {
            response
                .status(StatusCode::NoContent)
                .header("allow", allow_value(&allowed));
            Ok(())
        }
        Ok(Resolution::Handler { handler, params, .. }) => {
            request.set_params(params);
            invoke(handler, request, response).await
        }
        Err(err) => Err(err),
    };

    if let Err(err) = result {
        if err.is_silent() {
            debug!(client_addr = %request.client_addr(), "Connection closed during handler");
            return false;
        }
        if let Error::HandlerFailure(cause) = &err {
            error!(
                client_addr = %request.client_addr(),
                method = %request.method(),
                path = request.path(),
                %cause,
                "Handler failed"
            );
        }
        *response = Response::from_error(&err, &shared.resp_limits, shared.json_errors);
    }
    true
}

async fn invoke(
    handler: &dyn DynHandler,
    request: &mut Request<'_>,
    response: &mut Response,
) -> Result<(), Error> {
    match AssertUnwindSafe(handler.call(request, response)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(Error::handler("handler panicked")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler_fn,
        limits::{ConnLimits, ReqLimits, ServerLimits},
        Handler, HandlerError, NoAccessLog, Server,
    };
    use std::{
        sync::Mutex,
        time::Duration,
    };
    use tokio::{
        io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
        task::yield_now,
    };

    const CLIENT: SocketAddr = SocketAddr::V4(std::net::SocketAddrV4::new(
        std::net::Ipv4Addr::new(10, 0, 0, 2),
        5000,
    ));

    struct Upload;

    impl Handler for Upload {
        type Output = String;

        async fn handle(&self, req: &mut Request<'_>, _: &mut Response) -> Result<String, HandlerError> {
            Ok(format!("got {} bytes", req.bytes().await?.len()))
        }
    }

    fn server() -> Server {
        let mut server = Server::new();
        server
            .access_log(NoAccessLog)
            .get("/hello", handler_fn(|_, _| ("Hello, world!", 201)))
            .unwrap()
            .get("/users/{id}", handler_fn(|req, _| format!("user {}", req.param("id").unwrap_or("?"))))
            .unwrap()
            .get("/private", handler_fn(|_, _| Err::<(), _>(Error::Forbidden)))
            .unwrap()
            .get("/panic", handler_fn(|_, _| -> &'static str { panic!("boom") }))
            .unwrap()
            .post("/upload", Upload)
            .unwrap()
            .get("/bye", handler_fn(|_, resp| {
                resp.header("Connection", "close");
                "bye"
            }))
            .unwrap()
            .get("/bye/tuple", handler_fn(|_, _| ("bye", 200u16, [("connection", "close")])))
            .unwrap();
        server
    }

    fn connect(shared: &Arc<Shared>) -> DuplexStream {
        let (client, stream) = duplex(16 * 1024);
        tokio::spawn(serve_connection(Arc::clone(shared), stream, CLIENT));
        client
    }

    async fn exchange(shared: &Arc<Shared>, request: &[u8]) -> String {
        let mut client = connect(shared);
        client.write_all(request).await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn answers() {
        let shared = Arc::new(server().into_shared());

        #[rustfmt::skip]
        let cases = [
            (
                "GET /hello HTTP/1.1\r\nconnection: close\r\n\r\n",
                "HTTP/1.1 201 Created\r\ncontent-type: text/plain\r\ncontent-length: 13\r\n\
                 connection: close\r\n\r\nHello, world!",
            ),
            (
                "GET /users/a%20b HTTP/1.0\r\n\r\n",
                "HTTP/1.0 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 8\r\n\
                 connection: close\r\n\r\nuser a b",
            ),
            (
                "HEAD /hello HTTP/1.1\r\nconnection: close\r\n\r\n",
                "HTTP/1.1 201 Created\r\ncontent-type: text/plain\r\ncontent-length: 13\r\n\
                 connection: close\r\n\r\n",
            ),
            (
                "OPTIONS /hello HTTP/1.1\r\nconnection: close\r\n\r\n",
                "HTTP/1.1 204 No Content\r\nallow: GET, HEAD, OPTIONS\r\nconnection: close\r\n\r\n",
            ),
            (
                "GET /missing HTTP/1.1\r\n\r\n",
                "HTTP/1.1 404 Not Found\r\ncontent-type: application/json\r\ncontent-length: 40\r\n\
                 connection: close\r\n\r\n{\"error\":\"Not found\",\"code\":\"NOT_FOUND\"}",
            ),
            (
                "DELETE /hello HTTP/1.1\r\n\r\n",
                "HTTP/1.1 405 Method Not Allowed\r\nallow: GET, HEAD, OPTIONS\r\n\
                 content-type: application/json\r\ncontent-length: 58\r\nconnection: close\r\n\r\n\
                 {\"error\":\"Method not allowed\",\"code\":\"METHOD_NOT_ALLOWED\"}",
            ),
            (
                "GET /private HTTP/1.1\r\n\r\n",
                "HTTP/1.1 403 Forbidden\r\ncontent-type: application/json\r\ncontent-length: 40\r\n\
                 connection: close\r\n\r\n{\"error\":\"Forbidden\",\"code\":\"FORBIDDEN\"}",
            ),
            (
                "GARBAGE\r\n\r\n",
                "HTTP/1.1 400 Bad Request\r\ncontent-type: application/json\r\ncontent-length: 56\r\n\
                 connection: close\r\n\r\n{\"error\":\"Malformed request\",\"code\":\"MALFORMED_REQUEST\"}",
            ),
        ];

        for (request, expected) in cases {
            assert_eq!(exchange(&shared, request.as_bytes()).await, expected, "{request:?}");
        }
    }

    #[tokio::test]
    async fn handler_failures_are_contained() {
        let shared = Arc::new(server().into_shared());

        let out = exchange(&shared, b"GET /panic HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{out}");
        assert!(out.ends_with("\"code\":\"INTERNAL_ERROR\"}"), "{out}");

        let out = exchange(&shared, b"GET /hello HTTP/1.1\r\nconnection: close\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 201 Created\r\n"), "{out}");
    }

    #[tokio::test]
    async fn keep_alive_and_pipelining() {
        let shared = Arc::new(server().into_shared());

        let out = exchange(
            &shared,
            b"GET /hello HTTP/1.1\r\n\r\n\
              GET /users/7 HTTP/1.1\r\n\r\n\
              GET /hello HTTP/1.1\r\nconnection: close\r\n\r\n",
        )
        .await;

        assert_eq!(out.matches("HTTP/1.1 201 Created").count(), 2, "{out}");
        assert_eq!(out.matches("user 7").count(), 1);
        assert_eq!(out.matches("connection: close").count(), 1);
        assert!(out.ends_with("connection: close\r\n\r\nHello, world!"));
    }

    #[tokio::test]
    async fn request_limit_per_connection() {
        let mut server = server();
        server.connection_limits(ConnLimits {
            max_requests_per_connection: 2,
            ..ConnLimits::default()
        });
        let shared = Arc::new(server.into_shared());

        let out = exchange(&shared, "GET /hello HTTP/1.1\r\n\r\n".repeat(3).as_bytes()).await;
        assert_eq!(out.matches("HTTP/1.1 201 Created").count(), 2, "{out}");
        assert_eq!(out.matches("connection: close").count(), 1);
    }

    #[tokio::test]
    async fn streamed_and_unread_bodies() {
        let mut server = server();
        server.request_limits(ReqLimits {
            eager_body_size: 16,
            ..ReqLimits::default()
        });
        let shared = Arc::new(server.into_shared());

        let body = "x".repeat(3000);
        let request = format!(
            "POST /upload HTTP/1.1\r\ncontent-length: 3000\r\n\r\n{body}\
             GET /hello HTTP/1.1\r\ncontent-length: 3000\r\n\r\n{body}\
             GET /hello HTTP/1.1\r\nconnection: close\r\n\r\n"
        );

        let out = exchange(&shared, request.as_bytes()).await;
        assert_eq!(out.matches("got 3000 bytes").count(), 1, "{out}");
        assert_eq!(out.matches("Hello, world!").count(), 2, "{out}");
    }

    #[tokio::test]
    async fn handler_declared_close() {
        let shared = Arc::new(server().into_shared());

        for path in ["/bye", "/bye/tuple"] {
            let request = format!("GET {path} HTTP/1.1\r\n\r\nGET /hello HTTP/1.1\r\n\r\n");
            let out = exchange(&shared, request.as_bytes()).await;
            assert_eq!(
                out,
                "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 3\r\n\
                 connection: close\r\n\r\nbye",
                "{path}"
            );
        }
    }

    #[tokio::test]
    async fn peer_gone_mid_body_is_silent() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut server = server();
        server
            .request_limits(ReqLimits {
                eager_body_size: 16,
                ..ReqLimits::default()
            })
            .access_log({
                let events = Arc::clone(&events);
                move |event: &AccessEvent| events.lock().unwrap().push(event.clone())
            });
        let shared = Arc::new(server.into_shared());

        let mut client = connect(&shared);
        client
            .write_all(b"POST /upload HTTP/1.1\r\ncontent-length: 3000\r\n\r\n0123456789")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty(), "{:?}", String::from_utf8_lossy(&out));
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let shared = Arc::new(server().into_shared());

        let out = exchange(&shared, b"POST /upload HTTP/1.1\r\ncontent-length: 999999\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{out}");
        assert!(out.contains("connection: close\r\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts() {
        let shared = Arc::new(server().into_shared());

        // Silent client: closed without an answer
        let mut client = connect(&shared);
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());

        // Partial request: 408
        let mut client = connect(&shared);
        client.write_all(b"GET /hello HTTP/1.1\r\nhost: x\r\n").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("HTTP/1.1 408 Request Timeout\r\n"), "{out}");

        // Idle keep-alive connection: closed after the answer
        let mut client = connect(&shared);
        client.write_all(b"GET /hello HTTP/1.1\r\n\r\n").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.ends_with("\r\n\r\nHello, world!"), "{out}");
    }

    #[tokio::test]
    async fn slow_client_does_not_block_others() {
        let shared = Arc::new(server().into_shared());

        let mut slow = connect(&shared);
        slow.write_all(b"GET /hel").await.unwrap();

        let out = exchange(&shared, b"GET /users/2 HTTP/1.1\r\nconnection: close\r\n\r\n").await;
        assert!(out.ends_with("user 2"), "{out}");

        slow.write_all(b"lo HTTP/1.1\r\nconnection: close\r\n\r\n").await.unwrap();
        let mut out = Vec::new();
        slow.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().ends_with("Hello, world!"));
    }

    #[tokio::test]
    async fn busy_pool_answers_503() {
        let mut server = server();
        server.server_limits(ServerLimits {
            max_connections: 1,
            ..ServerLimits::default()
        });
        let shared = Arc::new(server.into_shared());

        let mut first = connect(&shared);
        while shared.pool.available() > 0 {
            yield_now().await;
        }

        let out = exchange(&shared, b"GET /hello HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{out}");
        assert!(out.ends_with("\"code\":\"SERVICE_UNAVAILABLE\"}"), "{out}");

        first.write_all(b"GET /hello HTTP/1.1\r\nconnection: close\r\n\r\n").await.unwrap();
        let mut out = Vec::new();
        first.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 201 Created\r\n"));

        while shared.pool.available() == 0 {
            yield_now().await;
        }
    }

    #[tokio::test]
    async fn completion_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut server = server();
        server
            .server_limits(ServerLimits {
                server_timing: true,
                ..ServerLimits::default()
            })
            .access_log({
                let events = Arc::clone(&events);
                move |event: &AccessEvent| events.lock().unwrap().push(event.clone())
            });
        let shared = Arc::new(server.into_shared());

        let out = exchange(&shared, b"GET /hello HTTP/1.1\r\n\r\nGET /nope%21 HTTP/1.1\r\n\r\n").await;
        assert_eq!(out.matches("server-timing: req;dur=").count(), 2, "{out}");

        exchange(&shared, b"BROKEN\r\n\r\n").await;

        let events = events.lock().unwrap();
        #[rustfmt::skip]
        let expected = [
            (Method::Get, "/hello", StatusCode::Created),
            (Method::Get, "/nope!", StatusCode::NotFound),
        ];

        assert_eq!(events.len(), expected.len());
        for (event, (method, path, status)) in events.iter().zip(expected) {
            assert_eq!(event.client_addr, CLIENT);
            assert_eq!(event.method, method);
            assert_eq!(event.path, path);
            assert_eq!(event.status, status);
            assert!(event.duration < Duration::from_secs(5));
        }
    }
}
