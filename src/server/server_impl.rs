use crate::{
    http::{request::Request, response::{Responder, Response}},
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits},
    server::{
        access_log::{AccessLog, TracingAccessLog},
        connection,
        pool::BufferPool,
        router::Router,
        static_files::StaticFiles,
    },
    Error, HandlerError, Method,
};
use futures::future::BoxFuture;
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    fmt,
    future::{ready, Future},
    marker::PhantomData,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{lookup_host, TcpListener},
    time::sleep,
};
use tracing::{debug, info, warn};

/// A trait for handling HTTP requests and generating responses.
///
/// `&self` is shared by every connection, so it may hold read-only data
/// (configuration, lookup tables) or synchronized state.
///
/// The returned [`Output`](Handler::Output) is applied to the response
/// through [`Responder`]; a handler can also build everything on `response`
/// and return `()`.
///
/// # Errors
///
/// Returning a [`pico_web::Error`](crate::Error) answers with its status
/// (e.g. `Err(Error::NotFound.into())` is a 404). Any other error, and a
/// panic, is answered with `500 Internal Server Error`. The server keeps
/// running either way.
///
/// # Examples
///
/// ```
/// use pico_web::{Handler, HandlerError, Request, Response, StatusCode};
///
/// struct Sensor {
///     name: &'static str,
/// }
///
/// impl Handler for Sensor {
///     type Output = String;
///
///     async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<String, HandlerError> {
///         let unit = req.query("unit").unwrap_or("C");
///         resp.status(StatusCode::Ok).header("cache-control", "no-store");
///         Ok(format!("{}: 21.5 {unit}", self.name))
///     }
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Value applied to the response after the handler returns.
    type Output: Responder + Send;

    /// Processes one request.
    ///
    /// `request` has its path parameters set; a body larger than
    /// [`ReqLimits::eager_body_size`] is still on the socket and is read on
    /// demand. Whatever the handler leaves unread is discarded afterwards.
    fn handle(
        &self,
        request: &mut Request<'_>,
        response: &mut Response,
    ) -> impl Future<Output = Result<Self::Output, HandlerError>> + Send;
}

/// Object-safe form of [`Handler`] stored in the router.
pub(crate) trait DynHandler: Send + Sync + 'static {
    fn call<'a, 'r>(
        &'a self,
        request: &'a mut Request<'r>,
        response: &'a mut Response,
    ) -> BoxFuture<'a, Result<(), Error>>;
}

impl<H: Handler> DynHandler for H {
    fn call<'a, 'r>(
        &'a self,
        request: &'a mut Request<'r>,
        response: &'a mut Response,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let output = self
                .handle(request, response)
                .await
                .map_err(Error::from_handler)?;
            output.respond_to(response).map_err(Error::from_handler)
        })
    }
}

/// Turns a synchronous closure into a [`Handler`].
///
/// Suits handlers that never read a streamed body.
///
/// # Examples
///
/// ```
/// use pico_web::{handler_fn, Method, Server};
///
/// let mut server = Server::new();
/// server
///     .add_route(Method::Get, "/hello/{name}", handler_fn(|req, _| {
///         format!("Hello, {}!", req.param("name").unwrap_or("stranger"))
///     }))
///     .unwrap();
/// ```
pub fn handler_fn<F, R>(f: F) -> FnHandler<F, R>
where
    F: Fn(&mut Request<'_>, &mut Response) -> R + Send + Sync + 'static,
    R: Responder + Send + 'static,
{
    FnHandler(f, PhantomData)
}

/// [`Handler`] returned by [`handler_fn`].
pub struct FnHandler<F, R>(F, PhantomData<fn() -> R>);

impl<F, R> fmt::Debug for FnHandler<F, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnHandler")
    }
}

impl<F, R> Handler for FnHandler<F, R>
where
    F: Fn(&mut Request<'_>, &mut Response) -> R + Send + Sync + 'static,
    R: Responder + Send + 'static,
{
    type Output = R;

    #[inline]
    fn handle(
        &self,
        request: &mut Request<'_>,
        response: &mut Response,
    ) -> impl Future<Output = Result<R, HandlerError>> + Send {
        ready(Ok((self.0)(request, response)))
    }
}

/// An HTTP server: the route table, the limits and the accept loop.
///
/// Routes and static mounts are registered on an owned `Server`;
/// [`run`](Server::run) and [`serve`](Server::serve) consume it, so the
/// table can't change once requests are served.
///
/// # Examples
///
/// ```no_run
/// use pico_web::{handler_fn, Method, Server};
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> Result<(), pico_web::Error> {
///     let mut server = Server::new();
///     server
///         .add_route(Method::Get, "/hello", handler_fn(|_, _| ("Hello, world!", 201)))?
///         .add_static_route("/static", "./public")?;
///
///     server.run("0.0.0.0", 8080).await
/// }
/// ```
pub struct Server {
    router: Router,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
    access_log: Arc<dyn AccessLog>,
}

/// Everything a connection task needs, shared by all of them.
pub(crate) struct Shared {
    pub(crate) router: Router,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
    pub(crate) json_errors: bool,
    pub(crate) server_timing: bool,
    pub(crate) access_log: Arc<dyn AccessLog>,
    pub(crate) pool: Arc<BufferPool>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("routes", &self.router)
            .field("server_limits", &self.server_limits)
            .field("conn_limits", &self.conn_limits)
            .field("req_limits", &self.req_limits)
            .field("resp_limits", &self.resp_limits)
            .finish_non_exhaustive()
    }
}

macro_rules! method_shorthands {
    ($($name:ident => $method:ident),*) => {
        $(
            #[doc = concat!("Shorthand for [`add_route`](Self::add_route) with [`Method::", stringify!($method), "`].")]
            #[inline]
            pub fn $name<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, Error> {
                self.add_route(Method::$method, pattern, handler)
            }
        )*
    };
}

impl Server {
    /// Creates a server without routes and with default limits.
    pub fn new() -> Self {
        Self {
            router: Router::default(),
            server_limits: ServerLimits::default(),
            conn_limits: ConnLimits::default(),
            req_limits: ReqLimits::default(),
            resp_limits: RespLimits::default(),
            access_log: Arc::new(TracingAccessLog),
        }
    }

    /// Sets admission limits and error format, see [`ServerLimits`].
    #[inline]
    pub fn server_limits(&mut self, limits: ServerLimits) -> &mut Self {
        self.server_limits = limits;
        self
    }

    /// Sets per-connection timeouts and request counts, see [`ConnLimits`].
    #[inline]
    pub fn connection_limits(&mut self, limits: ConnLimits) -> &mut Self {
        self.conn_limits = limits;
        self
    }

    /// Sets request parsing limits and the read buffer size, see [`ReqLimits`].
    #[inline]
    pub fn request_limits(&mut self, limits: ReqLimits) -> &mut Self {
        self.req_limits = limits;
        self
    }

    #[inline]
    pub fn response_limits(&mut self, limits: RespLimits) -> &mut Self {
        self.resp_limits = limits;
        self
    }

    /// Replaces the completion event sink (default: [`TracingAccessLog`]).
    #[inline]
    pub fn access_log<L: AccessLog>(&mut self, log: L) -> &mut Self {
        self.access_log = Arc::new(log);
        self
    }

    /// Registers `handler` for `method` requests matching `pattern`.
    ///
    /// # Errors
    /// - [`Error::InvalidPattern`] when the pattern does not start with `/`,
    ///   has an empty parameter name or a wildcard before the last segment
    /// - [`Error::RouteConflict`] when the method already has a route of the
    ///   same shape (`/users/{id}` and `/users/{name}` are the same shape)
    pub fn add_route<H: Handler>(
        &mut self,
        method: Method,
        pattern: &str,
        handler: H,
    ) -> Result<&mut Self, Error> {
        self.router.register(method, pattern, Box::new(handler))?;
        Ok(self)
    }

    method_shorthands! {
        get => Get,
        post => Post,
        put => Put,
        delete => Delete,
        patch => Patch
    }

    /// Serves the files below `root` under the URL `prefix`.
    ///
    /// `GET /static/css/site.css` with the prefix `/static` reads
    /// `<root>/css/site.css`; a directory serves its `index.html`. Paths
    /// leaving `root`, through `..` or symlinks, are answered with 403.
    ///
    /// The mount is a regular `GET <prefix>/{*path}` route: explicit routes
    /// below the prefix take precedence, and mounting the same prefix twice
    /// is a [`Error::RouteConflict`].
    pub fn add_static_route<P: Into<PathBuf>>(
        &mut self,
        prefix: &str,
        root: P,
    ) -> Result<&mut Self, Error> {
        let files = StaticFiles::new(prefix, root.into());
        let pattern = files.pattern();
        debug!(prefix, "Static mount registered");
        self.router.register(Method::Get, &pattern, Box::new(files))?;
        Ok(self)
    }

    /// Binds `host:port`, logs a startup line and serves until Ctrl-C.
    ///
    /// # Errors
    /// [`Error::Bind`] when the address can't be resolved or bound.
    pub async fn run(self, host: &str, port: u16) -> Result<(), Error> {
        let listener = self.bind(host, port).await?;
        info!("Starting server on {host}:{port}...");

        self.serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(cause = %e, "Ctrl-C handler unavailable, serving until killed");
                std::future::pending::<()>().await;
            }
            info!("Shutting down");
        })
        .await
    }

    /// Serves connections from an already bound `listener`, forever.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Error> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serves connections until `signal` completes.
    ///
    /// Connections in flight finish on their own tasks; only accepting stops.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send,
    {
        let shared = Arc::new(self.into_shared());
        tokio::pin!(signal);

        loop {
            let (stream, addr) = tokio::select! {
                biased;

                _ = &mut signal => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(cause = %e, "Failed to accept a connection");
                        sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(%addr, cause = %e, "Failed to set TCP_NODELAY");
            }
            tokio::spawn(connection::serve_connection(Arc::clone(&shared), stream, addr));
        }
    }

    pub(crate) fn into_shared(self) -> Shared {
        let pool = BufferPool::new(
            self.server_limits.max_connections,
            self.req_limits.buffer_size,
        );

        Shared {
            router: self.router,
            conn_limits: self.conn_limits,
            req_limits: self.req_limits,
            resp_limits: self.resp_limits,
            json_errors: self.server_limits.json_errors,
            server_timing: self.server_limits.server_timing,
            access_log: self.access_log,
            pool,
        }
    }

    async fn bind(&self, host: &str, port: u16) -> Result<TcpListener, Error> {
        let addr = format!("{host}:{port}");
        let bind_error = |source| Error::Bind {
            addr: addr.clone(),
            source,
        };

        let resolved = lookup_host(addr.as_str()).await.map_err(bind_error)?.next();
        let Some(resolved) = resolved else {
            return Err(bind_error(std::io::ErrorKind::AddrNotAvailable.into()));
        };

        let backlog = self.server_limits.max_pending_connections.min(i32::MAX as usize) as i32;
        listen(resolved, backlog).map_err(bind_error)
    }
}

fn listen(addr: SocketAddr, backlog: i32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        sync::oneshot,
    };

    /// Starts `server` on a free loopback port.
    async fn spawn(server: Server) -> (SocketAddr, oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();

        tokio::spawn(server.serve_with_shutdown(listener, async move {
            let _ = stopped.await;
        }));
        (addr, stop)
    }

    async fn exchange(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn registration_errors() {
        let mut server = Server::new();
        server
            .get("/hello", handler_fn(|_, _| "hi"))
            .unwrap()
            .add_static_route("/static", "./public")
            .unwrap();

        #[rustfmt::skip]
        let cases: [(Method, &str, fn(&Error) -> bool); 4] = [
            (Method::Get,  "/hello",          |e| matches!(e, Error::RouteConflict { .. })),
            (Method::Get,  "/static/{*rest}", |e| matches!(e, Error::RouteConflict { .. })),
            (Method::Post, "hello",           |e| matches!(e, Error::InvalidPattern { .. })),
            (Method::Post, "/a/{*b}/c",       |e| matches!(e, Error::InvalidPattern { .. })),
        ];

        for (method, pattern, expected) in cases {
            let err = server
                .add_route(method, pattern, handler_fn(|_, _| ()))
                .unwrap_err();
            assert!(expected(&err), "{method} {pattern}: {err}");
        }

        let err = server.add_static_route("/static/", "./other").unwrap_err();
        assert!(matches!(err, Error::RouteConflict { .. }));
    }

    #[tokio::test]
    async fn serves_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hi").unwrap();

        let mut server = Server::new();
        server
            .access_log(crate::NoAccessLog)
            .get("/hello", handler_fn(|_, _| ("Hello", 201)))
            .unwrap()
            .add_static_route("/static", dir.path())
            .unwrap();
        let (addr, stop) = spawn(server).await;

        #[rustfmt::skip]
        let cases = [
            ("GET /hello HTTP/1.1\r\nconnection: close\r\n\r\n",        "HTTP/1.1 201 Created\r\n",     "Hello"),
            ("GET /static/a.txt HTTP/1.0\r\n\r\n",                      "HTTP/1.0 200 OK\r\n",          "hi"),
            ("GET /missing HTTP/1.1\r\nconnection: close\r\n\r\n",      "HTTP/1.1 404 Not Found\r\n",   "NOT_FOUND\"}"),
            ("GARBAGE\r\n\r\n",                                         "HTTP/1.1 400 Bad Request\r\n", "MALFORMED_REQUEST\"}"),
        ];

        for (request, status_line, body_end) in cases {
            let out = exchange(addr, request).await;
            assert!(out.starts_with(status_line), "{request:?}: {out}");
            assert!(out.ends_with(body_end), "{request:?}: {out}");
        }

        let out = exchange(addr, "GET /static/a.txt HTTP/1.0\r\n\r\n").await;
        assert!(out.contains("content-type: text/plain\r\n"), "{out}");

        stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(Server::new().serve_with_shutdown(listener, async move {
            let _ = stopped.await;
        }));

        stop.send(()).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = Server::new().bind("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, Error::Bind { .. }), "{err}");
    }
}
