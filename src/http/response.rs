//! Response builder, body producers and the values handlers may return.

use crate::{
    http::types::StatusCode, limits::RespLimits, server::static_files::mime_type, Error,
    HandlerError,
};
use futures::future::BoxFuture;
use serde::Serialize;
use std::{borrow::Cow, fmt, io, path::Path, time::Duration};
use tokio::{fs::File, io::AsyncReadExt};

pub use write_support::{BodyWriter, WriteBuffer};

/// HTTP response under construction.
///
/// Created by the server for every request and passed to
/// [`Handler::handle`](crate::Handler::handle) next to the request. The
/// handler's return value is applied on top of it through [`Responder`],
/// so simple handlers never touch it while others set headers, cookies or
/// a streamed body here.
///
/// Serialization happens after the handler returns:
/// - `content-length` is always computed by the server
/// - `content-type: text/plain` is added to non-empty bodies without one
/// - `connection` is derived from the request and [`close()`](Response::close)
///
/// # Examples
/// ```
/// use pico_web::{HandlerError, Request, Response, StatusCode};
///
/// async fn handle(_req: &mut Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
///     resp.status(StatusCode::Ok)
///         .header("content-type", "text/html")
///         .body("<h1>Hello World</h1>");
///     Ok(())
/// }
/// ```
pub struct Response {
    pub(crate) status: Option<StatusCode>,
    pub(crate) headers: Vec<(Cow<'static, str>, Cow<'static, str>)>,
    pub(crate) body: Body,
    pub(crate) keep_alive: bool,
    chunk_size: usize,
}

pub(crate) enum Body {
    Empty,
    Bytes(Vec<u8>),
    Stream {
        producer: Box<dyn BodyProducer>,
        length: Option<u64>,
    },
}

impl Body {
    /// Declared length, `None` for streams of unknown size.
    pub(crate) fn length(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(bytes) => Some(bytes.len() as u64),
            Body::Stream { length, .. } => *length,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Body::Stream { length, .. } => f.debug_struct("Stream").field("length", length).finish(),
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status_code())
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

impl Response {
    #[inline]
    pub(crate) fn new(limits: &RespLimits) -> Self {
        Self {
            status: None,
            headers: Vec::new(),
            body: Body::Empty,
            keep_alive: true,
            chunk_size: limits.file_chunk_size.max(1),
        }
    }

    /// Builds the answer for a request that failed with `err`.
    ///
    /// Error responses always close the connection.
    pub(crate) fn from_error(err: &Error, limits: &RespLimits, json: bool) -> Self {
        let mut resp = Self::new(limits);
        resp.status(err.status()).close();

        if let Error::MethodNotAllowed { allowed } = err {
            resp.header("allow", allow_value(allowed));
        }
        if json {
            resp.header("content-type", "application/json")
                .body(err.json_body());
        }
        resp
    }
}

pub(crate) fn allow_value(methods: &[crate::Method]) -> String {
    methods
        .iter()
        .map(|method| method.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Response {
    /// Sets the status code (default: `200 OK`).
    #[inline]
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = Some(status);
        self
    }

    /// The status that will be sent.
    #[inline]
    pub fn status_code(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::Ok)
    }

    /// Sets a header, replacing earlier values with the same name.
    ///
    /// Names are compared case-insensitively. `content-length` and
    /// `connection` are managed by the server and ignored here; use
    /// [`close()`](Response::close) to end the connection.
    ///
    /// # Examples
    /// ```
    /// # pico_web::run_test(|_, resp| {
    /// resp.header("cache-control", "no-store")
    ///     .header("Cache-Control", "max-age=60");
    ///
    /// assert_eq!(resp.get_header("cache-control"), Some("max-age=60"));
    /// # });
    /// ```
    ///
    /// # Panics
    /// In `debug` mode when the name is empty or contains `:`, spaces or
    /// line breaks.
    #[track_caller]
    pub fn header<N, V>(&mut self, name: N, value: V) -> &mut Self
    where
        N: Into<Cow<'static, str>>,
        V: Into<Cow<'static, str>>,
    {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.append_header(name, value)
    }

    /// Adds a header without touching existing ones with the same name.
    #[track_caller]
    pub fn append_header<N, V>(&mut self, name: N, value: V) -> &mut Self
    where
        N: Into<Cow<'static, str>>,
        V: Into<Cow<'static, str>>,
    {
        let name = name.into();
        debug_assert!(
            !name.is_empty() && !name.bytes().any(|b| matches!(b, b':' | b' ' | b'\r' | b'\n')),
            "Invalid header name: {name:?}"
        );
        self.headers.push((name, value.into()));
        self
    }

    /// First value of a header set on this response.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_ref())
    }

    /// Forces the connection to close after this response.
    #[inline]
    pub fn close(&mut self) -> &mut Self {
        self.keep_alive = false;
        self
    }

    /// Sets a buffered body, replacing any previous body.
    ///
    /// # Examples
    /// ```
    /// # pico_web::run_test(|_, resp| {
    /// use pico_web::StatusCode;
    ///
    /// resp.status(StatusCode::Ok)
    ///     .header("content-type", "text/plain")
    ///     .body("Hello, World!");
    /// # });
    /// ```
    #[inline]
    pub fn body<T: WriteBuffer>(&mut self, data: T) -> &mut Self {
        let mut buffer = Vec::new();
        data.write_to(&mut buffer);
        self.body = Body::Bytes(buffer);
        self
    }

    /// Builds a buffered body with a closure.
    ///
    /// # Examples
    /// ```
    /// # pico_web::run_test(|_, resp| {
    /// use std::io::Write;
    ///
    /// resp.header("content-type", "application/json")
    ///     .body_with(|writer| {
    ///         let _ = write!(writer, r#"{{"temperature": {}}}"#, 21);
    ///         writer.write(b"\n");
    ///     });
    /// # });
    /// ```
    pub fn body_with<F: FnOnce(&mut BodyWriter)>(&mut self, f: F) -> &mut Self {
        let mut buffer = Vec::new();
        f(&mut BodyWriter(&mut buffer));
        self.body = Body::Bytes(buffer);
        self
    }

    /// Streams the body from `producer`.
    ///
    /// With a known `length` the response keeps the connection reusable;
    /// without one the end of the body is marked by closing the connection.
    pub fn stream<P: BodyProducer + 'static>(&mut self, producer: P, length: Option<u64>) -> &mut Self {
        self.body = Body::Stream {
            producer: Box::new(producer),
            length,
        };
        self
    }

    /// Streams a file as the body.
    ///
    /// The content type is guessed from the extension unless already set.
    /// The file is sent in chunks of
    /// [`RespLimits::file_chunk_size`](crate::limits::RespLimits::file_chunk_size)
    /// bytes and never loaded whole.
    ///
    /// # Errors
    /// - [`Error::NotFound`] if the file is missing or a directory
    /// - [`Error::Forbidden`] if it cannot be opened for lack of permission
    pub async fn file<P: AsRef<Path>>(&mut self, path: P) -> Result<&mut Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).await.map_err(map_fs_error)?;
        let metadata = file.metadata().await.map_err(map_fs_error)?;
        if !metadata.is_file() {
            return Err(Error::NotFound);
        }

        if self.get_header("content-type").is_none() {
            self.header("content-type", mime_type(path));
        }
        let length = metadata.len();
        Ok(self.stream(FileBody::new(file, length, self.chunk_size), Some(length)))
    }

    /// Asks the browser to save the body as `filename`.
    pub fn attachment(&mut self, filename: &str) -> &mut Self {
        let filename: String = filename
            .chars()
            .filter(|c| !matches!(c, '"' | '\\') && !c.is_control())
            .collect();
        self.header(
            "content-disposition",
            format!("attachment; filename=\"{filename}\""),
        )
    }

    /// Redirects with `302 Found`.
    ///
    /// # Examples
    /// ```
    /// # pico_web::run_test(|_, resp| {
    /// resp.redirect("/login");
    ///
    /// assert_eq!(resp.status_code().as_u16(), 302);
    /// assert_eq!(resp.get_header("location"), Some("/login"));
    /// # });
    /// ```
    pub fn redirect<L: Into<Cow<'static, str>>>(&mut self, location: L) -> &mut Self {
        self.redirect_with(location, StatusCode::Found)
    }

    /// Redirects with a specific status such as `301` or `307`.
    pub fn redirect_with<L>(&mut self, location: L, status: StatusCode) -> &mut Self
    where
        L: Into<Cow<'static, str>>,
    {
        self.status(status).header("location", location)
    }

    /// Adds a `set-cookie` header. Several cookies may be set.
    pub fn set_cookie(&mut self, cookie: Cookie) -> &mut Self {
        self.append_header("set-cookie", cookie.to_string())
    }
}

fn map_fs_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound => Error::NotFound,
        io::ErrorKind::PermissionDenied => Error::Forbidden,
        _ => Error::Io(err),
    }
}

/// A cookie for [`Response::set_cookie`].
///
/// # Examples
/// ```
/// use pico_web::Cookie;
/// use std::time::Duration;
///
/// let cookie = Cookie::new("session", "abc123")
///     .max_age(Duration::from_secs(3600))
///     .path("/");
///
/// assert_eq!(cookie.to_string(), "session=abc123; Max-Age=3600; Path=/");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: Cow<'static, str>,
    value: Cow<'static, str>,
    max_age: Option<u64>,
    path: Option<Cow<'static, str>>,
    http_only: bool,
}

impl Cookie {
    pub fn new<N, V>(name: N, value: V) -> Self
    where
        N: Into<Cow<'static, str>>,
        V: Into<Cow<'static, str>>,
    {
        Self {
            name: name.into(),
            value: value.into(),
            max_age: None,
            path: None,
            http_only: false,
        }
    }

    /// Lifetime in whole seconds; zero deletes the cookie.
    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age.as_secs());
        self
    }

    pub fn path<P: Into<Cow<'static, str>>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Hides the cookie from scripts.
    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(age) = self.max_age {
            write!(f, "; Max-Age={age}")?;
        }
        if let Some(path) = &self.path {
            write!(f, "; Path={path}")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        Ok(())
    }
}

/// Source of a streamed response body.
///
/// Each call yields the next chunk; `None` ends the body. The chunk borrows
/// the producer, so one buffer can be reused for the whole body.
///
/// # Examples
/// ```
/// use futures::future::BoxFuture;
/// use pico_web::BodyProducer;
///
/// struct Countdown {
///     left: u8,
///     line: [u8; 2],
/// }
///
/// impl BodyProducer for Countdown {
///     fn next_chunk(&mut self) -> BoxFuture<'_, std::io::Result<Option<&[u8]>>> {
///         Box::pin(async move {
///             if self.left == 0 {
///                 return Ok(None);
///             }
///             self.left -= 1;
///             self.line = [b'0' + self.left, b'\n'];
///             Ok(Some(&self.line[..]))
///         })
///     }
/// }
/// ```
pub trait BodyProducer: Send {
    fn next_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<&[u8]>>>;
}

/// Reads a file in fixed-size chunks.
pub(crate) struct FileBody {
    file: File,
    remaining: u64,
    buffer: Box<[u8]>,
}

impl FileBody {
    pub(crate) fn new(file: File, length: u64, chunk_size: usize) -> Self {
        let size = chunk_size.min(usize::try_from(length).unwrap_or(usize::MAX)).max(1);
        Self {
            file,
            remaining: length,
            buffer: vec![0; size].into_boxed_slice(),
        }
    }
}

impl BodyProducer for FileBody {
    fn next_chunk(&mut self) -> BoxFuture<'_, io::Result<Option<&[u8]>>> {
        Box::pin(async move {
            if self.remaining == 0 {
                return Ok(None);
            }

            let want = usize::try_from(self.remaining)
                .unwrap_or(usize::MAX)
                .min(self.buffer.len());
            let read = self.file.read(&mut self.buffer[..want]).await?;
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }

            self.remaining -= read as u64;
            Ok(Some(&self.buffer[..read]))
        })
    }
}

/// Values a [`Handler`](crate::Handler) can return.
///
/// | Value | Effect |
/// |-------|--------|
/// | `()` | response left as the handler built it |
/// | `&'static str`, `String`, `Vec<u8>`, ... | body, status 200 |
/// | `(body, status)` | body with a [`StatusCode`] or a `u16` |
/// | `(body, status, headers)` | plus an iterator of `(name, value)` pairs |
/// | [`Json(value)`](Json) | serialized body, `application/json` |
///
/// # Examples
/// ```
/// use pico_web::{HandlerError, Request, Response};
///
/// async fn created(_: &mut Request<'_>, _: &mut Response)
///     -> Result<(&'static str, u16, [(&'static str, &'static str); 1]), HandlerError>
/// {
///     Ok(("created", 201, [("location", "/items/7")]))
/// }
/// ```
pub trait Responder {
    fn respond_to(self, response: &mut Response) -> Result<(), HandlerError>;
}

impl Responder for () {
    #[inline]
    fn respond_to(self, _: &mut Response) -> Result<(), HandlerError> {
        Ok(())
    }
}

macro_rules! impl_body_responder {
    ($($t:ty),*) => {
        $(impl Responder for $t {
            #[inline]
            fn respond_to(self, response: &mut Response) -> Result<(), HandlerError> {
                response.body(self);
                Ok(())
            }
        })*
    };
}

impl_body_responder! {
    &'static str, String, Box<str>, Cow<'static, str>,
    &'static [u8], Vec<u8>, Box<[u8]>
}

impl<T, E> Responder for Result<T, E>
where
    T: Responder,
    E: Into<HandlerError>,
{
    #[inline]
    fn respond_to(self, response: &mut Response) -> Result<(), HandlerError> {
        match self {
            Ok(value) => value.respond_to(response),
            Err(err) => Err(err.into()),
        }
    }
}

/// Status codes accepted in responder tuples.
pub trait IntoStatus {
    fn into_status(self) -> Result<StatusCode, Error>;
}

impl IntoStatus for StatusCode {
    #[inline]
    fn into_status(self) -> Result<StatusCode, Error> {
        Ok(self)
    }
}

impl IntoStatus for u16 {
    #[inline]
    fn into_status(self) -> Result<StatusCode, Error> {
        StatusCode::try_from(self)
    }
}

impl<T: Responder, S: IntoStatus> Responder for (T, S) {
    fn respond_to(self, response: &mut Response) -> Result<(), HandlerError> {
        response.status(self.1.into_status()?);
        self.0.respond_to(response)
    }
}

impl<T, S, I, K, V> Responder for (T, S, I)
where
    T: Responder,
    S: IntoStatus,
    I: IntoIterator<Item = (K, V)>,
    K: Into<Cow<'static, str>>,
    V: Into<Cow<'static, str>>,
{
    fn respond_to(self, response: &mut Response) -> Result<(), HandlerError> {
        response.status(self.1.into_status()?);
        for (name, value) in self.2 {
            response.header(name, value);
        }
        self.0.respond_to(response)
    }
}

/// Serializes the wrapped value as a JSON body.
///
/// # Examples
/// ```
/// use pico_web::{HandlerError, Json, Request, Response};
/// use std::collections::HashMap;
///
/// async fn status(_: &mut Request<'_>, _: &mut Response)
///     -> Result<Json<HashMap<&'static str, u32>>, HandlerError>
/// {
///     Ok(Json(HashMap::from([("uptime", 42)])))
/// }
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T: Serialize> Responder for Json<T> {
    fn respond_to(self, response: &mut Response) -> Result<(), HandlerError> {
        let body = serde_json::to_vec(&self.0)?;
        response.header("content-type", "application/json").body(body);
        Ok(())
    }
}

pub(crate) mod write_support {
    use std::{borrow::Cow, rc::Rc, sync::Arc};

    /// Writer passed to [`Response::body_with`](crate::Response::body_with).
    ///
    /// Supports [`WriteBuffer`] values and [`std::io::Write`].
    #[derive(Debug)]
    pub struct BodyWriter<'a>(pub(crate) &'a mut Vec<u8>);

    impl BodyWriter<'_> {
        /// Appends a value to the body.
        #[inline]
        pub fn write<T: WriteBuffer>(&mut self, value: T) {
            value.write_to(self.0);
        }
    }

    impl std::io::Write for BodyWriter<'_> {
        #[inline]
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        #[inline]
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Values that can be written into a response body.
    ///
    /// Implemented for strings, bytes, booleans, chars and integers.
    /// Floating-point numbers are left out on purpose: format them with
    /// an explicit precision instead.
    ///
    /// # Example
    /// ```
    /// use pico_web::WriteBuffer;
    ///
    /// struct Celsius(i16);
    ///
    /// impl WriteBuffer for Celsius {
    ///     fn write_to(&self, buffer: &mut Vec<u8>) {
    ///         self.0.write_to(buffer);
    ///         buffer.extend_from_slice(" °C".as_bytes());
    ///     }
    /// }
    /// ```
    pub trait WriteBuffer {
        fn write_to(&self, buffer: &mut Vec<u8>);
    }

    macro_rules! impl_write_buffer {
        (str => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    let value: &str = self;
                    buffer.extend_from_slice(value.as_bytes());
                }
            })*
        };
        (bytes => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    let value: &[u8] = self;
                    buffer.extend_from_slice(value);
                }
            })*
        };
        (unsigned => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    write_u128(*self as u128, buffer);
                }
            })*
        };
        (signed => $($t:ty),*) => {
            $(impl WriteBuffer for $t {
                #[inline] fn write_to(&self, buffer: &mut Vec<u8>) {
                    if *self < 0 {
                        buffer.push(b'-');
                    }
                    write_u128((*self as i128).unsigned_abs(), buffer);
                }
            })*
        };
    }

    impl<T: WriteBuffer + ?Sized> WriteBuffer for &T {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            T::write_to(*self, buffer);
        }
    }

    impl_write_buffer!(str => str, String, Box<str>, Cow<'_, str>, Arc<str>, Rc<str>);
    impl_write_buffer!(bytes => [u8], Vec<u8>, Box<[u8]>, Cow<'_, [u8]>, Arc<[u8]>, Rc<[u8]>);
    impl_write_buffer!(unsigned => u8, u16, u32, u64, u128, usize);
    impl_write_buffer!(signed => i8, i16, i32, i64, i128, isize);

    impl<const N: usize> WriteBuffer for [u8; N] {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(self);
        }
    }

    impl WriteBuffer for bool {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            buffer.extend_from_slice(match self {
                true => b"true",
                false => b"false",
            });
        }
    }

    impl WriteBuffer for char {
        #[inline]
        fn write_to(&self, buffer: &mut Vec<u8>) {
            let mut buf = [0u8; 4];
            buffer.extend_from_slice(self.encode_utf8(&mut buf).as_bytes());
        }
    }

    /// Appends the decimal digits of `value`.
    pub(crate) fn write_u128(mut value: u128, buffer: &mut Vec<u8>) {
        let mut digits = [0u8; 39];
        let mut pos = digits.len();
        loop {
            pos -= 1;
            digits[pos] = b'0' + (value % 10) as u8;
            value /= 10;
            if value == 0 {
                break;
            }
        }
        buffer.extend_from_slice(&digits[pos..]);
    }
}
