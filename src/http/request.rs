use crate::{
    http::{
        query::{Query, QueryMap},
        reader::ByteStreamReader,
        types::{slice_to_usize, Headers},
    },
    limits::ReqLimits,
    Error, Limit, Method, Version,
};
use memchr::memchr;
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;
use std::{fmt, net::SocketAddr};

/// A parsed HTTP request.
///
/// The request line and headers are owned and validated before a handler
/// sees them; the body may still be on the socket (see [`RequestBody`]).
///
/// # Paths
/// Two forms of the path are kept:
/// - [`raw_path()`](Request::raw_path): exactly as sent, without the query.
///   The router matches against it, so `%2F` inside a segment never splits it.
/// - [`path()`](Request::path): percent-decoded, with empty and `.`
///   segments removed. `..` segments are kept as they are.
///
/// ```text
/// GET /files//a%20b/./c?x=1 HTTP/1.1
///     raw_path: /files//a%20b/./c
///     path:     /files/a b/c
/// ```
pub struct Request<'r> {
    method: Method,
    version: Version,
    target: String,
    path_end: usize,
    path: String,
    query: QueryMap,
    headers: Headers,
    params: Vec<(String, String)>,
    client_addr: SocketAddr,
    keep_alive: bool,
    query_parts: usize,
    body: RequestBody<'r>,
}

/// Body of a [`Request`].
///
/// Bodies up to [`ReqLimits::eager_body_size`] are read before the handler
/// runs. Larger ones stay on the socket and are read on demand through the
/// connection's buffer; whatever a handler leaves unread is discarded before
/// the next request.
pub enum RequestBody<'r> {
    Empty,
    Buffered { data: Vec<u8>, consumed: bool },
    Streaming { reader: &'r mut ByteStreamReader, remaining: usize },
}

impl fmt::Debug for RequestBody<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Buffered { data, .. } => f.debug_tuple("Buffered").field(&data.len()).finish(),
            Self::Streaming { remaining, .. } => {
                f.debug_struct("Streaming").field("remaining", remaining).finish()
            }
        }
    }
}

impl fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("target", &self.target)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("params", &self.params)
            .field("client_addr", &self.client_addr)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

impl<'r> Request<'r> {
    fn new(head: RequestHead, limits: &ReqLimits, client_addr: SocketAddr) -> Result<Self, Error> {
        let path_end = memchr(b'?', head.target.as_bytes()).unwrap_or(head.target.len());
        let raw_path = &head.target[..path_end];

        let decoded = percent_decode_str(raw_path)
            .decode_utf8()
            .map_err(|_| Error::malformed("path is not valid UTF-8"))?;
        let path = normalize_path(&decoded);

        let query = Query::parse(head.target[path_end..].as_bytes(), limits.query_parts)?;

        Ok(Self {
            method: head.method,
            version: head.version,
            path_end,
            path,
            target: head.target,
            query,
            headers: Headers::default(),
            params: Vec::new(),
            client_addr,
            keep_alive: head.version.keep_alive_default(),
            query_parts: limits.query_parts,
            body: RequestBody::Empty,
        })
    }

    /// A request without a connection, for tests and doc examples.
    #[doc(hidden)]
    pub fn detached(method: Method, target: &str) -> Result<Self, Error> {
        let head = RequestHead {
            method,
            target: target.to_owned(),
            version: Version::Http11,
        };
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        Self::new(head, &ReqLimits::default(), addr)
    }
}

/// Request line and headers.
impl<'r> Request<'r> {
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// The request target as sent, including the query.
    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Decoded and normalized path.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path exactly as sent, without the query.
    #[inline]
    pub fn raw_path(&self) -> &str {
        &self.target[..self.path_end]
    }

    /// Decoded query parameter; the last one wins on duplicates.
    ///
    /// # Examples
    /// ```
    /// # pico_web::run_test_with("/search?q=caf%C3%A9+au+lait&page=2", |req, _| {
    /// assert_eq!(req.query("q"), Some("café au lait"));
    /// assert_eq!(req.query("page"), Some("2"));
    /// assert_eq!(req.query("missing"), None);
    /// # });
    /// ```
    #[inline]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key)
    }

    /// All decoded query parameters.
    #[inline]
    pub fn query_map(&self) -> &QueryMap {
        &self.query
    }

    #[inline]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of a header, compared case-insensitively.
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Value of a path parameter captured by the route pattern.
    ///
    /// For the pattern `/users/{id}` and the path `/users/42`,
    /// `param("id")` is `Some("42")`. Values are percent-decoded.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All path parameters in pattern order.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub(crate) fn set_params(&mut self, params: Vec<(String, String)>) {
        self.params = params;
    }

    /// Address of the peer.
    #[inline]
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Whether the client asked to keep the connection open.
    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Value of a cookie from the `cookie` headers.
    ///
    /// # Examples
    /// ```
    /// # pico_web::run_test(|req, _| {
    /// // cookie: theme=dark; session=abc123
    /// if let Some(session) = req.cookie("session") {
    ///     println!("session {session}");
    /// }
    /// # });
    /// ```
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all("cookie")
            .flat_map(|line| line.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    #[inline]
    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get("user-agent")
    }

    /// Declared body length, `None` when the request has no body.
    pub fn content_length(&self) -> Option<usize> {
        match &self.body {
            RequestBody::Empty => None,
            RequestBody::Buffered { data, .. } => Some(data.len()),
            RequestBody::Streaming { remaining, .. } => Some(*remaining),
        }
    }
}

/// Body access.
impl<'r> Request<'r> {
    /// The body if it has already been read.
    ///
    /// Returns `None` for a body still on the socket; use
    /// [`bytes()`](Request::bytes) or [`body_chunk()`](Request::body_chunk).
    pub fn body(&self) -> Option<&[u8]> {
        match &self.body {
            RequestBody::Buffered { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Next piece of the body, `None` once it is exhausted.
    ///
    /// Chunks of a streamed body are at most the size of the read buffer.
    ///
    /// # Examples
    /// ```
    /// use pico_web::{Error, HandlerError, Request, Response};
    ///
    /// async fn count_bytes(req: &mut Request<'_>, _: &mut Response) -> Result<String, HandlerError> {
    ///     let mut total = 0;
    ///     while let Some(chunk) = req.body_chunk().await? {
    ///         total += chunk.len();
    ///     }
    ///     Ok(total.to_string())
    /// }
    /// ```
    pub async fn body_chunk(&mut self) -> Result<Option<&[u8]>, Error> {
        match &mut self.body {
            RequestBody::Empty => Ok(None),
            RequestBody::Buffered { data, consumed } => match *consumed {
                true => Ok(None),
                false => {
                    *consumed = true;
                    Ok(Some(data.as_slice()))
                }
            },
            RequestBody::Streaming { reader, remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let chunk = reader.read_chunk(*remaining).await?;
                *remaining -= chunk.len();
                Ok(Some(chunk))
            }
        }
    }

    /// Reads the whole body into memory.
    ///
    /// The body is bounded by [`ReqLimits::body_size`].
    pub async fn bytes(&mut self) -> Result<&[u8], Error> {
        if let RequestBody::Streaming { reader, remaining } = &mut self.body {
            let mut data = Vec::with_capacity(*remaining);
            while *remaining > 0 {
                let chunk = reader.read_chunk(*remaining).await?;
                *remaining -= chunk.len();
                data.extend_from_slice(chunk);
            }
            self.body = RequestBody::Buffered { data, consumed: false };
        }

        Ok(self.body().unwrap_or_default())
    }

    /// Reads the whole body as UTF-8 text.
    pub async fn text(&mut self) -> Result<&str, Error> {
        let bytes = self.bytes().await?;
        simdutf8::basic::from_utf8(bytes).map_err(|_| Error::malformed("body is not valid UTF-8"))
    }

    /// Reads the body and deserializes it as JSON.
    ///
    /// Invalid JSON is answered with `400 Bad Request` when the error is
    /// propagated from the handler.
    ///
    /// # Examples
    /// ```
    /// use pico_web::{HandlerError, Request, Response};
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct Reading {
    ///     sensor: String,
    ///     value: i32,
    /// }
    ///
    /// async fn store(req: &mut Request<'_>, _: &mut Response) -> Result<(&'static str, u16), HandlerError> {
    ///     let reading: Reading = req.json().await?;
    ///     println!("{} = {}", reading.sensor, reading.value);
    ///     Ok(("stored", 201))
    /// }
    /// ```
    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T, Error> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(bytes).map_err(|_| Error::malformed("body is not valid JSON"))
    }

    /// Reads an `application/x-www-form-urlencoded` body.
    ///
    /// The number of fields is bounded by [`ReqLimits::query_parts`].
    pub async fn form(&mut self) -> Result<QueryMap, Error> {
        let limit = self.query_parts;
        let bytes = self.bytes().await?;
        Ok(Query::parse(bytes, limit)?)
    }

    /// Discards whatever part of the body is still on the socket.
    pub(crate) async fn drain(&mut self) -> Result<(), Error> {
        if let RequestBody::Streaming { reader, remaining } = &mut self.body {
            reader.discard(*remaining).await?;
            *remaining = 0;
        }
        Ok(())
    }
}

/// Incremental parser for one request on a connection.
///
/// # Input data requirements
///
/// - Lines end with exactly `CRLF`.
/// - The request line is `METHOD SP TARGET SP VERSION`: three non-empty
///   tokens separated by single spaces, valid `UTF-8`.
/// - `METHOD` is one of [`Method`], `VERSION` is `HTTP/1.0` or `HTTP/1.1`.
/// - `TARGET` starts with `/`.
/// - Header lines are `NAME: VALUE`; the name is non-empty without spaces,
///   surrounding whitespace of the value is dropped. Folded lines are rejected.
/// - `Transfer-Encoding` other than `identity` is not supported.
///
/// Every step is bounded by [`ReqLimits`]; the first violation fails the
/// request and the parser moves to [`ParseState::Error`].
///
/// # States
/// ```text
/// Start -> RequestLine -> Headers -> Body -> Done
///               |            |         |
///               +------------+---------+----> Error
/// ```
#[derive(Debug)]
pub struct RequestParser {
    limits: ReqLimits,
    state: ParseState,
}

/// Progress of a [`RequestParser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Start,
    RequestLine,
    Headers,
    Body,
    Done,
    Error,
}

struct RequestHead {
    method: Method,
    target: String,
    version: Version,
}

impl RequestParser {
    pub fn new(limits: ReqLimits) -> Self {
        Self {
            limits,
            state: ParseState::Start,
        }
    }

    #[inline]
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Parses the next request from `reader`.
    ///
    /// The returned request borrows the reader while its body is still on
    /// the socket.
    pub async fn parse<'r>(
        &mut self,
        reader: &'r mut ByteStreamReader,
        client_addr: SocketAddr,
    ) -> Result<Request<'r>, Error> {
        self.state = ParseState::Start;

        match self.parse_message(reader, client_addr).await {
            Ok(request) => {
                self.state = ParseState::Done;
                Ok(request)
            }
            Err(err) => {
                self.state = ParseState::Error;
                Err(err)
            }
        }
    }

    async fn parse_message<'r>(
        &mut self,
        reader: &'r mut ByteStreamReader,
        client_addr: SocketAddr,
    ) -> Result<Request<'r>, Error> {
        self.state = ParseState::RequestLine;
        let line = reader.read_until(b"\r\n", self.limits.line_size).await?;
        let head = parse_request_line(line, &self.limits)?;
        let mut request = Request::new(head, &self.limits, client_addr)?;

        self.state = ParseState::Headers;
        request.headers = self.read_headers(reader).await?;
        request.keep_alive = connection_keep_alive(&request.headers, request.version);

        self.state = ParseState::Body;
        let length = self.content_length(&request.headers)?;
        request.body = match length {
            0 => RequestBody::Empty,
            n if n <= self.limits.eager_body() => RequestBody::Buffered {
                data: reader.read_exact(n).await?.to_vec(),
                consumed: false,
            },
            n => RequestBody::Streaming { reader, remaining: n },
        };

        Ok(request)
    }

    async fn read_headers(&self, reader: &mut ByteStreamReader) -> Result<Headers, Error> {
        let limits = &self.limits;
        let mut headers = Headers::with_capacity(limits.header_count.min(16));
        let mut used = 0;

        loop {
            let budget = limits.header_bytes.saturating_sub(used);
            let line = reader
                .read_until(b"\r\n", budget)
                .await
                .map_err(|err| match err {
                    Error::LimitExceeded { .. } => Error::limit(Limit::HeaderBytes, limits.header_bytes),
                    err => err,
                })?;

            if line.is_empty() {
                return Ok(headers);
            }
            if headers.len() >= limits.header_count {
                return Err(Error::limit(Limit::HeaderCount, limits.header_count));
            }

            used += line.len() + 2;
            let (name, value) = parse_header_line(line)?;
            headers.push(name.to_owned(), value.to_owned());
        }
    }

    fn content_length(&self, headers: &Headers) -> Result<usize, Error> {
        if let Some(encoding) = headers.get("transfer-encoding") {
            if !encoding.trim().eq_ignore_ascii_case("identity") {
                return Err(Error::UnsupportedFeature("transfer encoding"));
            }
        }

        let mut length = None;
        for value in headers.get_all("content-length") {
            let parsed = slice_to_usize(value.as_bytes())
                .ok_or(Error::malformed("invalid content-length"))?;
            if length.is_some_and(|known| known != parsed) {
                return Err(Error::malformed("conflicting content-length headers"));
            }
            length = Some(parsed);
        }

        let length = length.unwrap_or(0);
        if length > self.limits.body_size {
            return Err(Error::limit(Limit::Body, self.limits.body_size));
        }
        Ok(length)
    }
}

fn parse_request_line(line: &[u8], limits: &ReqLimits) -> Result<RequestHead, Error> {
    let line = simdutf8::basic::from_utf8(line)
        .map_err(|_| Error::malformed("request line is not valid UTF-8"))?;

    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::malformed("request line must have three parts"));
    };

    let method = Method::from_bytes(method.as_bytes())?;
    let version = Version::from_bytes(version.as_bytes())?;

    if target.len() > limits.url_size {
        return Err(Error::limit(Limit::Url, limits.url_size));
    }
    if !target.starts_with('/') {
        return Err(Error::malformed("target must start with '/'"));
    }

    Ok(RequestHead {
        method,
        target: target.to_owned(),
        version,
    })
}

fn parse_header_line(line: &[u8]) -> Result<(&str, &str), Error> {
    let line = simdutf8::basic::from_utf8(line)
        .map_err(|_| Error::malformed("header is not valid UTF-8"))?;

    let colon = memchr(b':', line.as_bytes()).ok_or(Error::malformed("header without colon"))?;
    let name = &line[..colon];
    if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(Error::malformed("invalid header name"));
    }

    let value = line[colon + 1..].trim_matches(|c: char| c == ' ' || c == '\t');
    Ok((name, value))
}

fn connection_keep_alive(headers: &Headers, version: Version) -> bool {
    let mut keep_alive = version.keep_alive_default();
    for token in headers.get_all("connection").flat_map(|value| value.split(',')) {
        match token.trim() {
            t if t.eq_ignore_ascii_case("close") => return false,
            t if t.eq_ignore_ascii_case("keep-alive") => keep_alive = true,
            _ => {}
        }
    }
    keep_alive
}

/// Drops empty and `.` segments; the result always starts with `/`.
fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len());
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        normalized.push('/');
        normalized.push_str(segment);
    }

    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}
