//! Core HTTP protocol types and utilities

use crate::errors::Error;
use std::fmt;

#[inline(always)]
pub(crate) fn slice_to_usize(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: usize = 0;

    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as usize)?;
    }

    Some(result)
}

// METHOD

/// HTTP request methods
///
/// # References
///
/// - [RFC 7231, Section 4](https://datatracker.ietf.org/doc/html/rfc7231#section-4)
/// - [RFC 5789](https://datatracker.ietf.org/doc/html/rfc5789) (PATCH method)
///
/// # Disabled methods
///
/// * `TRACE` - disabled for security reasons
/// * `CONNECT` - disabled because there is no proxy support
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET method - transfer a current representation of the target resource
    /// [[RFC7231, Section 4.3.1](https://tools.ietf.org/html/rfc7231#section-4.3.1)]
    Get,
    /// POST method - perform resource-specific processing on the request payload
    /// [[RFC7231, Section 4.3.3](https://tools.ietf.org/html/rfc7231#section-4.3.3)]
    Post,
    /// PUT method - replace all current representations of the target resource with the request payload
    /// [[RFC7231, Section 4.3.4](https://tools.ietf.org/html/rfc7231#section-4.3.4)]
    Put,
    /// DELETE method - remove all current representations of the target resource
    /// [[RFC7231, Section 4.3.5](https://tools.ietf.org/html/rfc7231#section-4.3.5)]
    Delete,
    /// PATCH method - apply partial modifications to a resource
    /// [[RFC5789, Section 2](https://tools.ietf.org/html/rfc5789#section-2)]
    Patch,
    /// HEAD method - same as GET but without response body
    /// [[RFC7231, Section 4.3.2](https://tools.ietf.org/html/rfc7231#section-4.3.2)]
    Head,
    /// OPTIONS method - describe the communication options for the target resource
    /// [[RFC7231, Section 4.3.7](https://tools.ietf.org/html/rfc7231#section-4.3.7)]
    Options,
}

impl Method {
    /// All supported methods, in the order used for `Allow` headers.
    pub const ALL: [Method; 7] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Patch,
        Method::Head,
        Method::Options,
    ];

    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, Error> {
        match src {
            b"GET" => Ok(Method::Get),
            b"POST" => Ok(Method::Post),
            b"PUT" => Ok(Method::Put),
            b"DELETE" => Ok(Method::Delete),
            b"PATCH" => Ok(Method::Patch),
            b"HEAD" => Ok(Method::Head),
            b"OPTIONS" => Ok(Method::Options),
            _ => Err(Error::malformed("unknown method")),
        }
    }

    /// Returns the method name as sent on the wire.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Version {
    /// HTTP/1.0 - Added headers and status codes (1996)
    ///
    /// Connections close after each response unless the client sends
    /// `Connection: keep-alive`.
    ///
    /// [RFC 1945](https://tools.ietf.org/html/rfc1945)
    Http10,

    /// HTTP/1.1 - Current standard with persistent connections (1999)
    ///
    /// [RFC 7230](https://tools.ietf.org/html/rfc7230) and related
    Http11,
}

impl Version {
    #[inline(always)]
    pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, Error> {
        match src {
            b"HTTP/1.1" => Ok(Self::Http11),
            b"HTTP/1.0" => Ok(Self::Http10),
            _ => Err(Error::malformed("unsupported version")),
        }
    }

    /// Whether connections stay open by default for this version.
    #[inline(always)]
    pub const fn keep_alive_default(&self) -> bool {
        matches!(self, Version::Http11)
    }

    /// Returns the version as sent on the wire.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// STATUS_CODE

macro_rules! set_status_codes {
    ($(
        $(#[$docs:meta])+
        $name:ident = ($num:expr, $str:expr);
    )+) => {
        /// HTTP status codes
        ///
        /// Represents valid HTTP status codes as defined in
        /// [RFC 7231](https://tools.ietf.org/html/rfc7231#section-6) and other standards.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $(#[$docs])+
            $name = $num,
        )+ }

        impl StatusCode {
            /// Returns the HTTP status line as bytes (e.g., `b"HTTP/1.1 200 OK\r\n"`).
            #[inline]
            pub const fn status_line(&self, version: Version) -> &'static [u8] {
                match (self, version) { $(
                    (StatusCode::$name, Version::Http11) => {
                        concat!("HTTP/1.1 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                    (StatusCode::$name, Version::Http10) => {
                        concat!("HTTP/1.0 ", $num, " ", $str, "\r\n").as_bytes()
                    },
                )+ }
            }

            /// Returns the reason phrase (e.g., `"Not Found"`).
            #[inline]
            pub const fn reason(&self) -> &'static str {
                match self { $(
                    StatusCode::$name => $str,
                )+ }
            }

            /// Looks up a status code by its number.
            ///
            /// ```
            /// use pico_web::StatusCode;
            ///
            /// assert_eq!(StatusCode::from_u16(201), Some(StatusCode::Created));
            /// assert_eq!(StatusCode::from_u16(299), None);
            /// ```
            #[inline]
            pub const fn from_u16(code: u16) -> Option<Self> {
                match code { $(
                    $num => Some(StatusCode::$name),
                )+
                    _ => None,
                }
            }
        }
    }
}

impl StatusCode {
    /// Returns the numeric code.
    #[inline(always)]
    pub const fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Whether a response with this status never carries a body.
    #[inline]
    pub const fn is_bodiless(&self) -> bool {
        matches!(self.as_u16(), 100..=199 | 204 | 304)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason())
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = Error;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        StatusCode::from_u16(code).ok_or(Error::UnknownStatus(code))
    }
}

set_status_codes! {
    /// Informational: the client may continue sending the body.
    Continue = (100, "Continue");

    /// The request succeeded.
    Ok = (200, "OK");
    /// A resource was created.
    Created = (201, "Created");
    /// Accepted for later processing.
    Accepted = (202, "Accepted");
    /// Success without a body. Answers implicit `OPTIONS` requests.
    NoContent = (204, "No Content");
    /// Partial range served.
    PartialContent = (206, "Partial Content");

    /// Permanent redirect, method may change to GET.
    MovedPermanently = (301, "Moved Permanently");
    /// Default status of [`Response::redirect`](crate::Response::redirect).
    Found = (302, "Found");
    /// Redirect after a POST.
    SeeOther = (303, "See Other");
    /// Cached copy is still valid.
    NotModified = (304, "Not Modified");
    /// Temporary redirect keeping the method.
    TemporaryRedirect = (307, "Temporary Redirect");
    /// Permanent redirect keeping the method.
    PermanentRedirect = (308, "Permanent Redirect");

    /// Malformed request line or headers, or a request limit was exceeded.
    BadRequest = (400, "Bad Request");
    /// Authentication required.
    Unauthorized = (401, "Unauthorized");
    /// Static path traversal attempt, or access denied.
    Forbidden = (403, "Forbidden");
    /// No route or file matches the path.
    NotFound = (404, "Not Found");
    /// The path exists for other methods. Sent with an `Allow` header.
    MethodNotAllowed = (405, "Method Not Allowed");
    /// No acceptable representation.
    NotAcceptable = (406, "Not Acceptable");
    /// The client started a request but stopped sending within the idle window.
    RequestTimeout = (408, "Request Timeout");
    /// State conflict.
    Conflict = (409, "Conflict");
    /// The resource is gone for good.
    Gone = (410, "Gone");
    /// A body was sent without `Content-Length`.
    LengthRequired = (411, "Length Required");
    /// Declared `Content-Length` is above the body limit.
    PayloadTooLarge = (413, "Payload Too Large");
    /// Request target too long.
    UriTooLong = (414, "URI Too Long");
    /// Body media type not handled.
    UnsupportedMediaType = (415, "Unsupported Media Type");
    /// Kept for the legacy of RFC 2324.
    ImaTeapot = (418, "I'm a teapot");
    /// Well-formed body with invalid content.
    UnprocessableEntity = (422, "Unprocessable Entity");
    /// Rate limited.
    TooManyRequests = (429, "Too Many Requests");
    /// Header block too large.
    RequestHeaderFieldsTooLarge = (431, "Request Header Fields Too Large");

    /// A handler failed or panicked.
    InternalServerError = (500, "Internal Server Error");
    /// The request uses a feature the server does not implement (e.g. chunked bodies).
    NotImplemented = (501, "Not Implemented");
    /// Upstream failure.
    BadGateway = (502, "Bad Gateway");
    /// Every connection slot is busy.
    ServiceUnavailable = (503, "Service Unavailable");
    /// Upstream timeout.
    GatewayTimeout = (504, "Gateway Timeout");
    /// Protocol version other than HTTP/1.0 or HTTP/1.1.
    HttpVersionNotSupported = (505, "HTTP Version Not Supported");
}

// HEADERS

/// Request headers with case-insensitive lookup.
///
/// Names keep the spelling the client used; lookups ignore ASCII case
/// (per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)).
/// There are no public mutators: headers are fixed once parsing completes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    #[inline(always)]
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    #[inline(always)]
    pub(crate) fn push(&mut self, name: String, value: String) {
        self.entries.push((name, value));
    }

    /// Returns the first value of the header. Uses linear search.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value of the header, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the header is present.
    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates over `(name, value)` pairs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of header lines received.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no headers were received.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
