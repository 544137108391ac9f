use crate::{Method, StatusCode};
use std::{fmt, io};
use thiserror::Error;

/// Error type returned by [`Handler`](crate::Handler)s.
///
/// Any error converts into it with `?`. Returning a [`pico_web::Error`](Error)
/// keeps that error's status (e.g. [`Error::NotFound`] answers 404); anything
/// else is answered with `500 Internal Server Error`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The request limit that was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// [`ReqLimits::line_size`](crate::limits::ReqLimits::line_size) or the read buffer.
    RequestLine,
    /// [`ReqLimits::url_size`](crate::limits::ReqLimits::url_size).
    Url,
    /// [`ReqLimits::header_count`](crate::limits::ReqLimits::header_count).
    HeaderCount,
    /// [`ReqLimits::header_bytes`](crate::limits::ReqLimits::header_bytes).
    HeaderBytes,
    /// [`ReqLimits::body_size`](crate::limits::ReqLimits::body_size).
    Body,
    /// [`ReqLimits::query_parts`](crate::limits::ReqLimits::query_parts).
    QueryParts,
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Limit::RequestLine => "request line",
            Limit::Url => "url",
            Limit::HeaderCount => "header count",
            Limit::HeaderBytes => "header bytes",
            Limit::Body => "body size",
            Limit::QueryParts => "query parameters",
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed request: {reason}")]
    MalformedRequest { reason: &'static str },

    #[error("{limit} limit of {max} exceeded")]
    LimitExceeded { limit: Limit, max: usize },

    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("no route or file matches the path")]
    NotFound,

    #[error("method not allowed, allowed: {allowed:?}")]
    MethodNotAllowed { allowed: Vec<Method> },

    #[error("path escapes the static root")]
    Forbidden,

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    #[error("handler failed: {0}")]
    HandlerFailure(#[source] HandlerError),

    #[error("all connection slots are busy")]
    ServiceUnavailable,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("route {method} {pattern} is already registered")]
    RouteConflict { method: Method, pattern: String },

    #[error("invalid route pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },

    #[error("unknown status code {0}")]
    UnknownStatus(u16),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn malformed(reason: &'static str) -> Self {
        Self::MalformedRequest { reason }
    }

    pub(crate) fn limit(limit: Limit, max: usize) -> Self {
        Self::LimitExceeded { limit, max }
    }

    pub(crate) fn handler<E: Into<HandlerError>>(err: E) -> Self {
        Self::HandlerFailure(err.into())
    }

    pub(crate) fn invalid_pattern<S: ToString>(pattern: S, reason: &'static str) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        }
    }

    /// Maps a failure returned by a handler: crate errors keep their status,
    /// everything else becomes [`Error::HandlerFailure`].
    pub(crate) fn from_handler(err: HandlerError) -> Self {
        match err.downcast::<Error>() {
            Ok(err) => *err,
            Err(err) => Self::HandlerFailure(err),
        }
    }

    /// Whether the peer is gone and no response can be written.
    #[inline]
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

macro_rules! http_errors {
    ($($pat:pat => $status:ident, $code:literal, $msg:literal; )*) => {
        /// HTTP status used when this error is answered.
        pub fn status(&self) -> StatusCode {
            match self { $( $pat => StatusCode::$status, )* }
        }

        /// Stable machine-readable code, as used in JSON error bodies.
        pub fn code(&self) -> &'static str {
            match self { $( $pat => $code, )* }
        }

        pub(crate) fn json_body(&self) -> &'static str {
            match self { $(
                $pat => concat!(r#"{"error":""#, $msg, r#"","code":""#, $code, r#""}"#),
            )* }
        }
    };
}

impl Error {
    http_errors! {
        Self::MalformedRequest { .. } => BadRequest, "MALFORMED_REQUEST", "Malformed request";
        Self::LimitExceeded { limit: Limit::Body, .. }
            => PayloadTooLarge, "BODY_TOO_LARGE", "Request body too large";
        Self::LimitExceeded { .. } => BadRequest, "LIMIT_EXCEEDED", "Request too large";
        Self::Timeout => RequestTimeout, "TIMEOUT", "Request timeout";
        Self::NotFound => NotFound, "NOT_FOUND", "Not found";
        Self::MethodNotAllowed { .. } => MethodNotAllowed, "METHOD_NOT_ALLOWED", "Method not allowed";
        Self::Forbidden => Forbidden, "FORBIDDEN", "Forbidden";
        Self::UnsupportedFeature(_) => NotImplemented, "NOT_IMPLEMENTED", "Not implemented";
        Self::ServiceUnavailable
            => ServiceUnavailable, "SERVICE_UNAVAILABLE", "Service temporarily unavailable";
        Self::HandlerFailure(_) => InternalServerError, "INTERNAL_ERROR", "Internal server error";
        Self::ConnectionClosed => InternalServerError, "CONNECTION_CLOSED", "Connection closed";
        Self::RouteConflict { .. } => InternalServerError, "ROUTE_CONFLICT", "Route conflict";
        Self::InvalidPattern { .. } => InternalServerError, "INVALID_PATTERN", "Invalid route pattern";
        Self::UnknownStatus(_) => InternalServerError, "UNKNOWN_STATUS", "Unknown status code";
        Self::Bind { .. } => InternalServerError, "BIND_FAILED", "Bind failed";
        Self::Io(_) => InternalServerError, "IO_ERROR", "I/O error occurred";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        #[rustfmt::skip]
        let cases = [
            (Error::malformed("x"),                     400, "MALFORMED_REQUEST"),
            (Error::limit(Limit::RequestLine, 8),       400, "LIMIT_EXCEEDED"),
            (Error::limit(Limit::HeaderBytes, 8),       400, "LIMIT_EXCEEDED"),
            (Error::limit(Limit::HeaderCount, 8),       400, "LIMIT_EXCEEDED"),
            (Error::limit(Limit::Body, 8),              413, "BODY_TOO_LARGE"),
            (Error::Timeout,                            408, "TIMEOUT"),
            (Error::NotFound,                           404, "NOT_FOUND"),
            (Error::MethodNotAllowed { allowed: vec![] }, 405, "METHOD_NOT_ALLOWED"),
            (Error::Forbidden,                          403, "FORBIDDEN"),
            (Error::UnsupportedFeature("chunked"),      501, "NOT_IMPLEMENTED"),
            (Error::handler("boom"),                    500, "INTERNAL_ERROR"),
            (Error::ServiceUnavailable,                 503, "SERVICE_UNAVAILABLE"),
        ];

        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status, "{err}");
            assert_eq!(err.code(), code);
            assert!(err.json_body().contains(code));
        }
    }

    #[test]
    fn json_body_shape() {
        assert_eq!(
            Error::NotFound.json_body(),
            r#"{"error":"Not found","code":"NOT_FOUND"}"#
        );
    }

    #[test]
    fn handler_errors_keep_their_status() {
        let err = Error::from_handler(Box::new(Error::Forbidden));
        assert!(matches!(err, Error::Forbidden));

        let err = Error::from_handler("database is down".into());
        assert!(matches!(err, Error::HandlerFailure(_)));
        assert_eq!(err.status(), StatusCode::InternalServerError);
    }

    #[test]
    fn only_closed_is_silent() {
        assert!(Error::ConnectionClosed.is_silent());
        assert!(!Error::Timeout.is_silent());
    }
}
