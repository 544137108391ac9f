//! Server configuration limits and timeouts
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally small so the server fits on devices with
//! tens of kilobytes of RAM, and to protect against:
//! - Resource exhaustion attacks
//! - Memory overflows
//! - Slowloris attacks
//! - Header flooding
//!
//! # Memory Consumption
//!
//! Each active connection consumes memory according to:
//!
//! `Total` = [`Read Buffer`](crate::limits::ReqLimits#memory-allocation-strategy) +
//!           [`Response Buffer`](crate::limits::RespLimits) +
//!           `Runtime Overhead`
//!
//! The number of connections is capped by [`ServerLimits::max_connections`],
//! so total buffer memory is bounded by `max_connections * estimated_buffer_size()`.
//!
//! # Examples
//!
//! ```no_run
//! use pico_web::{Server, limits::{ConnLimits, ReqLimits, ServerLimits}};
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), pico_web::Error> {
//!     let mut server = Server::new();
//!     server
//!         .server_limits(ServerLimits {
//!             max_connections: 4, // Tiny device
//!             ..ServerLimits::default()
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(10),
//!             max_requests_per_connection: 20,
//!             ..ConnLimits::default()
//!         })
//!         .request_limits(ReqLimits {
//!             header_count: 8,
//!             body_size: 1024,
//!             ..ReqLimits::default()
//!         });
//!
//!     server.run("0.0.0.0", 80).await
//! }
//! ```

use std::time::Duration;

/// Controls server-level admission and error reporting.
///
/// # Connection management
/// ```text
///                  [------------]
///                  [ Tcp accept ]
///                  [------------]
///                        ||
///                        || TCP_STREAM
///                        \/
/// [--------------]  Yes  /----------------------\  No  [-------------]
/// [ Spawn a task ] <==== | Is a buffer in pool? | ===> [ Sending 503 ]
/// [--------------]       \----------------------/      [-------------]
///        ||
///        \/
/// [--------------------]
/// [ Return the buffer  ]
/// [ to the pool on end ]
/// [--------------------]
/// ```
///
/// Every connection task owns one read buffer taken from a fixed pool of
/// `max_connections` buffers. When the pool is empty the connection is
/// answered with `503 Service Unavailable` and closed.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Maximum number of concurrently served connections (default: `16`).
    ///
    /// This is also the size of the read-buffer pool, see
    /// [Connection management](#connection-management).
    pub max_connections: usize,

    /// Listen backlog passed to the operating system (default: `32`).
    ///
    /// Connections the kernel has accepted but the server has not yet picked up.
    pub max_pending_connections: usize,

    /// Format for error responses (default: `true`)
    ///
    /// # Examples
    /// If `true`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// content-type: application/json\r
    /// content-length: 56\r
    /// connection: close\r
    /// \r
    /// {"error":"Malformed request","code":"MALFORMED_REQUEST"}
    /// ```
    /// If `false`, then on error the server will return:
    /// ```text
    /// HTTP/1.1 400 Bad Request\r
    /// content-length: 0\r
    /// connection: close\r
    /// \r
    /// ```
    pub json_errors: bool,

    /// Adds `Server-Timing: req;dur=<ms>` to every response (default: `false`).
    ///
    /// Useful while debugging slow handlers from the browser's network tab.
    pub server_timing: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_connections: 16,
            max_pending_connections: 32,
            json_errors: true,
            server_timing: false,

            _priv: (),
        }
    }
}

/// Connection-level limits and timeouts
///
/// Controls individual TCP connection behavior including timeouts,
/// lifetime, and request limits.
///
/// Default values balance resource usage and security.
/// Only change if you understand the consequences.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Maximum duration to wait for more request bytes (default: `5 seconds`)
    ///
    /// Applies to the first request of a connection and to every read while a
    /// request is in flight. A client that sent part of a request gets
    /// `408 Request Timeout`; a client that sent nothing is closed silently.
    /// Prevents `slowloris attacks` and frees resources from inactive clients.
    pub socket_read_timeout: Duration,

    /// Maximum duration of a single socket write (default: `3 seconds`)
    ///
    /// If data can't be written in time, connection is terminated.
    pub socket_write_timeout: Duration,

    /// Maximum idle time between two requests on one connection (default: `5 seconds`)
    ///
    /// The timer starts after a response has been written. Expiry closes the
    /// connection silently.
    pub keep_alive_timeout: Duration,

    /// Maximum number of requests allowed per connection (default: `100`)
    ///
    /// The last allowed response carries `connection: close`.
    /// Combined with `connection_lifetime`, ensures connections don't live indefinitely.
    pub max_requests_per_connection: usize,

    /// Maximum lifetime of connection from establishment to closure (default: `2 minutes`)
    ///
    /// Final safety net that guarantees no connection lives longer than this duration.
    /// Checked between requests, so a request in flight is always answered.
    pub connection_lifetime: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(5),
            socket_write_timeout: Duration::from_secs(3),
            keep_alive_timeout: Duration::from_secs(5),
            max_requests_per_connection: 100,
            connection_lifetime: Duration::from_secs(120),

            _priv: (),
        }
    }
}

/// HTTP request parsing limits and buffer allocation strategy
///
/// ⚠️ **SECURITY-FIRST DEFAULTS**
///
/// These limits are intentionally conservative. They work well for:
/// - Sensor dashboards and device configuration pages
/// - Small REST APIs
/// - Low-memory environments
///
/// 🔧 **You MAY need to increase these if you see:**
/// - `413 Payload Too Large` for legitimate uploads
/// - `400 Bad Request` for long URLs or many cookies
///
/// # Memory Allocation Strategy
///
/// Each connection owns one read buffer of `buffer_size` bytes. The buffer is
/// never grown: a request line or header line must fit into it. Bodies larger
/// than `eager_body_size` are not buffered at all; handlers stream them
/// through the same read buffer.
///
/// | Component | Limit | Default | Purpose |
/// |-----------|-------|---------|---------|
/// | Read buffer | `buffer_size` | 2048 B | Socket reads |
/// | Parsed head | `line_size + header_bytes` | 5120 B | Owned method, path, headers |
/// | Eager body | `eager_body_size` | 1024 B | Small bodies pre-read |
/// | **Total** | | **8192 B = 8 KB** | Per connection upper bound |
///
/// # Example
/// ```
/// use pico_web::limits::ReqLimits;
///
/// let limits = ReqLimits::default();
/// let buffer_size = limits.estimated_buffer_size();
/// println!("Each connection needs at most {} bytes for request data", buffer_size);
/// ```
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Size of the per-connection read buffer in bytes (default: `2048 B`)
    ///
    /// Fixed at connection start and never grown.
    pub buffer_size: usize,

    /// Maximum request line length in bytes, without CRLF (default: `1024 B`)
    ///
    /// Covers `METHOD SP TARGET SP VERSION`. Values above `buffer_size` are
    /// effectively capped by the buffer.
    pub line_size: usize,

    /// Maximum request target length including query string (default: `512 B`)
    pub url_size: usize,

    /// Maximum number of headers per request (default: `16 headers`)
    ///
    /// Typical browsers send 10-12 headers.
    pub header_count: usize,

    /// Maximum total size of all header lines in bytes (default: `4096 B`)
    pub header_bytes: usize,

    /// Maximum request body size in bytes, as declared by `Content-Length`
    /// (default: `16 KB`)
    ///
    /// Larger declarations are rejected with `413 Payload Too Large` before
    /// a single body byte is read.
    pub body_size: usize,

    /// Bodies up to this size are read before the handler runs (default: `1024 B`)
    ///
    /// Larger bodies stay on the socket until the handler reads them.
    /// Capped by `buffer_size`.
    pub eager_body_size: usize,

    /// Maximum number of query parameters (default: `16`)
    ///
    /// Prevents query parameter explosion attacks. Also applies to
    /// `application/x-www-form-urlencoded` bodies.
    pub query_parts: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            buffer_size: 2048,
            line_size: 1024, // GET /api/v1/sensors/42/history?from=...&to=... HTTP/1.1
            url_size: 512,

            header_count: 16,   // Typical: 10-12 browser headers + a few custom
            header_bytes: 4096, // Fits a few cookies and a bearer token

            body_size: 16 * 1024, // Good for JSON and small uploads
            eager_body_size: 1024,

            query_parts: 16,

            _priv: (),
        }
    }
}

impl ReqLimits {
    /// Returns the upper bound of request memory held by one connection.
    ///
    /// The value includes:
    /// - the read buffer
    /// - the owned request line and headers
    /// - an eagerly read body
    ///
    /// # Note
    /// Streamed bodies are not counted: they pass through the read buffer.
    ///
    /// # Example
    /// ```
    /// use pico_web::limits::ReqLimits;
    ///
    /// let limits = ReqLimits {
    ///     buffer_size: 1024,
    ///     line_size: 256,
    ///     header_bytes: 1024,
    ///     eager_body_size: 512,
    ///     ..ReqLimits::default()
    /// };
    /// assert_eq!(limits.estimated_buffer_size(), 1024 + 256 + 1024 + 512);
    /// ```
    #[inline]
    pub fn estimated_buffer_size(&self) -> usize {
        self.buffer_size + self.line_size.min(self.buffer_size) + self.header_bytes + self.eager_body()
    }

    #[inline(always)]
    pub(crate) fn eager_body(&self) -> usize {
        self.eager_body_size.min(self.buffer_size)
    }
}

/// Configuration for response serialization.
///
/// Response heads are serialized into a buffer of `default_capacity` bytes.
/// Buffered bodies are appended to it and sent with the head in one write;
/// streamed bodies (files) are sent in chunks of `file_chunk_size` bytes.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial buffer capacity allocated for response heads (default: `512 B`)
    pub default_capacity: usize,

    /// Chunk size for streamed bodies such as static files (default: `512 B`)
    pub file_chunk_size: usize,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 512,
            file_chunk_size: 512,

            _priv: (),
        }
    }
}
