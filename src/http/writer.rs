use crate::{
    http::{
        response::{write_support::write_u128, Body, Response},
        types::Version,
    },
    limits::RespLimits,
    Error, StatusCode,
};
use std::time::Duration;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::{debug, warn};

/// How a response is sent for the request it answers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteContext {
    pub(crate) version: Version,
    pub(crate) head_only: bool,
    pub(crate) keep_alive: bool,
}

/// Serializes responses onto the write half of a connection.
///
/// The head is built in a reusable buffer; a buffered body is appended and
/// everything goes out in one write. Streamed bodies follow chunk by chunk.
/// Every write is bounded by the socket write timeout.
pub(crate) struct ResponseWriter<W> {
    stream: W,
    buffer: Vec<u8>,
    default_capacity: usize,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    pub(crate) fn new(stream: W, limits: &RespLimits, write_timeout: Duration) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(limits.default_capacity),
            default_capacity: limits.default_capacity,
            write_timeout,
        }
    }

    /// Writes `response` and reports whether the connection stays open.
    pub(crate) async fn write(&mut self, response: Response, ctx: WriteContext) -> Result<bool, Error> {
        let Response {
            status,
            headers,
            body,
            keep_alive: response_keep_alive,
            ..
        } = response;

        let status = status.unwrap_or(StatusCode::Ok);
        let length = body.length();
        let declared_close = headers
            .iter()
            .any(|(name, value)| name.eq_ignore_ascii_case("connection") && has_close_token(value));
        let keep_alive = ctx.keep_alive && response_keep_alive && !declared_close && length.is_some();
        let send_body = !ctx.head_only && !status.is_bodiless();

        self.reset_buffer();
        let buf = &mut self.buffer;
        buf.extend_from_slice(status.status_line(ctx.version));

        let mut has_content_type = false;
        for (name, value) in &headers {
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
                continue;
            }
            if has_line_break(name) || has_line_break(value) {
                warn!(header = %name.escape_debug(), "Dropping header with a line break");
                continue;
            }
            has_content_type |= name.eq_ignore_ascii_case("content-type");

            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        if !has_content_type && length != Some(0) && !status.is_bodiless() {
            buf.extend_from_slice(b"content-type: text/plain\r\n");
        }
        if let (Some(length), false) = (length, status.is_bodiless()) {
            buf.extend_from_slice(b"content-length: ");
            write_u128(length as u128, buf);
            buf.extend_from_slice(b"\r\n");
        }
        if let Some(value) = connection_header(ctx.version, keep_alive) {
            buf.extend_from_slice(b"connection: ");
            buf.extend_from_slice(value);
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");

        match body {
            Body::Bytes(bytes) if send_body => {
                self.buffer.extend_from_slice(&bytes);
                self.flush_buffer().await?;
            }
            Body::Stream { mut producer, .. } if send_body => {
                self.flush_buffer().await?;
                loop {
                    let chunk = match producer.next_chunk().await {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(cause = %e, "Body stream failed mid-response");
                            return Err(Error::Io(e));
                        }
                    };
                    write_timed(&mut self.stream, chunk, self.write_timeout).await?;
                }
            }
            _ => self.flush_buffer().await?,
        }

        self.flush().await?;
        Ok(keep_alive)
    }

    /// Closes the write side; errors are irrelevant at this point.
    pub(crate) async fn shutdown(&mut self) {
        let _ = timeout(self.write_timeout, self.stream.shutdown()).await;
    }

    async fn flush_buffer(&mut self) -> Result<(), Error> {
        write_timed(&mut self.stream, &self.buffer, self.write_timeout).await
    }

    async fn flush(&mut self) -> Result<(), Error> {
        match timeout(self.write_timeout, self.stream.flush()).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(Error::ConnectionClosed),
        }
    }

    fn reset_buffer(&mut self) {
        if self.buffer.capacity() > self.default_capacity * 8 {
            self.buffer = Vec::with_capacity(self.default_capacity);
        } else {
            self.buffer.clear();
        }
    }
}

async fn write_timed<W: AsyncWrite + Unpin>(stream: &mut W, bytes: &[u8], limit: Duration) -> Result<(), Error> {
    match timeout(limit, stream.write_all(bytes)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(cause = %e, "Socket write failed");
            Err(Error::ConnectionClosed)
        }
        Err(_) => {
            debug!("Socket write timed out");
            Err(Error::ConnectionClosed)
        }
    }
}

#[inline]
fn has_line_break(text: &str) -> bool {
    text.bytes().any(|b| b == b'\r' || b == b'\n')
}

/// Whether a `connection` header value lists the `close` option.
#[inline]
fn has_close_token(value: &str) -> bool {
    value.split(',').any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// `HTTP/1.1` defaults to keep-alive, `HTTP/1.0` to close.
#[inline]
fn connection_header(version: Version, keep_alive: bool) -> Option<&'static [u8]> {
    match (version, keep_alive) {
        (Version::Http11, true) => None,
        (Version::Http10, true) => Some(b"keep-alive"),
        (_, false) => Some(b"close"),
    }
}
