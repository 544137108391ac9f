use crate::{server::pool::PooledBuffer, Error, Limit};
use memchr::memmem;
use std::{fmt, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::sleep,
};
use tracing::debug;

/// Buffered reader over one connection's byte stream.
///
/// Owns a fixed-size buffer that is never grown. Bytes read past the current
/// request stay buffered for the next one, so pipelined requests on a
/// keep-alive connection are not lost. Every wait for more bytes is bounded
/// by the read timeout.
///
/// # Examples
/// ```
/// use pico_web::ByteStreamReader;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let input: &[u8] = b"first line\r\nsecond";
/// let mut reader = ByteStreamReader::new(input, 64, Duration::from_secs(1));
///
/// assert_eq!(reader.read_until(b"\r\n", 32).await.unwrap(), b"first line");
/// assert_eq!(reader.read_exact(6).await.unwrap(), b"second");
/// # }
/// ```
pub struct ByteStreamReader {
    stream: Box<dyn AsyncRead + Send + Unpin>,
    buffer: PooledBuffer,
    start: usize,
    end: usize,
    read_timeout: Duration,
}

impl ByteStreamReader {
    /// Creates a reader with its own buffer of `capacity` bytes.
    pub fn new<R>(stream: R, capacity: usize, read_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::with_buffer(stream, PooledBuffer::detached(capacity), read_timeout)
    }

    pub(crate) fn with_buffer<R>(stream: R, buffer: PooledBuffer, read_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            stream: Box::new(stream),
            buffer,
            start: 0,
            end: 0,
            read_timeout,
        }
    }

    /// Size of the read buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Number of bytes read from the stream but not consumed yet.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.end - self.start
    }

    /// Waits until at least one byte is buffered, for at most `idle`.
    ///
    /// Fails with [`Error::Timeout`] when nothing arrives in time and with
    /// [`Error::ConnectionClosed`] when the peer closes the stream.
    pub async fn wait_for_data(&mut self, idle: Duration) -> Result<(), Error> {
        match self.buffered() {
            0 => self.fill(idle).await,
            _ => Ok(()),
        }
    }

    /// Returns the bytes before the next `delimiter` and consumes both.
    ///
    /// Fails with [`Error::LimitExceeded`] when the delimiter is not found
    /// within `max_bytes` bytes, or when the line does not fit into the
    /// buffer at all.
    pub async fn read_until(&mut self, delimiter: &[u8], max_bytes: usize) -> Result<&[u8], Error> {
        let finder = memmem::Finder::new(delimiter);
        let mut searched = 0;

        let position = loop {
            let window = &self.buffer[self.start..self.end];
            if let Some(pos) = finder.find(&window[searched..]) {
                break searched + pos;
            }

            if window.len() >= max_bytes.saturating_add(delimiter.len()) {
                return Err(Error::limit(Limit::RequestLine, max_bytes));
            }

            // The delimiter may straddle the end of the window
            searched = window.len().saturating_sub(delimiter.len().saturating_sub(1));
            self.fill(self.read_timeout).await?;
        };

        if position > max_bytes {
            return Err(Error::limit(Limit::RequestLine, max_bytes));
        }

        let line_start = self.start;
        self.start += position + delimiter.len();
        Ok(&self.buffer[line_start..line_start + position])
    }

    /// Returns exactly `count` bytes and consumes them.
    ///
    /// `count` must fit into the buffer, otherwise fails with
    /// [`Error::LimitExceeded`] without reading.
    pub async fn read_exact(&mut self, count: usize) -> Result<&[u8], Error> {
        if count > self.capacity() {
            return Err(Error::limit(Limit::Body, self.capacity()));
        }

        while self.buffered() < count {
            self.fill(self.read_timeout).await?;
        }

        let chunk_start = self.start;
        self.start += count;
        Ok(&self.buffer[chunk_start..chunk_start + count])
    }

    /// Returns up to `max_bytes` bytes, waiting only if nothing is buffered.
    pub async fn read_chunk(&mut self, max_bytes: usize) -> Result<&[u8], Error> {
        if max_bytes == 0 {
            return Ok(&[]);
        }

        if self.buffered() == 0 {
            self.fill(self.read_timeout).await?;
        }

        let count = self.buffered().min(max_bytes);
        let chunk_start = self.start;
        self.start += count;
        Ok(&self.buffer[chunk_start..chunk_start + count])
    }

    /// Reads and throws away exactly `count` bytes.
    pub async fn discard(&mut self, mut count: usize) -> Result<(), Error> {
        while count > 0 {
            count -= self.read_chunk(count).await?.len();
        }
        Ok(())
    }

    async fn fill(&mut self, wait: Duration) -> Result<(), Error> {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        } else if self.end == self.buffer.len() && self.start > 0 {
            self.buffer.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }

        if self.end == self.buffer.len() {
            return Err(Error::limit(Limit::RequestLine, self.buffer.len()));
        }

        let end = self.end;
        let (stream, buffer) = (&mut self.stream, &mut self.buffer[end..]);

        let read = tokio::select! {
            biased;
            result = stream.read(buffer) => result.map_err(|e| {
                debug!(cause = %e, "Socket read failed");
                Error::ConnectionClosed
            })?,
            _ = sleep(wait) => return Err(Error::Timeout),
        };

        if read == 0 {
            return Err(Error::ConnectionClosed);
        }

        self.end += read;
        Ok(())
    }
}

impl fmt::Debug for ByteStreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStreamReader")
            .field("capacity", &self.capacity())
            .field("buffered", &self.buffered())
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn reader(input: &'static [u8], capacity: usize) -> ByteStreamReader {
        ByteStreamReader::new(input, capacity, TIMEOUT)
    }

    #[tokio::test]
    async fn lines() {
        let mut reader = reader(b"GET / HTTP/1.1\r\nHost: a\r\n\r\nrest", 64);

        assert_eq!(reader.read_until(b"\r\n", 64).await.unwrap(), b"GET / HTTP/1.1");
        assert_eq!(reader.read_until(b"\r\n", 64).await.unwrap(), b"Host: a");
        assert_eq!(reader.read_until(b"\r\n", 64).await.unwrap(), b"");
        assert_eq!(reader.buffered(), 4);
        assert_eq!(reader.read_exact(4).await.unwrap(), b"rest");
    }

    #[tokio::test]
    async fn line_limits() {
        #[rustfmt::skip]
        let cases: [(&'static [u8], usize, usize); 3] = [
            (b"abcdefgh\r\n", 4,  64), // longer than allowed
            (b"abcdefgh",     4,  64), // no delimiter at all
            (b"abcdefgh",     64, 8),  // buffer full
        ];

        for (input, max, capacity) in cases {
            let err = reader(input, capacity).read_until(b"\r\n", max).await.unwrap_err();
            assert!(matches!(err, Error::LimitExceeded { limit: Limit::RequestLine, .. }), "{err}");
        }
    }

    #[tokio::test]
    async fn closed_mid_line() {
        let err = reader(b"GET / HT", 64).read_until(b"\r\n", 64).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn compacts_before_refill() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = ByteStreamReader::new(server, 8, TIMEOUT);

        client.write_all(b"abc\r\nde").await.unwrap();
        assert_eq!(reader.read_until(b"\r\n", 8).await.unwrap(), b"abc");

        client.write_all(b"fgh\r\n").await.unwrap();
        assert_eq!(reader.read_until(b"\r\n", 8).await.unwrap(), b"defgh");
    }

    #[tokio::test]
    async fn delimiter_split_across_reads() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = ByteStreamReader::new(server, 32, TIMEOUT);

        let task = tokio::spawn(async move {
            client.write_all(b"key\r").await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(b"\nnext").await.unwrap();
            client
        });

        assert_eq!(reader.read_until(b"\r\n", 16).await.unwrap(), b"key");
        drop(task.await.unwrap());
    }

    #[tokio::test]
    async fn chunks_and_discard() {
        let mut reader = reader(b"0123456789", 4);

        assert_eq!(reader.read_chunk(3).await.unwrap(), b"012");
        reader.discard(5).await.unwrap();
        assert_eq!(reader.read_chunk(8).await.unwrap(), b"89");
        assert!(matches!(reader.read_chunk(1).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn read_exact_over_capacity() {
        let err = reader(b"0123456789", 4).read_exact(8).await.unwrap_err();
        assert!(matches!(err, Error::LimitExceeded { limit: Limit::Body, max: 4 }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts() {
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = ByteStreamReader::new(server, 32, TIMEOUT);

        let err = reader.wait_for_data(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_message() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = ByteStreamReader::new(server, 32, TIMEOUT);

        client.write_all(b"GET /").await.unwrap();
        let err = reader.read_until(b"\r\n", 32).await.unwrap_err();

        assert!(matches!(err, Error::Timeout));
        assert_eq!(reader.buffered(), 5);
    }
}
