//! Buffered, deadline-aware reader over the connection socket.

use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

const INITIAL_CAPACITY: usize = 8192;

/// Largest message accepted from the server, its own allocation limit.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Reads protocol primitives from an async byte source.
///
/// All reads honour the deadline set with [`Reader::set_timeout`]; once it
/// passes, reads fail with [`io::ErrorKind::TimedOut`]. EOF surfaces as
/// [`io::ErrorKind::UnexpectedEof`].
#[derive(Debug)]
pub struct Reader<R> {
    inner: R,
    buf: BytesMut,
    temp: Vec<u8>,
    deadline: Option<Instant>,
}

impl<R: AsyncRead + Unpin> Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            temp: Vec::new(),
            deadline: None,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Sets the read deadline `timeout` from now. A zero timeout clears it.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };
    }

    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    /// Number of bytes read from the socket but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Ensures at least `n` bytes are buffered.
    async fn fill(&mut self, n: usize) -> io::Result<()> {
        while self.buf.len() < n {
            self.buf.reserve(n - self.buf.len());
            let read = match self.deadline {
                Some(deadline) => {
                    tokio::time::timeout_at(deadline, self.inner.read_buf(&mut self.buf))
                        .await
                        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timeout"))??
                }
                None => self.inner.read_buf(&mut self.buf).await?,
            };
            if read == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        Ok(())
    }

    /// Reads exactly `n` bytes. The returned slice shares the read buffer's
    /// allocation and stays valid independently of later reads.
    pub async fn read_n(&mut self, n: usize) -> io::Result<Bytes> {
        self.fill(n).await?;
        Ok(self.buf.split_to(n).freeze())
    }

    pub async fn read_byte(&mut self) -> io::Result<u8> {
        self.fill(1).await?;
        Ok(self.buf.get_u8())
    }

    pub async fn read_int16(&mut self) -> io::Result<i16> {
        self.fill(2).await?;
        Ok(self.buf.get_i16())
    }

    pub async fn read_int32(&mut self) -> io::Result<i32> {
        self.fill(4).await?;
        Ok(self.buf.get_i32())
    }

    /// Reads a NUL-terminated string, without the terminator.
    pub async fn read_string(&mut self) -> io::Result<Bytes> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|&b| b == 0) {
                let end = scanned + pos;
                let s = self.buf.split_to(end).freeze();
                self.buf.advance(1);
                return Ok(s);
            }
            scanned = self.buf.len();
            self.fill(scanned + 1).await?;
        }
    }

    /// Fills `dst` completely.
    pub async fn read_full(&mut self, dst: &mut [u8]) -> io::Result<()> {
        self.fill(dst.len()).await?;
        self.buf.copy_to_slice(dst);
        Ok(())
    }

    /// Reads `n` bytes into a scratch buffer owned by the reader. The slice
    /// is only valid until the next call.
    pub async fn read_full_temp(&mut self, n: usize) -> io::Result<&[u8]> {
        self.fill(n).await?;
        self.temp.clear();
        self.temp.extend_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        Ok(&self.temp)
    }

    /// Skips `n` bytes.
    pub async fn discard(&mut self, n: usize) -> io::Result<()> {
        let mut left = n;
        while left > 0 {
            if self.buf.is_empty() {
                self.fill(1).await?;
            }
            let take = left.min(self.buf.len());
            self.buf.advance(take);
            left -= take;
        }
        Ok(())
    }

    /// Reads one complete backend frame: its type byte and body.
    ///
    /// Nothing is consumed until the whole frame is buffered, so a deadline
    /// expiring mid-frame leaves the stream positioned at the frame start.
    pub async fn read_message(&mut self) -> io::Result<(u8, Bytes)> {
        self.fill(5).await?;
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len < 4 || len as usize > MAX_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid message length {}", len),
            ));
        }
        self.fill(1 + len as usize).await?;
        let kind = self.buf.get_u8();
        self.buf.advance(4);
        let body = self.buf.split_to(len as usize - 4).freeze();
        Ok((kind, body))
    }

    /// Discards the reader, returning the inner source and any bytes that
    /// were buffered but never consumed.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_primitives() {
        let data: &[u8] = &[0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03, b'h', b'i', 0, b'x', b'y'];
        let mut rd = Reader::new(data);

        assert_eq!(rd.read_byte().await.unwrap(), 1);
        assert_eq!(rd.read_int16().await.unwrap(), 2);
        assert_eq!(rd.read_int32().await.unwrap(), 3);
        assert_eq!(&rd.read_string().await.unwrap()[..], b"hi");
        assert_eq!(&rd.read_full_temp(2).await.unwrap()[..], b"xy");
        let err = rd.read_byte().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_read_message_across_chunks() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut rd = Reader::new(rx);

        tokio::spawn(async move {
            tx.write_all(&[b'C', 0, 0]).await.unwrap();
            tokio::task::yield_now().await;
            tx.write_all(&[0, 13]).await.unwrap();
            tx.write_all(b"SELECT 1\0").await.unwrap();
        });

        let (kind, body) = rd.read_message().await.unwrap();
        assert_eq!(kind, b'C');
        assert_eq!(&body[..], b"SELECT 1\0");
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let data: &[u8] = &[b'D', 0x7f, 0xff, 0xff, 0xff, 0];
        let mut rd = Reader::new(data);
        let err = rd.read_message().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(rd.buf.capacity() < 1024 * 1024);
    }

    #[tokio::test]
    async fn test_deadline_does_not_consume_partial_frame() {
        let (mut tx, rx) = tokio::io::duplex(64);
        let mut rd = Reader::new(rx);

        tx.write_all(&[b'Z', 0, 0, 0, 5]).await.unwrap();
        rd.set_timeout(Duration::from_millis(20));
        let err = rd.read_message().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        tx.write_all(b"I").await.unwrap();
        rd.clear_deadline();
        let (kind, body) = rd.read_message().await.unwrap();
        assert_eq!(kind, b'Z');
        assert_eq!(&body[..], b"I");
    }

    #[tokio::test]
    async fn test_discard() {
        let data: &[u8] = b"abcdef";
        let mut rd = Reader::new(data);
        rd.discard(4).await.unwrap();
        let mut rest = [0u8; 2];
        rd.read_full(&mut rest).await.unwrap();
        assert_eq!(&rest, b"ef");
    }
}
