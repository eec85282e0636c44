//! Outgoing message buffer.
//!
//! Frontend messages are framed in place: `start_message` reserves the
//! length field, `finish_message` back-patches it once the body is written.
//! Parameter values inside a Bind message use the same trick through
//! `start_param` / `finish_param`.

use bytes::{BufMut, BytesMut};
use smallvec::SmallVec;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Growable byte buffer holding one or more framed frontend messages.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    bytes: BytesMut,
    /// Offsets of the length fields of messages still being written.
    msg_starts: SmallVec<[usize; 4]>,
    /// Offset of the length field of the parameter being written.
    param_start: Option<usize>,
    /// First length or count that didn't fit its wire field.
    overflow: Option<String>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            bytes: BytesMut::with_capacity(4096),
            msg_starts: SmallVec::new(),
            param_start: None,
            overflow: None,
        }
    }

    /// Begins a typed message: writes the type byte and a placeholder length.
    pub fn start_message(&mut self, kind: u8) {
        self.bytes.put_u8(kind);
        self.start_untyped_message();
    }

    /// Begins a message without a type byte (startup, SSL and cancel requests).
    pub fn start_untyped_message(&mut self) {
        self.msg_starts.push(self.bytes.len());
        self.bytes.put_i32(0);
    }

    /// Patches the length of the innermost open message.
    ///
    /// # Panics
    ///
    /// Panics when no message is open.
    pub fn finish_message(&mut self) {
        let start = self
            .msg_starts
            .pop()
            .expect("finish_message called without start_message");
        let len = self.fit_i32(self.bytes.len() - start, "message length");
        self.bytes[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }

    /// Reserves the length field of a Bind parameter value.
    pub fn start_param(&mut self) {
        self.param_start = Some(self.bytes.len());
        self.bytes.put_i32(0);
    }

    /// Patches the parameter length with the number of bytes written since
    /// `start_param`.
    pub fn finish_param(&mut self) {
        if let Some(start) = self.param_start.take() {
            let len = self.fit_i32(self.bytes.len() - start - 4, "parameter length");
            self.bytes[start..start + 4].copy_from_slice(&len.to_be_bytes());
        }
    }

    /// Marks the current parameter as NULL, discarding anything written
    /// after `start_param`.
    pub fn finish_null_param(&mut self) {
        if let Some(start) = self.param_start.take() {
            self.bytes.truncate(start + 4);
            self.bytes[start..start + 4].copy_from_slice(&(-1i32).to_be_bytes());
        }
    }

    #[inline]
    pub fn write_byte(&mut self, b: u8) {
        self.bytes.put_u8(b);
    }

    #[inline]
    pub fn write_int16(&mut self, n: i16) {
        self.bytes.put_i16(n);
    }

    #[inline]
    pub fn write_int32(&mut self, n: i32) {
        self.bytes.put_i32(n);
    }

    /// Writes a count as Int16. A count that doesn't fit is recorded and
    /// fails the next [`check`](Self::check).
    pub fn write_count16(&mut self, n: usize, what: &str) {
        let n = match i16::try_from(n) {
            Ok(n) => n,
            Err(_) => {
                self.record_overflow(format!("too many {}: {} (max {})", what, n, i16::MAX));
                0
            }
        };
        self.bytes.put_i16(n);
    }

    /// Writes a length as Int32, recording lengths that don't fit.
    pub fn write_len32(&mut self, n: usize, what: &str) {
        let n = self.fit_i32(n, what);
        self.bytes.put_i32(n);
    }

    fn fit_i32(&mut self, n: usize, what: &str) -> i32 {
        match i32::try_from(n) {
            Ok(n) => n,
            Err(_) => {
                self.record_overflow(format!("{} {} exceeds {}", what, n, i32::MAX));
                0
            }
        }
    }

    fn record_overflow(&mut self, msg: String) {
        if self.overflow.is_none() {
            self.overflow = Some(msg);
        }
    }

    /// Fails when a length or count written since the last reset didn't
    /// fit its field. Such a buffer must not be sent.
    pub fn check(&self) -> Result<(), &str> {
        match &self.overflow {
            Some(msg) => Err(msg),
            None => Ok(()),
        }
    }

    /// Writes a NUL-terminated string.
    pub fn write_string(&mut self, s: &str) {
        self.bytes.put_slice(s.as_bytes());
        self.bytes.put_u8(0);
    }

    /// Writes a NUL-terminated string from raw bytes.
    pub fn write_bytes_string(&mut self, s: &[u8]) {
        self.bytes.put_slice(s);
        self.bytes.put_u8(0);
    }

    #[inline]
    pub fn write_bytes(&mut self, b: &[u8]) {
        self.bytes.put_slice(b);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Drops all buffered bytes and any half-written message state.
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.msg_starts.clear();
        self.param_start = None;
        self.overflow = None;
    }

    /// Writes every buffered message to `w` and clears the buffer.
    ///
    /// # Panics
    ///
    /// Panics when a message was started but not finished.
    pub async fn flush<W>(&mut self, w: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        assert!(
            self.msg_starts.is_empty(),
            "flush called with an unfinished message"
        );
        w.write_all(&self.bytes).await?;
        w.flush().await?;
        self.bytes.clear();
        Ok(())
    }
}
