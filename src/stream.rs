//! A single transport stream.
//!
//! A [`Stream`] moves bytes and nothing else: it never interprets protocol
//! semantics. Frame parsing on top of the byte reader lives in
//! [`StreamReader::read_operation`], which peeks the operation code, reads the
//! fixed header, sizes the trailer from it, then reads the trailer.
//!
//! # Example
//!
//! ```ignore
//! let mut stream = connection.open_unidirectional().await?;
//! stream.send(&Operation::Message { msg_id: 1, payload_len: 4, priority: 0 }).await?;
//! stream.send(&Operation::block(&b"ping"[..])).await?;
//! stream.send(&Operation::BlockEnd { total: 4 }).await?;
//! stream.finish().await?;
//! ```

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::correlation::CorrelationKey;
use crate::error::{FrameError, ProbeError, ProtocolFailure, Result};
use crate::protocol::{Operation, OperationKind, DEFAULT_MAX_TRAILER_LEN, DONE_ENTRY_LEN};
use crate::transport::{BoxReader, BoxWriter, RawStream};

/// Stream identifier, shared by both ends of the session.
pub type StreamId = i64;

/// Read chunk reserved per fill.
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Unidirectional,
    Bidirectional,
}

/// Buffered reader over the read half of a stream.
///
/// Nothing is consumed from the buffer until a read completes, so every
/// method is safe to cancel (for example by a timeout).
pub struct StreamReader {
    inner: BoxReader,
    buf: BytesMut,
    eof: bool,
    max_trailer_len: usize,
}

impl StreamReader {
    pub fn new(inner: BoxReader) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            eof: false,
            max_trailer_len: DEFAULT_MAX_TRAILER_LEN,
        }
    }

    /// Reject frames whose trailer exceeds `max` bytes.
    pub fn with_max_trailer_len(mut self, max: usize) -> Self {
        self.max_trailer_len = max;
        self
    }

    /// Bytes already buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull one chunk from the transport. Returns false at end of stream.
    async fn fill_more(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        self.buf.reserve(READ_CHUNK);
        let n = self.inner.read_buf(&mut self.buf).await?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n > 0)
    }

    /// Buffer at least `n` bytes. Returns false if the stream ends first.
    async fn fill(&mut self, n: usize) -> io::Result<bool> {
        while self.buf.len() < n {
            if !self.fill_more().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn read_byte(&mut self) -> io::Result<u8> {
        let bytes = self.read_exact(1).await?;
        Ok(bytes[0])
    }

    pub async fn read_exact(&mut self, n: usize) -> io::Result<Bytes> {
        if !self.fill(n).await? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended with {} of {} bytes", self.buf.len(), n),
            ));
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Number of readable bytes, waiting for at least one unless the stream ended.
    pub async fn available(&mut self) -> io::Result<usize> {
        if self.buf.is_empty() {
            self.fill_more().await?;
        }
        Ok(self.buf.len())
    }

    async fn fill_frame(&mut self, kind: OperationKind, needed: usize) -> Result<()> {
        if !self.fill(needed).await? {
            return Err(FrameError::Truncated {
                kind,
                needed,
                available: self.buf.len(),
            }
            .into());
        }
        Ok(())
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    /// An end of stream inside a frame is [`FrameError::Truncated`].
    pub async fn read_operation(&mut self) -> Result<Option<Operation>> {
        if !self.fill(1).await? {
            return Ok(None);
        }
        let code = self.buf[0];
        let kind = OperationKind::from_code(code).ok_or(FrameError::UnknownOpcode(code))?;

        let header_end = 1 + kind.header_len();
        self.fill_frame(kind, header_end).await?;
        let trailer = match kind.trailer_len(&self.buf[1..header_end])? {
            // A DONE without a count takes the whole entries already buffered.
            0 if kind == OperationKind::Done => {
                let buffered = self.buf.len() - header_end;
                buffered - buffered % DONE_ENTRY_LEN
            }
            declared => declared,
        };
        if trailer > self.max_trailer_len {
            return Err(FrameError::Oversized {
                kind,
                len: trailer,
                max: self.max_trailer_len,
            }
            .into());
        }

        let frame_len = header_end + trailer;
        self.fill_frame(kind, frame_len).await?;
        let frame = self.buf.split_to(frame_len);
        Ok(Some(Operation::decode(kind, &frame[1..])?))
    }
}

fn timed_out(id: StreamId, after: Duration) -> ProbeError {
    ProtocolFailure::Timeout {
        key: CorrelationKey::Stream(id),
        after,
    }
    .into()
}

/// Called once when a stream is released.
pub(crate) type ReleaseHook = Box<dyn FnOnce(StreamId) + Send>;

/// One transport stream owned by whoever opened (or accepted) it.
pub struct Stream {
    id: StreamId,
    direction: Direction,
    writer: Option<BoxWriter>,
    reader: Option<StreamReader>,
    on_release: Option<ReleaseHook>,
}

impl Stream {
    /// Wrap a raw transport stream.
    pub fn new(raw: RawStream) -> Self {
        Self {
            id: raw.id,
            direction: raw.direction,
            writer: raw.writer,
            reader: raw.reader.map(StreamReader::new),
            on_release: None,
        }
    }

    pub(crate) fn with_release(mut self, hook: ReleaseHook) -> Self {
        self.on_release = Some(hook);
        self
    }

    pub(crate) fn with_max_trailer_len(mut self, max: usize) -> Self {
        self.reader = self.reader.take().map(|r| r.with_max_trailer_len(max));
        self
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether byte-level reads are possible on this handle.
    pub fn is_readable(&self) -> bool {
        self.reader.is_some()
    }

    /// Write raw bytes.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(ProbeError::StreamClosed(self.id))?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Encode and write one operation.
    pub async fn send(&mut self, op: &Operation) -> Result<()> {
        tracing::trace!(stream = self.id, kind = %op.kind(), "send");
        self.write(&op.encode_frame()).await
    }

    fn reader(&mut self) -> Result<&mut StreamReader> {
        self.reader.as_mut().ok_or(ProbeError::NotReadable(self.id))
    }

    pub async fn read_byte(&mut self, timeout: Duration) -> Result<u8> {
        let id = self.id;
        let reader = self.reader()?;
        match tokio::time::timeout(timeout, reader.read_byte()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(timed_out(id, timeout)),
        }
    }

    pub async fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Bytes> {
        let id = self.id;
        let reader = self.reader()?;
        match tokio::time::timeout(timeout, reader.read_exact(n)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(timed_out(id, timeout)),
        }
    }

    /// Poll for readable bytes without consuming them.
    ///
    /// Returns 0 if nothing arrives within `timeout` or the stream has ended.
    pub async fn bytes_available(&mut self, timeout: Duration) -> Result<usize> {
        let reader = self.reader()?;
        match tokio::time::timeout(timeout, reader.available()).await {
            Ok(result) => Ok(result?),
            Err(_) => Ok(0),
        }
    }

    /// Read the next frame off this stream's own read half.
    pub async fn read_operation(&mut self) -> Result<Option<Operation>> {
        self.reader()?.read_operation().await
    }

    /// Half-close: no more writes, pending waits stay armed.
    pub async fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    /// Release both halves and cancel waits keyed on this stream. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(stream = self.id, error = %e, "shutdown on close failed");
            }
        }
        self.release();
    }

    fn release(&mut self) {
        self.writer = None;
        self.reader = None;
        if let Some(hook) = self.on_release.take() {
            hook(self.id);
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("writable", &self.writer.is_some())
            .field("readable", &self.reader.is_some())
            .finish()
    }
}
