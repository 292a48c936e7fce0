//! Outbound side of the transport.
//!
//! All writes go through a [`WriteBatch`]: frames are encoded into one buffer
//! and the whole buffer is written under the transport's write lock, so two
//! commits can never interleave their frames on the wire.

use super::frame::{self, Frame, FrameKind, LENGTH_PREFIX_SIZE};
use crate::cancel::CancellationToken;
use crate::config::TransportConfig;
use crate::deadline::Deadline;
use crate::error::{Result, TransportError};
use crate::logging::ConnectionLogger;
use crate::metadata::Metadata;
use crate::status::Status;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum WriterState {
    Open(BoxedWriter),
    /// A commit failed or was abandoned part-way through.
    Broken,
    Closed,
}

/// Serialized writer for one connection.
pub struct Transport {
    writer: Mutex<WriterState>,
    closed: CancellationToken,
    max_frame_size: usize,
    logger: ConnectionLogger,
}

impl Transport {
    pub fn new<W>(writer: W, logger: ConnectionLogger) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_max_frame_size(writer, logger, TransportConfig::MAX_FRAME_SIZE)
    }

    /// Like [`new`](Self::new), refusing frames larger than `max_frame_size`.
    pub fn with_max_frame_size<W>(writer: W, logger: ConnectionLogger, max_frame_size: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Mutex::new(WriterState::Open(Box::new(writer))),
            closed: CancellationToken::new(),
            max_frame_size,
            logger,
        }
    }

    /// Start a batch of frames to be committed atomically.
    pub fn write(&self) -> WriteBatch<'_> {
        WriteBatch {
            transport: self,
            buf: BytesMut::new(),
            frames: 0,
            oversized: None,
            unless_completed: None,
        }
    }

    /// Commit a single frame.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        self.write().frame(frame).commit().await
    }

    /// Whether the connection has not been closed locally.
    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Fires when [`close`](Self::close) is called. The read loop watches it.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Close the outbound half. In-flight and future commits fail with `Closed`.
    ///
    /// Never waits: an in-flight commit notices the close and drops the writer itself.
    pub fn close(&self) {
        self.closed.cancel();
        if let Ok(mut state) = self.writer.try_lock() {
            *state = WriterState::Closed;
        }
    }

    pub fn logger(&self) -> ConnectionLogger {
        self.logger
    }

    async fn commit_bytes(&self, buf: &[u8], frames: usize, unless_completed: Option<&AtomicBool>) -> Result<()> {
        let mut state = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TransportError::Closed),
            state = self.writer.lock() => state,
        };
        if self.closed.is_cancelled() {
            *state = WriterState::Closed;
            return Err(TransportError::Closed);
        }
        // Checked under the lock: trailers written after the flag was set follow this commit.
        if unless_completed.is_some_and(|completed| completed.load(Ordering::SeqCst)) {
            return Err(TransportError::CallCompleted);
        }

        // Held as Broken while writing so an abandoned commit leaves it unusable.
        let mut writer = match std::mem::replace(&mut *state, WriterState::Broken) {
            WriterState::Open(writer) => writer,
            WriterState::Broken => return Err(TransportError::Broken),
            WriterState::Closed => {
                *state = WriterState::Closed;
                return Err(TransportError::Closed);
            }
        };

        let written = tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                *state = WriterState::Closed;
                return Err(TransportError::Closed);
            }
            result = async {
                writer.write_all(buf).await?;
                writer.flush().await
            } => result,
        };

        match written {
            Ok(()) => {
                // A close that raced this commit could not take the lock.
                *state = if self.closed.is_cancelled() {
                    WriterState::Closed
                } else {
                    WriterState::Open(writer)
                };
                Ok(())
            }
            Err(err) => {
                self.logger
                    .error(format_args!("Write of {} frame(s) failed: {}", frames, err));
                Err(err.into())
            }
        }
    }
}

/// Frames accumulated for one atomic commit.
#[must_use = "a write batch does nothing until committed"]
pub struct WriteBatch<'a> {
    transport: &'a Transport,
    buf: BytesMut,
    frames: usize,
    /// Content length of the first frame over the transport's limit.
    oversized: Option<usize>,
    unless_completed: Option<&'a AtomicBool>,
}

impl<'a> WriteBatch<'a> {
    pub fn request_init(self, method: &str, deadline: Deadline) -> Self {
        self.push(|buf| frame::encode_request_init(buf, method, deadline))
    }

    pub fn headers(self, headers: &Metadata) -> Self {
        self.push(|buf| frame::encode_headers(buf, headers))
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        // Type byte plus the chunk's own length prefix.
        let content_len = payload.len().saturating_add(1 + 4);
        if content_len > self.transport.max_frame_size {
            self.oversized.get_or_insert(content_len);
            self.frames += 1;
            return self;
        }
        self.push(|buf| frame::encode_payload(buf, payload))
    }

    pub fn stream_end(self) -> Self {
        self.push(|buf| frame::encode_empty(buf, FrameKind::StreamEnd))
    }

    pub fn cancel(self) -> Self {
        self.push(|buf| frame::encode_empty(buf, FrameKind::Cancel))
    }

    pub fn trailers(self, status: &Status, trailers: &Metadata) -> Self {
        self.push(|buf| frame::encode_trailers(buf, status, trailers))
    }

    pub fn frame(self, frame: &Frame) -> Self {
        self.push(|buf| frame.encode(buf))
    }

    /// Fail the commit with `CallCompleted` if `completed` is set once the
    /// write lock is held.
    pub fn unless_completed(mut self, completed: &'a AtomicBool) -> Self {
        self.unless_completed = Some(completed);
        self
    }

    fn push(mut self, encode: impl FnOnce(&mut BytesMut)) -> Self {
        self.frames += 1;
        if self.oversized.is_some() {
            return self;
        }
        let start = self.buf.len();
        encode(&mut self.buf);
        let content_len = self.buf.len() - start - LENGTH_PREFIX_SIZE;
        if content_len > self.transport.max_frame_size {
            self.buf.truncate(start);
            self.oversized = Some(content_len);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Write every frame in the batch, in order, with no other commit in between.
    ///
    /// A batch holding a frame over the size limit writes nothing and fails
    /// with `FrameTooLarge`; the transport stays usable.
    pub async fn commit(self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if let Some(len) = self.oversized {
            let max = self.transport.max_frame_size;
            self.transport
                .logger
                .warn(format_args!("Refusing to write a {} byte frame (max {})", len, max));
            return Err(TransportError::FrameTooLarge { len, max });
        }
        self.transport
            .commit_bytes(&self.buf, self.frames, self.unless_completed)
            .await
    }
}
