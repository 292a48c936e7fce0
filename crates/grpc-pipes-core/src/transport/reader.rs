//! Inbound side of the transport: reads one frame at a time and dispatches it.

use super::frame::{Frame, FrameKind, LENGTH_PREFIX_SIZE};
use crate::config::TransportConfig;
use crate::deadline::Deadline;
use crate::error::{Result, TransportError};
use crate::logging::Role;
use crate::metadata::Metadata;
use crate::status::Status;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Receiver of decoded frames.
///
/// Each end of a connection implements the callbacks for the frames it
/// expects; the defaults reject everything else as a protocol violation,
/// which ends the read loop.
pub trait FrameHandler: Send + Sync {
    fn role(&self) -> Role;

    fn handle_request_init(&self, _method: String, _deadline: Deadline) -> Result<()> {
        Err(self.unexpected(FrameKind::RequestInit))
    }

    fn handle_headers(&self, _headers: Metadata) -> Result<()> {
        Err(self.unexpected(FrameKind::Headers))
    }

    fn handle_payload(&self, _payload: Bytes) -> Result<()> {
        Err(self.unexpected(FrameKind::Payload))
    }

    fn handle_stream_end(&self) -> Result<()> {
        Err(self.unexpected(FrameKind::StreamEnd))
    }

    fn handle_cancel(&self) -> Result<()> {
        Err(self.unexpected(FrameKind::Cancel))
    }

    fn handle_trailers(&self, _status: Status, _trailers: Metadata) -> Result<()> {
        Err(self.unexpected(FrameKind::Trailers))
    }

    fn unexpected(&self, frame: FrameKind) -> TransportError {
        TransportError::UnexpectedFrame {
            frame,
            role: self.role(),
        }
    }
}

impl Frame {
    /// Invoke the one handler callback matching this frame.
    pub fn dispatch<H: FrameHandler + ?Sized>(self, handler: &H) -> Result<()> {
        match self {
            Frame::RequestInit { method, deadline } => handler.handle_request_init(method, deadline),
            Frame::Headers(headers) => handler.handle_headers(headers),
            Frame::Payload(payload) => handler.handle_payload(payload),
            Frame::StreamEnd => handler.handle_stream_end(),
            Frame::Cancel => handler.handle_cancel(),
            Frame::Trailers { status, trailers } => handler.handle_trailers(status, trailers),
        }
    }
}

/// Reads length-prefixed frames from the inbound half of a stream.
pub struct FrameReader<R> {
    reader: R,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_size(reader, TransportConfig::MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            max_frame_size,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `None` when the peer closed the stream on a frame boundary.
    /// A stream that ends inside a frame yields [`TransportError::EndOfPipe`].
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_SIZE {
            let n = self.reader.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(TransportError::EndOfPipe);
            }
            filled += n;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(TransportError::malformed("zero-length frame"));
        }
        if len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        let mut content = vec![0u8; len];
        self.reader.read_exact(&mut content).await?;

        Frame::decode(Bytes::from(content)).map(Some)
    }

    /// Read one frame and hand it to `handler`.
    ///
    /// Returns `false` once the peer has closed the stream gracefully.
    pub async fn read<H: FrameHandler + ?Sized>(&mut self, handler: &H) -> Result<bool> {
        match self.read_frame().await? {
            Some(frame) => {
                frame.dispatch(handler)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
