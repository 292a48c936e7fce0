//! Error types for the pipe transport.
//!
//! Errors fall into two families that never mix:
//! - [`TransportError`]: the byte stream or frame format failed. The connection
//!   is unusable afterwards and no trailers are written for it.
//! - [`HandlerError`]: application code failed. It is always converted into a
//!   single trailers frame by the call context.

use crate::logging::Role;
use crate::status::{Code, Status};
use crate::transport::FrameKind;
use thiserror::Error;

/// Transport-level failure on one connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The stream ended in the middle of a frame.
    #[error("End of pipe")]
    EndOfPipe,

    #[error("Malformed frame: {reason}")]
    Malformed { reason: String },

    #[error("Frame size {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// A previous commit failed part-way; the wire can no longer be trusted.
    #[error("Transport is broken after a failed write")]
    Broken,

    #[error("Transport is closed")]
    Closed,

    /// The call finished before this write could be committed.
    #[error("Call is already complete")]
    CallCompleted,

    #[error("Unexpected {frame} frame on the {role} side")]
    UnexpectedFrame { frame: FrameKind, role: Role },

    #[error("Payload received after the stream was completed")]
    PayloadAfterStreamEnd,
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return TransportError::EndOfPipe;
        }
        TransportError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl TransportError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        TransportError::Malformed {
            reason: reason.into(),
        }
    }
}

impl From<TransportError> for Status {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::FrameTooLarge { .. } => Status::new(Code::ResourceExhausted, err.to_string()),
            TransportError::CallCompleted => Status::internal(err.to_string()),
            _ => Status::unavailable(err.to_string()),
        }
    }
}

/// Failure returned by a method handler.
///
/// `Rpc` carries an explicit status chosen by the handler. Anything else is
/// reported to the caller as `Unknown` without leaking the error text.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Rpc(#[from] Status),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// The explicit RPC status, if the handler supplied one.
    pub fn status(&self) -> Option<&Status> {
        match self {
            HandlerError::Rpc(status) => Some(status),
            HandlerError::Other(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn test_unexpected_eof_maps_to_end_of_pipe() {
        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, TransportError::EndOfPipe));
    }

    #[test]
    fn test_other_io_errors_keep_source() {
        let err: TransportError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        match err {
            TransportError::Io { source, .. } => assert!(source.is_some()),
            other => panic!("Expected Io, got: {:?}", other),
        }
    }

    #[test]
    fn test_transport_error_becomes_unavailable() {
        let status: Status = TransportError::Closed.into();
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.detail(), "Transport is closed");
    }

    #[test]
    fn test_oversized_frame_becomes_resource_exhausted() {
        let status: Status = TransportError::FrameTooLarge { len: 100, max: 64 }.into();
        assert_eq!(status.code(), Code::ResourceExhausted);

        let status: Status = TransportError::CallCompleted.into();
        assert_eq!(status, Status::internal("Call is already complete"));
    }

    #[test]
    fn test_handler_error_status() {
        let err: HandlerError = Status::not_found("missing").into();
        assert_eq!(err.status().map(|s| s.code()), Some(Code::NotFound));

        let err: HandlerError = anyhow::anyhow!("boom").into();
        assert!(err.status().is_none());
    }
}
