//! Frame vocabulary and binary encoding.
//!
//! Every frame is length-prefixed and type-tagged:
//!
//! ```text
//! [u32 BE: len][u8: type][body: len - 1 bytes]
//! ```
//!
//! Body layouts (all integers big-endian, `str`/`bytes` are `u32` length + data):
//!
//! ```text
//! RequestInit  str method, u8 has_deadline, [i64 deadline micros since epoch]
//! Headers      metadata
//! Payload      bytes chunk
//! StreamEnd    -
//! Cancel       -
//! Trailers     u32 code, str detail, metadata
//!
//! metadata     u32 count, count * (str key, u8 kind (0 text, 1 binary), bytes value)
//! ```

use crate::deadline::Deadline;
use crate::error::{Result, TransportError};
use crate::metadata::{Metadata, MetadataValue};
use crate::status::{Code, Status};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the length prefix in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

const VALUE_ASCII: u8 = 0;
const VALUE_BINARY: u8 = 1;

/// Smallest encoded metadata entry: empty key, kind byte, empty value.
const MIN_METADATA_ENTRY_SIZE: usize = 4 + 1 + 4;

/// Frame type tag as written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    RequestInit = 1,
    Headers = 2,
    Payload = 3,
    StreamEnd = 4,
    Cancel = 5,
    Trailers = 6,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameKind::RequestInit),
            2 => Some(FrameKind::Headers),
            3 => Some(FrameKind::Payload),
            4 => Some(FrameKind::StreamEnd),
            5 => Some(FrameKind::Cancel),
            6 => Some(FrameKind::Trailers),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::RequestInit => "RequestInit",
            FrameKind::Headers => "Headers",
            FrameKind::Payload => "Payload",
            FrameKind::StreamEnd => "StreamEnd",
            FrameKind::Cancel => "Cancel",
            FrameKind::Trailers => "Trailers",
        };
        write!(f, "{}", name)
    }
}

/// One unit of wire exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    RequestInit { method: String, deadline: Deadline },
    Headers(Metadata),
    Payload(Bytes),
    StreamEnd,
    Cancel,
    Trailers { status: Status, trailers: Metadata },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::RequestInit { .. } => FrameKind::RequestInit,
            Frame::Headers(_) => FrameKind::Headers,
            Frame::Payload(_) => FrameKind::Payload,
            Frame::StreamEnd => FrameKind::StreamEnd,
            Frame::Cancel => FrameKind::Cancel,
            Frame::Trailers { .. } => FrameKind::Trailers,
        }
    }

    /// Append the length-prefixed encoding of this frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::RequestInit { method, deadline } => encode_request_init(dst, method, *deadline),
            Frame::Headers(headers) => encode_headers(dst, headers),
            Frame::Payload(payload) => encode_payload(dst, payload),
            Frame::StreamEnd => encode_empty(dst, FrameKind::StreamEnd),
            Frame::Cancel => encode_empty(dst, FrameKind::Cancel),
            Frame::Trailers { status, trailers } => encode_trailers(dst, status, trailers),
        }
    }

    /// Decode one frame from its content (type byte + body, without the length prefix).
    pub fn decode(mut src: Bytes) -> Result<Frame> {
        let tag = take_u8(&mut src)?;
        let kind = FrameKind::from_u8(tag)
            .ok_or_else(|| TransportError::malformed(format!("unknown frame type {}", tag)))?;

        let frame = match kind {
            FrameKind::RequestInit => {
                let method = take_string(&mut src)?;
                let deadline = match take_u8(&mut src)? {
                    0 => Deadline::none(),
                    1 => {
                        let micros = take_i64(&mut src)?;
                        Deadline::from_wire(micros).ok_or_else(|| {
                            TransportError::malformed(format!("deadline {} out of range", micros))
                        })?
                    }
                    flag => {
                        return Err(TransportError::malformed(format!(
                            "invalid deadline flag {}",
                            flag
                        )))
                    }
                };
                Frame::RequestInit { method, deadline }
            }
            FrameKind::Headers => Frame::Headers(take_metadata(&mut src)?),
            FrameKind::Payload => Frame::Payload(take_bytes(&mut src)?),
            FrameKind::StreamEnd => Frame::StreamEnd,
            FrameKind::Cancel => Frame::Cancel,
            FrameKind::Trailers => {
                let code = Code::from_u32(take_u32(&mut src)?);
                let detail = take_string(&mut src)?;
                let trailers = take_metadata(&mut src)?;
                Frame::Trailers {
                    status: Status::new(code, detail),
                    trailers,
                }
            }
        };

        if src.has_remaining() {
            return Err(TransportError::malformed(format!(
                "{} trailing bytes after {} frame",
                src.remaining(),
                kind
            )));
        }

        Ok(frame)
    }
}

// Encoders take borrowed parts so a write batch never has to clone payloads
// into an owned `Frame` first.

pub(crate) fn encode_request_init(dst: &mut BytesMut, method: &str, deadline: Deadline) {
    encode_with(dst, FrameKind::RequestInit, |dst| {
        put_str(dst, method);
        match deadline.to_wire() {
            Some(micros) => {
                dst.put_u8(1);
                dst.put_i64(micros);
            }
            None => dst.put_u8(0),
        }
    });
}

pub(crate) fn encode_headers(dst: &mut BytesMut, headers: &Metadata) {
    encode_with(dst, FrameKind::Headers, |dst| put_metadata(dst, headers));
}

pub(crate) fn encode_payload(dst: &mut BytesMut, payload: &[u8]) {
    encode_with(dst, FrameKind::Payload, |dst| put_bytes(dst, payload));
}

pub(crate) fn encode_empty(dst: &mut BytesMut, kind: FrameKind) {
    encode_with(dst, kind, |_| {});
}

pub(crate) fn encode_trailers(dst: &mut BytesMut, status: &Status, trailers: &Metadata) {
    encode_with(dst, FrameKind::Trailers, |dst| {
        dst.put_u32(status.code().as_u32());
        put_str(dst, status.detail());
        put_metadata(dst, trailers);
    });
}

fn encode_with(dst: &mut BytesMut, kind: FrameKind, body: impl FnOnce(&mut BytesMut)) {
    let start = dst.len();
    dst.put_u32(0); // patched below
    dst.put_u8(kind as u8);
    body(dst);
    let len = (dst.len() - start - LENGTH_PREFIX_SIZE) as u32;
    dst[start..start + LENGTH_PREFIX_SIZE].copy_from_slice(&len.to_be_bytes());
}

fn put_bytes(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

fn put_str(dst: &mut BytesMut, value: &str) {
    put_bytes(dst, value.as_bytes());
}

fn put_metadata(dst: &mut BytesMut, metadata: &Metadata) {
    dst.put_u32(metadata.len() as u32);
    for (key, value) in metadata.iter() {
        put_str(dst, key);
        match value {
            MetadataValue::Ascii(text) => {
                dst.put_u8(VALUE_ASCII);
                put_str(dst, text);
            }
            MetadataValue::Binary(bytes) => {
                dst.put_u8(VALUE_BINARY);
                put_bytes(dst, bytes);
            }
        }
    }
}

fn ensure(src: &Bytes, needed: usize) -> Result<()> {
    if src.remaining() < needed {
        return Err(TransportError::malformed(format!(
            "truncated frame: need {} bytes, have {}",
            needed,
            src.remaining()
        )));
    }
    Ok(())
}

fn take_u8(src: &mut Bytes) -> Result<u8> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

fn take_u32(src: &mut Bytes) -> Result<u32> {
    ensure(src, 4)?;
    Ok(src.get_u32())
}

fn take_i64(src: &mut Bytes) -> Result<i64> {
    ensure(src, 8)?;
    Ok(src.get_i64())
}

fn take_bytes(src: &mut Bytes) -> Result<Bytes> {
    let len = take_u32(src)? as usize;
    ensure(src, len)?;
    Ok(src.split_to(len))
}

fn take_string(src: &mut Bytes) -> Result<String> {
    let raw = take_bytes(src)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| TransportError::malformed("invalid UTF-8 in string field"))
}

fn take_metadata(src: &mut Bytes) -> Result<Metadata> {
    let count = take_u32(src)? as usize;
    if count > src.remaining() / MIN_METADATA_ENTRY_SIZE {
        return Err(TransportError::malformed(format!(
            "metadata claims {} entries in {} bytes",
            count,
            src.remaining()
        )));
    }

    let mut metadata = Metadata::new();
    for _ in 0..count {
        let key = take_string(src)?;
        let value = match take_u8(src)? {
            VALUE_ASCII => MetadataValue::Ascii(take_string(src)?),
            VALUE_BINARY => MetadataValue::Binary(take_bytes(src)?),
            other => {
                return Err(TransportError::malformed(format!(
                    "invalid metadata value kind {}",
                    other
                )))
            }
        };
        metadata.push(key, value);
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn roundtrip(frame: Frame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);

        let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(len, buf.len() - LENGTH_PREFIX_SIZE);

        let decoded = Frame::decode(buf.freeze().slice(LENGTH_PREFIX_SIZE..)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_every_frame_kind_roundtrips() {
        roundtrip(Frame::RequestInit {
            method: "/echo.Echo/Unary".to_string(),
            deadline: Deadline::after(Duration::from_secs(30)),
        });
        roundtrip(Frame::RequestInit {
            method: String::new(),
            deadline: Deadline::none(),
        });
        roundtrip(Frame::Headers(
            Metadata::new()
                .with("a", "1")
                .with("data-bin", vec![0u8, 255])
                .with("a", "2"),
        ));
        roundtrip(Frame::Headers(Metadata::new()));
        roundtrip(Frame::Payload(Bytes::from_static(b"\x00\x01binary\xff")));
        roundtrip(Frame::Payload(Bytes::new()));
        roundtrip(Frame::StreamEnd);
        roundtrip(Frame::Cancel);
        roundtrip(Frame::Trailers {
            status: Status::new(Code::NotFound, "no such model"),
            trailers: Metadata::new().with("retry-after", "5"),
        });
        roundtrip(Frame::Trailers {
            status: Status::ok(),
            trailers: Metadata::new(),
        });
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let err = Frame::decode(Bytes::from_static(&[42])).unwrap_err();
        assert!(matches!(err, TransportError::Malformed { .. }));
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        // Payload claiming 10 bytes but carrying 2.
        let content = Bytes::from_static(&[3, 0, 0, 0, 10, 1, 2]);
        let err = Frame::decode(content).unwrap_err();
        assert!(matches!(err, TransportError::Malformed { .. }));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let content = Bytes::from_static(&[4, 0]);
        let err = Frame::decode(content).unwrap_err();
        assert!(matches!(err, TransportError::Malformed { .. }));
    }

    #[test]
    fn test_metadata_count_larger_than_body_is_rejected() {
        let mut content = BytesMut::new();
        content.put_u8(FrameKind::Headers as u8);
        content.put_u32(u32::MAX);
        let err = Frame::decode(content.freeze()).unwrap_err();
        assert!(matches!(err, TransportError::Malformed { .. }));
    }

    #[test]
    fn test_invalid_utf8_method_is_malformed() {
        let mut content = BytesMut::new();
        content.put_u8(FrameKind::RequestInit as u8);
        content.put_u32(2);
        content.put_slice(&[0xc3, 0x28]);
        content.put_u8(0);
        let err = Frame::decode(content.freeze()).unwrap_err();
        assert!(matches!(err, TransportError::Malformed { .. }));
    }
}
