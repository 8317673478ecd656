//! Wire frames.
//!
//! Every frame travels as
//!
//! ```text
//! +----------------+--------+-------------------+----------+---------+
//! | length (3, BE) | type 1 | metadata len 2 BE | metadata | payload |
//! +----------------+--------+-------------------+----------+---------+
//! ```
//!
//! where `length` counts every byte after the length field. [`Frame`] is the
//! untyped envelope; [`packet`] holds the typed views of each frame kind and
//! [`codec`] the streaming decoder/encoder used on QUIC streams.

pub mod codec;
pub mod packet;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

pub use codec::{FrameCodec, FrameReader, FrameWriter};
pub use packet::{
    AcceptedFrame, AckFrame, CreateStreamFrame, DataFrame, HandshakeFrame, HeartbeatFrame,
    InitFrame, Packet, RejectedFrame, Tag, TypedFrame,
};

/// Size of the big-endian length prefix.
pub const LENGTH_FIELD_SIZE: usize = 3;

/// Size of the header following the length prefix: type byte plus metadata length.
pub const HEADER_SIZE: usize = 3;

/// Largest body a 3-byte length prefix can describe.
pub const MAX_FRAME_LENGTH: usize = 0x00FF_FFFF;

/// Largest metadata block the 2-byte metadata length can describe.
pub const MAX_METADATA_LENGTH: usize = u16::MAX as usize;

/// Codec failures.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FrameError {
    #[error("header: incomplete frame (needed {needed} bytes, have {available})")]
    IncompleteFrame { needed: usize, available: usize },

    #[error("invalid frame type {0:#04x}")]
    InvalidFrameType(u8),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("metadata of {size} bytes exceeds the {max} byte limit", max = MAX_METADATA_LENGTH)]
    MetadataTooLarge { size: usize },

    #[error("malformed {frame_type} frame: {reason}")]
    Malformed { frame_type: FrameType, reason: String },

    #[error("frame stream i/o failed")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    pub(crate) fn malformed(frame_type: FrameType, reason: impl Into<String>) -> Self {
        FrameError::Malformed { frame_type, reason: reason.into() }
    }
}

/// Frame discriminants. The values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Handshake = 0x00,
    Heartbeat = 0x01,
    Ack = 0x02,
    Accepted = 0x03,
    Rejected = 0x04,
    CreateStream = 0x05,
    Payload = 0x06,
    Init = 0x07,
}

impl FrameType {
    pub const ALL: [FrameType; 8] = [
        FrameType::Handshake,
        FrameType::Heartbeat,
        FrameType::Ack,
        FrameType::Accepted,
        FrameType::Rejected,
        FrameType::CreateStream,
        FrameType::Payload,
        FrameType::Init,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Handshake => "handshake",
            FrameType::Heartbeat => "heartbeat",
            FrameType::Ack => "ack",
            FrameType::Accepted => "accepted",
            FrameType::Rejected => "rejected",
            FrameType::CreateStream => "create-stream",
            FrameType::Payload => "payload",
            FrameType::Init => "init",
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        FrameType::ALL
            .into_iter()
            .find(|t| *t as u8 == value)
            .ok_or(FrameError::InvalidFrameType(value))
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An untyped frame: discriminant, optional metadata and opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    frame_type: FrameType,
    metadata: Bytes,
    payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self { frame_type, metadata: Bytes::new(), payload: payload.into() }
    }

    /// Attach metadata such as a tracing context.
    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Number of bytes after the length prefix.
    pub fn body_len(&self) -> usize {
        HEADER_SIZE + self.metadata.len() + self.payload.len()
    }

    /// Number of bytes on the wire, length prefix included.
    pub fn encoded_len(&self) -> usize {
        LENGTH_FIELD_SIZE + self.body_len()
    }

    /// Append the wire form of this frame to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        if self.metadata.len() > MAX_METADATA_LENGTH {
            return Err(FrameError::MetadataTooLarge { size: self.metadata.len() });
        }
        let body_len = self.body_len();
        if body_len > MAX_FRAME_LENGTH {
            return Err(FrameError::TooLarge { size: body_len, max: MAX_FRAME_LENGTH });
        }

        dst.reserve(LENGTH_FIELD_SIZE + body_len);
        dst.put_uint(body_len as u64, LENGTH_FIELD_SIZE);
        dst.put_u8(self.frame_type as u8);
        dst.put_u16(self.metadata.len() as u16);
        dst.extend_from_slice(&self.metadata);
        dst.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Encode this frame into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut dst)?;
        Ok(dst.freeze())
    }

    /// Decode one complete frame, length prefix included.
    ///
    /// Trailing bytes beyond the declared length are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let length = read_frame_length(buf).ok_or(FrameError::IncompleteFrame {
            needed: LENGTH_FIELD_SIZE,
            available: buf.len(),
        })?;
        let end = LENGTH_FIELD_SIZE + length;
        if buf.len() < end {
            return Err(FrameError::IncompleteFrame { needed: end, available: buf.len() });
        }
        Self::from_body(Bytes::copy_from_slice(&buf[LENGTH_FIELD_SIZE..end]))
    }

    /// Decode a frame body (everything after the length prefix) without copying.
    pub fn from_body(mut body: Bytes) -> Result<Self, FrameError> {
        if body.len() < HEADER_SIZE {
            return Err(FrameError::IncompleteFrame { needed: HEADER_SIZE, available: body.len() });
        }
        let frame_type = FrameType::try_from(body.get_u8())?;
        let metadata_len = body.get_u16() as usize;
        if body.len() < metadata_len {
            return Err(FrameError::IncompleteFrame {
                needed: HEADER_SIZE + metadata_len,
                available: HEADER_SIZE + body.len(),
            });
        }
        let metadata = body.split_to(metadata_len);
        Ok(Self { frame_type, metadata, payload: body })
    }
}

/// Read the body length from the first three bytes of `buf`.
///
/// Returns `None` while fewer than three bytes are available.
pub fn read_frame_length(buf: &[u8]) -> Option<usize> {
    match buf {
        [a, b, c, ..] => Some(((*a as usize) << 16) | ((*b as usize) << 8) | *c as usize),
        _ => None,
    }
}
