//! Streaming frame codec for `FramedRead` / `FramedWrite`.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use super::{Frame, FrameError, HEADER_SIZE, LENGTH_FIELD_SIZE, MAX_FRAME_LENGTH, read_frame_length};
use crate::transport::{BoxReader, BoxWriter};

/// Frame reader over one half of a transport stream.
pub type FrameReader = FramedRead<BoxReader, FrameCodec>;

/// Frame writer over one half of a transport stream.
pub type FrameWriter = FramedWrite<BoxWriter, FrameCodec>;

/// Length-prefixed frame codec.
///
/// The decoder buffers until the whole frame announced by the length prefix has
/// arrived, so frames split across reads are reassembled transparently.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self { max_frame_length: MAX_FRAME_LENGTH }
    }

    /// Limit accepted frames to `max` body bytes (capped at the wire maximum).
    pub fn with_max_frame_length(max: usize) -> Self {
        Self { max_frame_length: max.min(MAX_FRAME_LENGTH) }
    }

}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let Some(length) = read_frame_length(src) else {
            return Ok(None);
        };
        if length < HEADER_SIZE {
            return Err(FrameError::IncompleteFrame { needed: HEADER_SIZE, available: length });
        }
        if length > self.max_frame_length {
            return Err(FrameError::TooLarge { size: length, max: self.max_frame_length });
        }

        let total = LENGTH_FIELD_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let body = src.split_to(length).freeze();
        Frame::from_body(body).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::IncompleteFrame {
                needed: read_frame_length(src).map_or(LENGTH_FIELD_SIZE, |l| l + LENGTH_FIELD_SIZE),
                available: src.len(),
            }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.body_len() > self.max_frame_length {
            return Err(FrameError::TooLarge { size: frame.body_len(), max: self.max_frame_length });
        }
        frame.encode_into(dst)
    }
}

/// Wrap the halves of a stream in frame reader/writer.
pub fn framed(reader: BoxReader, writer: BoxWriter) -> (FrameReader, FrameWriter) {
    (FramedRead::new(reader, FrameCodec::new()), FramedWrite::new(writer, FrameCodec::new()))
}
