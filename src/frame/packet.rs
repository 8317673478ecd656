//! Typed views of each frame kind.
//!
//! Integers are big-endian. Strings are a `u16` byte length followed by UTF-8.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Frame, FrameError, FrameType};
use crate::connection::Role;

/// Data tag routed on by the dispatcher.
pub type Tag = u32;

/// A frame kind with a fixed discriminant and payload layout.
pub trait TypedFrame: Sized {
    const FRAME_TYPE: FrameType;

    fn encode_payload(&self, dst: &mut BytesMut) -> Result<(), FrameError>;

    fn decode_payload(payload: Bytes) -> Result<Self, FrameError>;

    fn to_frame(&self) -> Result<Frame, FrameError> {
        let mut dst = BytesMut::new();
        self.encode_payload(&mut dst)?;
        Ok(Frame::new(Self::FRAME_TYPE, dst.freeze()))
    }

    fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        if frame.frame_type() != Self::FRAME_TYPE {
            return Err(FrameError::malformed(
                Self::FRAME_TYPE,
                format!("got a {} frame", frame.frame_type()),
            ));
        }
        Self::decode_payload(frame.payload().clone())
    }
}

fn put_str(dst: &mut BytesMut, frame_type: FrameType, field: &str, value: &str) -> Result<(), FrameError> {
    let len = u16::try_from(value.len())
        .map_err(|_| FrameError::malformed(frame_type, format!("{field} longer than 65535 bytes")))?;
    dst.put_u16(len);
    dst.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Cursor over a frame payload that reports short reads as malformed frames.
struct Fields {
    frame_type: FrameType,
    buf: Bytes,
}

impl Fields {
    fn new(frame_type: FrameType, buf: Bytes) -> Self {
        Self { frame_type, buf }
    }

    fn need(&self, n: usize, field: &str) -> Result<(), FrameError> {
        if self.buf.remaining() < n {
            return Err(FrameError::malformed(self.frame_type, format!("truncated {field}")));
        }
        Ok(())
    }

    fn u16(&mut self, field: &str) -> Result<u16, FrameError> {
        self.need(2, field)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self, field: &str) -> Result<u32, FrameError> {
        self.need(4, field)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, field: &str) -> Result<u64, FrameError> {
        self.need(8, field)?;
        Ok(self.buf.get_u64())
    }

    fn string(&mut self, field: &str) -> Result<String, FrameError> {
        let len = self.u16(field)? as usize;
        self.need(len, field)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map_err(|_| FrameError::malformed(self.frame_type, format!("{field} is not UTF-8")))
    }

    fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn rest(self) -> Bytes {
        self.buf
    }
}

/// First frame on the control stream: who the client is and what it observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFrame {
    pub name: String,
    pub role: Role,
    /// Tags a stream function observes. Empty means every tag.
    pub observed_tags: Vec<Tag>,
    pub credential: Option<String>,
}

impl HandshakeFrame {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self { name: name.into(), role, observed_tags: Vec::new(), credential: None }
    }

    pub fn with_observed_tags(mut self, tags: impl IntoIterator<Item = Tag>) -> Self {
        self.observed_tags = tags.into_iter().collect();
        self
    }

    pub fn with_credential(mut self, credential: Option<String>) -> Self {
        self.credential = credential;
        self
    }
}

impl TypedFrame for HandshakeFrame {
    const FRAME_TYPE: FrameType = FrameType::Handshake;

    fn encode_payload(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        put_str(dst, Self::FRAME_TYPE, "name", &self.name)?;
        put_str(dst, Self::FRAME_TYPE, "client type", self.role.as_str())?;
        let count = u16::try_from(self.observed_tags.len())
            .map_err(|_| FrameError::malformed(Self::FRAME_TYPE, "too many observed tags"))?;
        dst.put_u16(count);
        for tag in &self.observed_tags {
            dst.put_u32(*tag);
        }
        put_str(dst, Self::FRAME_TYPE, "credential", self.credential.as_deref().unwrap_or(""))
    }

    fn decode_payload(payload: Bytes) -> Result<Self, FrameError> {
        let mut fields = Fields::new(Self::FRAME_TYPE, payload);
        let name = fields.string("name")?;
        let role = Role::from_wire(&fields.string("client type")?);
        let count = fields.u16("observed tag count")?;
        let observed_tags =
            (0..count).map(|_| fields.u32("observed tag")).collect::<Result<Vec<_>, _>>()?;
        let credential = fields.string("credential")?;
        let credential = (!credential.is_empty()).then_some(credential);
        Ok(Self { name, role, observed_tags, credential })
    }
}

/// Liveness check, echoed back by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatFrame;

impl TypedFrame for HeartbeatFrame {
    const FRAME_TYPE: FrameType = FrameType::Heartbeat;

    fn encode_payload(&self, _dst: &mut BytesMut) -> Result<(), FrameError> {
        Ok(())
    }

    fn decode_payload(_payload: Bytes) -> Result<Self, FrameError> {
        Ok(Self)
    }
}

macro_rules! connection_id_frame {
    ($(#[$meta:meta])* $name:ident, $frame_type:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub connection_id: u64,
        }

        impl $name {
            pub fn new(connection_id: u64) -> Self {
                Self { connection_id }
            }
        }

        impl TypedFrame for $name {
            const FRAME_TYPE: FrameType = $frame_type;

            fn encode_payload(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
                dst.put_u64(self.connection_id);
                Ok(())
            }

            fn decode_payload(payload: Bytes) -> Result<Self, FrameError> {
                let mut fields = Fields::new(Self::FRAME_TYPE, payload);
                let connection_id = fields.u64("connection id")?;
                Ok(Self { connection_id })
            }
        }
    };
}

connection_id_frame!(
    /// Confirms a data stream was bound to the connection.
    AckFrame,
    FrameType::Ack
);
connection_id_frame!(
    /// Handshake accepted; carries the id the zipper assigned.
    AcceptedFrame,
    FrameType::Accepted
);
connection_id_frame!(
    /// First frame on a data stream the zipper opens toward a client.
    CreateStreamFrame,
    FrameType::CreateStream
);
connection_id_frame!(
    /// First frame on a data stream a client opens toward the zipper.
    InitFrame,
    FrameType::Init
);

/// Handshake refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedFrame {
    pub reason: String,
}

impl RejectedFrame {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl TypedFrame for RejectedFrame {
    const FRAME_TYPE: FrameType = FrameType::Rejected;

    fn encode_payload(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        put_str(dst, Self::FRAME_TYPE, "reason", &self.reason)
    }

    fn decode_payload(payload: Bytes) -> Result<Self, FrameError> {
        let mut fields = Fields::new(Self::FRAME_TYPE, payload);
        Ok(Self { reason: fields.string("reason")? })
    }
}

/// One unit of application data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub transaction_id: String,
    pub source_id: String,
    pub tag: Tag,
    pub carriage: Bytes,
}

impl DataFrame {
    pub fn new(
        transaction_id: impl Into<String>,
        source_id: impl Into<String>,
        tag: Tag,
        carriage: impl Into<Bytes>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            source_id: source_id.into(),
            tag,
            carriage: carriage.into(),
        }
    }

    /// A result in the same transaction, from the same source.
    pub fn respond(&self, tag: Tag, carriage: impl Into<Bytes>) -> Self {
        Self {
            transaction_id: self.transaction_id.clone(),
            source_id: self.source_id.clone(),
            tag,
            carriage: carriage.into(),
        }
    }

    /// Read only the tag of an encoded data frame.
    pub fn peek_tag(frame: &Frame) -> Result<Tag, FrameError> {
        if frame.frame_type() != Self::FRAME_TYPE {
            return Err(FrameError::malformed(
                Self::FRAME_TYPE,
                format!("got a {} frame", frame.frame_type()),
            ));
        }
        let mut fields = Fields::new(Self::FRAME_TYPE, frame.payload().clone());
        for field in ["transaction id", "source id"] {
            let len = fields.u16(field)? as usize;
            fields.need(len, field)?;
            fields.buf.advance(len);
        }
        fields.u32("tag")
    }
}

impl TypedFrame for DataFrame {
    const FRAME_TYPE: FrameType = FrameType::Payload;

    fn encode_payload(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        put_str(dst, Self::FRAME_TYPE, "transaction id", &self.transaction_id)?;
        put_str(dst, Self::FRAME_TYPE, "source id", &self.source_id)?;
        dst.put_u32(self.tag);
        dst.extend_from_slice(&self.carriage);
        Ok(())
    }

    fn decode_payload(payload: Bytes) -> Result<Self, FrameError> {
        let mut fields = Fields::new(Self::FRAME_TYPE, payload);
        let transaction_id = fields.string("transaction id")?;
        let source_id = fields.string("source id")?;
        let tag = fields.u32("tag")?;
        Ok(Self { transaction_id, source_id, tag, carriage: fields.rest() })
    }
}

/// Any decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Handshake(HandshakeFrame),
    Heartbeat,
    Ack(AckFrame),
    Accepted(AcceptedFrame),
    Rejected(RejectedFrame),
    CreateStream(CreateStreamFrame),
    Data(DataFrame),
    Init(InitFrame),
}

impl Packet {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Packet::Handshake(_) => FrameType::Handshake,
            Packet::Heartbeat => FrameType::Heartbeat,
            Packet::Ack(_) => FrameType::Ack,
            Packet::Accepted(_) => FrameType::Accepted,
            Packet::Rejected(_) => FrameType::Rejected,
            Packet::CreateStream(_) => FrameType::CreateStream,
            Packet::Data(_) => FrameType::Payload,
            Packet::Init(_) => FrameType::Init,
        }
    }
}

impl TryFrom<&Frame> for Packet {
    type Error = FrameError;

    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        Ok(match frame.frame_type() {
            FrameType::Handshake => Packet::Handshake(HandshakeFrame::from_frame(frame)?),
            FrameType::Heartbeat => Packet::Heartbeat,
            FrameType::Ack => Packet::Ack(AckFrame::from_frame(frame)?),
            FrameType::Accepted => Packet::Accepted(AcceptedFrame::from_frame(frame)?),
            FrameType::Rejected => Packet::Rejected(RejectedFrame::from_frame(frame)?),
            FrameType::CreateStream => Packet::CreateStream(CreateStreamFrame::from_frame(frame)?),
            FrameType::Payload => Packet::Data(DataFrame::from_frame(frame)?),
            FrameType::Init => Packet::Init(InitFrame::from_frame(frame)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_field_layout() {
        let frame = HandshakeFrame::new("echo", Role::StreamFunction)
            .with_observed_tags([0x10])
            .to_frame()
            .unwrap();
        let mut expected = vec![0x00, 0x04];
        expected.extend_from_slice(b"echo");
        expected.extend_from_slice(&[0x00, 0x0f]);
        expected.extend_from_slice(b"stream-function");
        expected.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x10]);
        expected.extend_from_slice(&[0x00, 0x00]);
        assert_eq!(frame.frame_type(), FrameType::Handshake);
        assert_eq!(&frame.payload()[..], &expected[..]);
    }

    #[test]
    fn handshake_survives_the_wire() {
        let handshake = HandshakeFrame::new("resize", Role::StreamFunction)
            .with_observed_tags([1, 2, 0xffff_ffff])
            .with_credential(Some("token".to_string()));
        let wire = handshake.to_frame().unwrap().encode().unwrap();
        let decoded = Frame::decode(&wire).unwrap();
        assert_eq!(Packet::try_from(&decoded).unwrap(), Packet::Handshake(handshake));
    }

    #[test]
    fn unknown_client_type_decodes_as_none() {
        let mut dst = BytesMut::new();
        put_str(&mut dst, FrameType::Handshake, "name", "x").unwrap();
        put_str(&mut dst, FrameType::Handshake, "client type", "mystery").unwrap();
        dst.put_u16(0);
        put_str(&mut dst, FrameType::Handshake, "credential", "").unwrap();
        let handshake = HandshakeFrame::decode_payload(dst.freeze()).unwrap();
        assert_eq!(handshake.role, Role::None);
        assert_eq!(handshake.credential, None);
    }

    #[test]
    fn data_frame_keeps_transaction_on_respond() {
        let request = DataFrame::new("tx-9", "42", 0x10, &b"ping"[..]);
        let response = request.respond(0x20, &b"pong"[..]);
        assert_eq!(response.transaction_id, "tx-9");
        assert_eq!(response.source_id, "42");
        assert_eq!(response.tag, 0x20);

        let frame = response.to_frame().unwrap();
        assert_eq!(DataFrame::peek_tag(&frame).unwrap(), 0x20);
        assert_eq!(DataFrame::from_frame(&frame).unwrap(), response);
    }

    #[test]
    fn empty_carriage_is_allowed() {
        let data = DataFrame::new("", "", 7, Bytes::new());
        let frame = data.to_frame().unwrap();
        assert_eq!(DataFrame::from_frame(&frame).unwrap(), data);
    }

    #[test]
    fn truncated_fields_are_malformed() {
        let frame = Frame::new(FrameType::Payload, &[0x00, 0x09, b'a'][..]);
        assert!(matches!(
            DataFrame::from_frame(&frame),
            Err(FrameError::Malformed { frame_type: FrameType::Payload, .. })
        ));
        assert!(DataFrame::peek_tag(&frame).is_err());

        let frame = Frame::new(FrameType::Accepted, &[0x00, 0x01][..]);
        assert!(AcceptedFrame::from_frame(&frame).is_err());
    }

    #[test]
    fn type_mismatch_is_reported() {
        let frame = AckFrame::new(3).to_frame().unwrap();
        let err = AcceptedFrame::from_frame(&frame).unwrap_err();
        assert!(err.to_string().contains("got a ack frame"));
    }

    #[test]
    fn connection_id_frames_carry_their_id() {
        for (frame, expected) in [
            (AckFrame::new(1).to_frame().unwrap(), Packet::Ack(AckFrame::new(1))),
            (AcceptedFrame::new(2).to_frame().unwrap(), Packet::Accepted(AcceptedFrame::new(2))),
            (CreateStreamFrame::new(3).to_frame().unwrap(), Packet::CreateStream(CreateStreamFrame::new(3))),
            (InitFrame::new(u64::MAX).to_frame().unwrap(), Packet::Init(InitFrame::new(u64::MAX))),
        ] {
            assert_eq!(frame.payload().len(), 8);
            assert_eq!(Packet::try_from(&frame).unwrap(), expected);
        }
    }
}
