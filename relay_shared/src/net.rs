//! Wire protocol.
//!
//! Two framings share one socket:
//! - Text frames carry the full roster snapshot as JSON (rare, variable shape).
//! - Binary frames carry every high-frequency message. Element 0 is the kind
//!   tag, element 1 the entity id, the remainder is kind-specific.
//!
//! Binary elements are laid out per [`FrameLayout`]. `Compact` uses single
//! bytes for small fields and length-prefixed UTF-8 for text. `Legacy`
//! reproduces the historical framing where every element, including each
//! byte of UTF-8 text, occupies its own little-endian `u16` unit.

use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::chat::ChatBody;
use crate::entity::{EntityId, EntityPatch, RemoteEntity, Rgb};

/// Message kind tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Load = 0,
    Move = 1,
    Scene = 2,
    Message = 3,
    Identity = 4,
}

impl MessageKind {
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(MessageKind::Load),
            1 => Some(MessageKind::Move),
            2 => Some(MessageKind::Scene),
            3 => Some(MessageKind::Message),
            4 => Some(MessageKind::Identity),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Element layout of binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameLayout {
    /// `u8` small fields, `u16le` id, `u16le`-length-prefixed UTF-8 text.
    #[default]
    Compact,
    /// Every element is a `u16le` unit; text bytes are widened one per unit.
    Legacy,
}

/// Unknown [`FrameLayout`] name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown frame layout {0:?}, expected compact or legacy")]
pub struct LayoutParseError(pub String);

impl FromStr for FrameLayout {
    type Err = LayoutParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compact" => Ok(FrameLayout::Compact),
            "legacy" => Ok(FrameLayout::Legacy),
            other => Err(LayoutParseError(other.to_string())),
        }
    }
}

/// One binary protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Announces the sender's entity id.
    Load { id: EntityId },
    /// Tile position in signed tile coordinates.
    Move { id: EntityId, x: i32, y: i32 },
    /// Scene change.
    Scene { id: EntityId, scene: String },
    /// Chat line or generation request.
    Message { id: EntityId, body: ChatBody },
    /// Display name and colour claim.
    Identity {
        id: EntityId,
        color: Rgb,
        display_name: String,
    },
}

impl Frame {
    pub fn kind(&self) -> MessageKind {
        match self {
            Frame::Load { .. } => MessageKind::Load,
            Frame::Move { .. } => MessageKind::Move,
            Frame::Scene { .. } => MessageKind::Scene,
            Frame::Message { .. } => MessageKind::Message,
            Frame::Identity { .. } => MessageKind::Identity,
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            Frame::Load { id }
            | Frame::Move { id, .. }
            | Frame::Scene { id, .. }
            | Frame::Message { id, .. }
            | Frame::Identity { id, .. } => *id,
        }
    }

    /// Same frame attributed to another entity.
    pub fn with_id(mut self, new_id: EntityId) -> Self {
        match &mut self {
            Frame::Load { id }
            | Frame::Move { id, .. }
            | Frame::Scene { id, .. }
            | Frame::Message { id, .. }
            | Frame::Identity { id, .. } => *id = new_id,
        }
        self
    }

    /// Entity fields this frame changes. `Load` and generation requests
    /// change nothing.
    pub fn patch(&self) -> EntityPatch {
        let mut patch = EntityPatch::default();
        match self {
            Frame::Load { .. } => {}
            Frame::Move { x, y, .. } => patch.position = Some((*x, *y)),
            Frame::Scene { scene, .. } => patch.scene = Some(scene.clone()),
            Frame::Message { body, .. } => {
                if let ChatBody::Text(text) = body {
                    patch.message = Some(text.clone());
                }
            }
            Frame::Identity {
                color,
                display_name,
                ..
            } => {
                patch.color = Some(*color);
                patch.display_name = Some(display_name.clone());
            }
        }
        patch
    }
}

/// JSON envelope of text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum TextFrame {
    /// Full roster snapshot.
    ClientList { clients: Vec<RemoteEntity> },
}

impl TextFrame {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// A decoded frame as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Roster(Vec<RemoteEntity>),
    Delta(Frame),
}

/// Errors produced while encoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("coordinate {value} does not fit one byte once offset by {half}")]
    CoordinateOutOfRange { value: i32, half: i32 },
    #[error("text of {0} bytes does not fit in a frame")]
    TextTooLong(usize),
}

/// Errors produced while decoding a frame. Decoding failures are local to one
/// frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message kind {0}")]
    UnknownKind(u16),
    #[error("frame truncated: needed {needed} more bytes, had {available}")]
    Truncated { needed: usize, available: usize },
    #[error("legacy frame has odd length {0}")]
    Misaligned(usize),
    #[error("unit {0:#06x} does not fit in a byte")]
    WideUnit(u16),
    #[error("text is not valid utf-8")]
    InvalidUtf8,
    #[error("{0} trailing bytes after frame")]
    Trailing(usize),
    #[error("invalid roster json: {0}")]
    Json(String),
}

/// Encodes and decodes frames for one map size and layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireCodec {
    map_size: u16,
    layout: FrameLayout,
}

impl WireCodec {
    pub fn new(map_size: u16, layout: FrameLayout) -> Self {
        Self { map_size, layout }
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    pub fn map_size(&self) -> u16 {
        self.map_size
    }

    /// Offset applied to tile coordinates on the wire.
    pub fn map_half(&self) -> i32 {
        i32::from(self.map_size / 2)
    }

    /// Maps a signed tile coordinate onto its unsigned wire byte.
    pub fn encode_coord(&self, value: i32) -> Result<u8, EncodeError> {
        let half = self.map_half();
        u8::try_from(value + half).map_err(|_| EncodeError::CoordinateOutOfRange { value, half })
    }

    pub fn decode_coord(&self, raw: u8) -> i32 {
        i32::from(raw) - self.map_half()
    }

    pub fn encode(&self, frame: &Frame) -> Result<Bytes, EncodeError> {
        let mut w = FrameWriter::new(self.layout);
        w.byte(frame.kind().tag());
        w.id(frame.id());
        match frame {
            Frame::Load { .. } => {}
            Frame::Move { x, y, .. } => {
                w.byte(self.encode_coord(*x)?);
                w.byte(self.encode_coord(*y)?);
            }
            Frame::Scene { scene, .. } => w.text(scene)?,
            Frame::Message { body, .. } => {
                let text = body.wire_text();
                if !text.is_empty() {
                    w.text(text)?;
                }
            }
            Frame::Identity {
                color,
                display_name,
                ..
            } => {
                w.byte(color.r);
                w.byte(color.g);
                w.byte(color.b);
                w.text(display_name)?;
            }
        }
        Ok(w.finish())
    }

    pub fn decode(&self, data: &[u8]) -> Result<Frame, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }
        if self.layout == FrameLayout::Legacy && data.len() % 2 != 0 {
            return Err(DecodeError::Misaligned(data.len()));
        }

        let mut r = FrameReader::new(data, self.layout);
        let tag = r.unit()?;
        let kind = MessageKind::from_tag(tag).ok_or(DecodeError::UnknownKind(tag))?;
        let id = r.id()?;

        let frame = match kind {
            MessageKind::Load => Frame::Load { id },
            MessageKind::Move => {
                let x = self.decode_coord(r.byte()?);
                let y = self.decode_coord(r.byte()?);
                Frame::Move { id, x, y }
            }
            MessageKind::Scene => Frame::Scene {
                id,
                scene: r.text()?,
            },
            MessageKind::Message => {
                let body = if r.is_empty() {
                    ChatBody::Generate
                } else {
                    ChatBody::from_input(&r.text()?)
                };
                Frame::Message { id, body }
            }
            MessageKind::Identity => {
                let color = Rgb::new(r.byte()?, r.byte()?, r.byte()?);
                Frame::Identity {
                    id,
                    color,
                    display_name: r.text()?,
                }
            }
        };
        r.finish()?;
        Ok(frame)
    }

    /// Serializes a roster snapshot for a text frame.
    pub fn encode_roster(&self, clients: &[RemoteEntity]) -> serde_json::Result<String> {
        TextFrame::ClientList {
            clients: clients.to_vec(),
        }
        .to_json()
    }

    /// Decodes a text frame.
    pub fn decode_text(&self, text: &str) -> Result<Inbound, DecodeError> {
        match TextFrame::from_json(text).map_err(|e| DecodeError::Json(e.to_string()))? {
            TextFrame::ClientList { clients } => Ok(Inbound::Roster(clients)),
        }
    }

    /// Decodes a binary frame.
    pub fn decode_binary(&self, data: &[u8]) -> Result<Inbound, DecodeError> {
        self.decode(data).map(Inbound::Delta)
    }
}

struct FrameWriter {
    buf: BytesMut,
    layout: FrameLayout,
}

impl FrameWriter {
    fn new(layout: FrameLayout) -> Self {
        Self {
            buf: BytesMut::with_capacity(16),
            layout,
        }
    }

    fn byte(&mut self, v: u8) {
        match self.layout {
            FrameLayout::Compact => self.buf.put_u8(v),
            FrameLayout::Legacy => self.buf.put_u16_le(u16::from(v)),
        }
    }

    fn id(&mut self, id: EntityId) {
        self.buf.put_u16_le(id.0);
    }

    fn text(&mut self, s: &str) -> Result<(), EncodeError> {
        match self.layout {
            FrameLayout::Compact => {
                let len = u16::try_from(s.len()).map_err(|_| EncodeError::TextTooLong(s.len()))?;
                self.buf.put_u16_le(len);
                self.buf.put_slice(s.as_bytes());
            }
            FrameLayout::Legacy => {
                for b in s.bytes() {
                    self.buf.put_u16_le(u16::from(b));
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

struct FrameReader<'a> {
    buf: &'a [u8],
    layout: FrameLayout,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8], layout: FrameLayout) -> Self {
        Self { buf, layout }
    }

    fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: n,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }

    /// Reads one small element in its raw width.
    fn unit(&mut self) -> Result<u16, DecodeError> {
        match self.layout {
            FrameLayout::Compact => {
                self.need(1)?;
                Ok(u16::from(self.buf.get_u8()))
            }
            FrameLayout::Legacy => {
                self.need(2)?;
                Ok(self.buf.get_u16_le())
            }
        }
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        let unit = self.unit()?;
        u8::try_from(unit).map_err(|_| DecodeError::WideUnit(unit))
    }

    fn id(&mut self) -> Result<EntityId, DecodeError> {
        self.need(2)?;
        Ok(EntityId(self.buf.get_u16_le()))
    }

    fn text(&mut self) -> Result<String, DecodeError> {
        let bytes = match self.layout {
            FrameLayout::Compact => {
                if self.is_empty() {
                    return Ok(String::new());
                }
                self.need(2)?;
                let len = usize::from(self.buf.get_u16_le());
                self.need(len)?;
                let bytes = self.buf[..len].to_vec();
                self.buf.advance(len);
                bytes
            }
            FrameLayout::Legacy => {
                let mut bytes = Vec::with_capacity(self.buf.remaining() / 2);
                while !self.is_empty() {
                    bytes.push(self.byte()?);
                }
                bytes
            }
        };
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::Trailing(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn compact(map_size: u16) -> WireCodec {
        WireCodec::new(map_size, FrameLayout::Compact)
    }

    #[test]
    fn layout_names_match_the_config_spelling() {
        assert_eq!("compact".parse(), Ok(FrameLayout::Compact));
        assert_eq!("legacy".parse(), Ok(FrameLayout::Legacy));
        assert_eq!(
            "legacyy".parse::<FrameLayout>(),
            Err(LayoutParseError("legacyy".into()))
        );
        let from_json: FrameLayout = serde_json::from_str("\"legacy\"").unwrap();
        assert_eq!(from_json, FrameLayout::Legacy);
    }

    fn legacy(map_size: u16) -> WireCodec {
        WireCodec::new(map_size, FrameLayout::Legacy)
    }

    #[test]
    fn move_example_decodes_to_signed_tiles() {
        let frame = compact(128).decode(&[1, 7, 0, 40, 70]).unwrap();
        assert_eq!(
            frame,
            Frame::Move {
                id: EntityId(7),
                x: -24,
                y: 6
            }
        );

        let frame = legacy(128).decode(&[1, 0, 7, 0, 40, 0, 70, 0]).unwrap();
        assert_eq!(
            frame,
            Frame::Move {
                id: EntityId(7),
                x: -24,
                y: 6
            }
        );
    }

    #[test]
    fn compact_layout_bytes() {
        let codec = compact(64);
        let bytes = codec
            .encode(&Frame::Scene {
                id: EntityId(0x0102),
                scene: "hub".into(),
            })
            .unwrap();
        assert_eq!(&bytes[..], &[2, 0x02, 0x01, 3, 0, b'h', b'u', b'b']);
    }

    #[test]
    fn legacy_layout_widens_text_bytes() {
        let codec = legacy(64);
        let bytes = codec
            .encode(&Frame::Identity {
                id: EntityId(9),
                color: Rgb::new(255, 0, 16),
                display_name: "é".into(),
            })
            .unwrap();
        // kind, id, r, g, b, then one unit per UTF-8 byte of "é" (0xc3 0xa9).
        assert_eq!(
            &bytes[..],
            &[4, 0, 9, 0, 255, 0, 0, 0, 16, 0, 0xc3, 0, 0xa9, 0]
        );
        assert_eq!(
            codec.decode(&bytes).unwrap(),
            Frame::Identity {
                id: EntityId(9),
                color: Rgb::new(255, 0, 16),
                display_name: "é".into(),
            }
        );
    }

    #[test]
    fn empty_message_is_generate_sentinel() {
        for codec in [compact(64), legacy(64)] {
            let empty_text = Frame::Message {
                id: EntityId(1),
                body: ChatBody::Text(String::new()),
            };
            let bytes = codec.encode(&empty_text).unwrap();
            assert_eq!(
                codec.decode(&bytes).unwrap(),
                Frame::Message {
                    id: EntityId(1),
                    body: ChatBody::Generate
                }
            );
        }
        // A zero-length prefix from a peer is still an empty payload.
        assert_eq!(
            compact(64).decode(&[3, 1, 0, 0, 0]).unwrap(),
            Frame::Message {
                id: EntityId(1),
                body: ChatBody::Generate
            }
        );
    }

    #[test]
    fn out_of_range_coordinates_fail_to_encode() {
        let codec = compact(64);
        let err = codec
            .encode(&Frame::Move {
                id: EntityId(1),
                x: -33,
                y: 0,
            })
            .unwrap_err();
        assert_eq!(err, EncodeError::CoordinateOutOfRange { value: -33, half: 32 });
        assert!(codec
            .encode(&Frame::Move {
                id: EntityId(1),
                x: 224,
                y: 0
            })
            .is_err());
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let codec = compact(64);
        assert_eq!(codec.decode(&[]), Err(DecodeError::Empty));
        assert_eq!(codec.decode(&[9, 0, 0]), Err(DecodeError::UnknownKind(9)));
        assert!(matches!(
            codec.decode(&[1, 1, 0, 5]),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(codec.decode(&[0, 1]), Err(DecodeError::Truncated { .. })));
        assert_eq!(codec.decode(&[0, 1, 0, 7]), Err(DecodeError::Trailing(1)));
        assert_eq!(
            codec.decode(&[2, 1, 0, 2, 0, 0xff, 0xfe]),
            Err(DecodeError::InvalidUtf8)
        );
        assert!(matches!(
            codec.decode(&[2, 1, 0, 9, 0, b'a']),
            Err(DecodeError::Truncated { .. })
        ));

        let codec = legacy(64);
        assert_eq!(codec.decode(&[1, 0, 1]), Err(DecodeError::Misaligned(3)));
        assert_eq!(
            codec.decode(&[2, 0, 1, 0, 0x00, 0x01]),
            Err(DecodeError::WideUnit(0x0100))
        );
        assert_eq!(
            codec.decode(&[0x00, 0x01, 1, 0]),
            Err(DecodeError::UnknownKind(0x0100))
        );
    }

    #[test]
    fn roster_text_frame_shape() {
        let codec = compact(64);
        let roster = vec![RemoteEntity::spawned(EntityId(5))];
        let json = codec.encode_roster(&roster).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["cmd"], "client_list");
        assert_eq!(value["clients"][0]["id"], 5);
        assert_eq!(codec.decode_text(&json).unwrap(), Inbound::Roster(roster));
        assert!(matches!(
            codec.decode_text("{\"cmd\":\"nope\"}"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn patch_reflects_frame_fields() {
        let patch = Frame::Move {
            id: EntityId(1),
            x: 3,
            y: -2,
        }
        .patch();
        assert_eq!(patch.position, Some((3, -2)));
        assert!(Frame::Load { id: EntityId(1) }.patch().is_empty());
        assert!(Frame::Message {
            id: EntityId(1),
            body: ChatBody::Generate
        }
        .patch()
        .is_empty());
    }

    fn arb_layout() -> impl Strategy<Value = FrameLayout> {
        prop_oneof![Just(FrameLayout::Compact), Just(FrameLayout::Legacy)]
    }

    fn arb_map_size() -> impl Strategy<Value = u16> {
        (1u16..=128).prop_map(|half| half * 2)
    }

    fn arb_frame(half: i32) -> impl Strategy<Value = Frame> {
        let id = any::<u16>().prop_map(EntityId);
        let coord = -half..half;
        prop_oneof![
            id.clone().prop_map(|id| Frame::Load { id }),
            (id.clone(), coord.clone(), coord).prop_map(|(id, x, y)| Frame::Move { id, x, y }),
            (id.clone(), ".{0,24}").prop_map(|(id, scene)| Frame::Scene { id, scene }),
            (id.clone(), ".{1,40}").prop_map(|(id, text)| Frame::Message {
                id,
                body: ChatBody::Text(text)
            }),
            id.clone().prop_map(|id| Frame::Message {
                id,
                body: ChatBody::Generate
            }),
            (id, any::<[u8; 3]>(), ".{0,24}").prop_map(|(id, [r, g, b], display_name)| {
                Frame::Identity {
                    id,
                    color: Rgb::new(r, g, b),
                    display_name,
                }
            }),
        ]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            (size, frame) in arb_map_size().prop_flat_map(|s| (Just(s), arb_frame(i32::from(s / 2)))),
            layout in arb_layout(),
        ) {
            let codec = WireCodec::new(size, layout);
            let bytes = codec.encode(&frame).unwrap();
            prop_assert_eq!(codec.decode(&bytes).unwrap(), frame);
        }

        #[test]
        fn coordinates_in_range_never_go_negative(
            (size, value) in arb_map_size().prop_flat_map(|s| {
                let half = i32::from(s / 2);
                (Just(s), -half..half)
            })
        ) {
            let codec = compact(size);
            let raw = codec.encode_coord(value).unwrap();
            prop_assert_eq!(i32::from(raw), value + codec.map_half());
            prop_assert_eq!(codec.decode_coord(raw), value);
        }
    }
}
