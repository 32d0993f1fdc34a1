//! Binary framing for the realtime relay channel.
//!
//! Wire format (one WebSocket binary message = one frame):
//! ```text
//! ┌──────────┬──────────────────────┐
//! │ tag      │ payload              │
//! │ 1 byte   │ variable (opaque)    │
//! └──────────┴──────────────────────┘
//! ```
//!
//! The relay never interprets payloads. `Update` frames carry CRDT deltas,
//! `Ping` frames keep the transport alive and are never rebroadcast, and any
//! other tag is relayed unchanged so newer clients can extend the protocol
//! without a server upgrade.

use bytes::Bytes;

/// Tag byte of an update delta frame.
pub const TAG_UPDATE: u8 = 0x01;
/// Tag byte of a keepalive frame.
pub const TAG_PING: u8 = 0x02;

/// WebSocket close code used for both admission rejections (policy violation).
pub const CLOSE_CODE_POLICY: u16 = 1008;

/// Frame tag, decoded from the leading byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameTag {
    /// Collaborative-edit delta, rebroadcast to the room.
    Update,
    /// Keepalive, swallowed by the session.
    Ping,
    /// Reserved tag, passed through unchanged.
    Other(u8),
}

impl FrameTag {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            TAG_UPDATE => FrameTag::Update,
            TAG_PING => FrameTag::Ping,
            other => FrameTag::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            FrameTag::Update => TAG_UPDATE,
            FrameTag::Ping => TAG_PING,
            FrameTag::Other(b) => b,
        }
    }

    /// Whether frames with this tag are fanned out to other peers.
    pub fn is_relayed(self) -> bool {
        !matches!(self, FrameTag::Ping)
    }
}

/// A single tagged message unit.
///
/// Holds the original wire bytes so relaying a frame is a reference-count
/// bump rather than a re-encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    raw: Bytes,
}

impl Frame {
    /// Decode a frame from a binary message. Empty messages carry no tag and
    /// yield `None`.
    pub fn decode(raw: Bytes) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        Some(Self { raw })
    }

    /// Build a frame from a tag and payload.
    pub fn new(tag: FrameTag, payload: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(tag.as_byte());
        buf.extend_from_slice(payload);
        Self { raw: Bytes::from(buf) }
    }

    pub fn update(payload: &[u8]) -> Self {
        Self::new(FrameTag::Update, payload)
    }

    pub fn ping() -> Self {
        Self::new(FrameTag::Ping, &[])
    }

    pub fn tag(&self) -> FrameTag {
        FrameTag::from_byte(self.raw[0])
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[1..]
    }

    /// The full wire encoding (tag byte + payload).
    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }

    pub fn into_bytes(self) -> Bytes {
        self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Always false: a decoded frame carries at least its tag byte.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// Reasons a connection is closed at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    DocumentNotFound,
    RoomFull,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        CLOSE_CODE_POLICY
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::DocumentNotFound => "document not found",
            CloseReason::RoomFull => "room full",
        }
    }
}

/// Extract the document id from a WebSocket request path of the form
/// `/ws/{document_id}`.
pub fn document_id_from_path(path: &str) -> Option<&str> {
    let id = path.strip_prefix("/ws/")?;
    let id = id.split('?').next().unwrap_or(id);
    if id.is_empty() || id.contains('/') {
        return None;
    }
    Some(id)
}
