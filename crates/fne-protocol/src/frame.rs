//! Protocol-neutral frame view and the adapter contract.
//!
//! The call-tracking engine is written once against [`ProtocolAdapter`].
//! An adapter knows one air interface's network frame: how to parse the
//! addressing header, which session key shape it uses, its PDU block limit,
//! where the destination and slot fields live, and which checksums cover them.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{PeerId, StreamId};

/// Timeslot (DMR: 1 or 2). Protocols without slots use 0.
pub type SlotNo = u8;

/// Class of traffic, used for permission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficClass {
    Voice,
    Data,
    Control,
}

impl TrafficClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficClass::Voice => "voice",
            TrafficClass::Data => "data",
            TrafficClass::Control => "control",
        }
    }
}

/// Key a call session is stored under.
///
/// Slot-keyed protocols allow one call per (peer, slot) and a new stream on
/// a busy slot supersedes the old one. Stream-keyed protocols track each
/// (peer, stream) independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Slot { peer_id: PeerId, slot: SlotNo },
    Stream { peer_id: PeerId, stream_id: StreamId },
}

impl SessionKey {
    pub fn peer_id(&self) -> PeerId {
        match self {
            SessionKey::Slot { peer_id, .. } | SessionKey::Stream { peer_id, .. } => *peer_id,
        }
    }
}

/// Fields of a PDU data header the reassembler needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeaderInfo {
    /// Data blocks that follow the header.
    pub declared_blocks: usize,
    /// Extended addressing: user data starts with a secondary header.
    pub extended_address: bool,
    /// Length of the secondary header when `extended_address` is set.
    pub secondary_header_len: usize,
    /// Logical link id the PDU is addressed to.
    pub llid: u32,
}

/// One block of a multi-block PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduBlock {
    /// Header-carrying first block. `frame` is the complete network frame.
    Header { info: PduHeaderInfo, frame: Bytes },
    /// Data block `seq` (0-based) and its payload.
    Data { seq: usize, payload: Bytes },
}

/// What a frame carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// Voice, link control or control signalling belonging to a call.
    Call,
    /// One block of a multi-block data PDU.
    PduBlock(PduBlock),
}

/// Logical channel a frame is routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    Call,
    Pdu(PduBlock),
    Loopback,
}

/// Addressing fields parsed from a network frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub src_id: u32,
    pub dst_id: u32,
    pub slot: SlotNo,
    /// Group call (talkgroup) as opposed to unit-to-unit.
    pub group: bool,
    pub class: TrafficClass,
    pub end_of_transmission: bool,
    /// End-of-transmission that also asks the FNE for a channel grant.
    pub grant_demand: bool,
    pub kind: FrameKind,
}

impl FrameInfo {
    /// Classify the frame onto a logical channel.
    ///
    /// Group voice addressed to the parrot talkgroup is loopback traffic.
    /// PDU blocks always go to the reassembler.
    pub fn channel(&self, parrot_talkgroup: Option<u32>) -> Channel {
        match &self.kind {
            FrameKind::PduBlock(block) => Channel::Pdu(block.clone()),
            FrameKind::Call => {
                if self.group
                    && self.class == TrafficClass::Voice
                    && parrot_talkgroup == Some(self.dst_id)
                {
                    Channel::Loopback
                } else {
                    Channel::Call
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: {len} bytes (need {min})")]
    TooShort { len: usize, min: usize },
    #[error("unexpected tag {0:02x?}")]
    BadTag([u8; 4]),
    #[error("unroutable frame type {0:#04x}")]
    Unroutable(u8),
    #[error("pdu header crc mismatch")]
    HeaderCrc,
    #[error("pdu block index {index} without payload")]
    EmptyBlock { index: u8 },
    #[error("link control rewrite failed: {0}")]
    LinkControl(String),
    #[error("operation not supported by {0}")]
    Unsupported(&'static str),
}

/// Per-protocol knowledge the engine is parameterised over.
pub trait ProtocolAdapter: Send + Sync + 'static {
    /// Short protocol name used in logs ("dmr", "p25").
    fn name(&self) -> &'static str;

    /// Four-byte frame tag.
    fn tag(&self) -> [u8; 4];

    /// Parse and validate the addressing header.
    fn parse(&self, frame: &Bytes) -> Result<FrameInfo, FrameError>;

    /// Session key for a frame of this protocol.
    fn session_key(&self, peer_id: PeerId, stream_id: StreamId, info: &FrameInfo) -> SessionKey;

    /// Largest PDU (in data blocks) this protocol allows. Zero: no PDUs.
    fn max_pdu_blocks(&self) -> usize {
        0
    }

    /// Rewrite destination and slot in place, recomputing any checksum that
    /// covers them. All other fields are left untouched.
    fn rewrite(&self, frame: &mut BytesMut, dst_id: u32, slot: SlotNo) -> Result<(), FrameError>;

    /// Re-fragment a reassembled PDU into network frames: the header frame
    /// followed by one frame per data block, in sequence order.
    fn pdu_frames(&self, header: &Bytes, blocks: &[Bytes]) -> Result<Vec<BytesMut>, FrameError> {
        let _ = (header, blocks);
        Err(FrameError::Unsupported(self.name()))
    }
}

/// Read a 24-bit big-endian value at `at`.
pub(crate) fn get_u24(buf: &[u8], at: usize) -> u32 {
    (buf[at] as u32) << 16 | (buf[at + 1] as u32) << 8 | buf[at + 2] as u32
}

/// Write the low 24 bits of `value` big-endian at `at`.
pub(crate) fn put_u24(buf: &mut [u8], at: usize, value: u32) {
    buf[at] = (value >> 16) as u8;
    buf[at + 1] = (value >> 8) as u8;
    buf[at + 2] = value as u8;
}
