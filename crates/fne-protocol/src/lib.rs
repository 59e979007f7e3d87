//! FNE Protocol -- envelope codec, frame adapters, timing profile.
//!
//! UDP between the FNE and its peers. One datagram per frame.
//! 10-byte envelope (peer id, stream id, sequence) + protocol frame.
//! Protocol frames are tagged by their first four bytes ("DMRD", "P25D").

pub mod codec;
pub mod crc;
pub mod dmr;
pub mod frame;
pub mod p25;
pub mod timing;

pub use codec::{Envelope, EnvelopeCodec};
pub use dmr::{DmrAdapter, LcCodec};
pub use frame::{
    Channel, FrameError, FrameInfo, FrameKind, PduBlock, PduHeaderInfo, ProtocolAdapter,
    SessionKey, SlotNo, TrafficClass,
};
pub use p25::P25Adapter;
pub use timing::{TimingProfile, CURRENT_TIMING, DEFAULT_TIMING};

/// Connected repeater/gateway identifier.
pub type PeerId = u32;

/// Per-peer transmission identifier. Not unique across peers.
pub type StreamId = u32;

/// Default parrot (loopback) talkgroup.
pub const PARROT_TALKGROUP: u32 = 9990;

/// Maximum UDP datagram accepted from a peer (sourced from current timing profile).
pub const MAX_DATAGRAM_BYTES: usize = DEFAULT_TIMING.max_datagram_bytes;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("short envelope: {len} bytes (need {min})")]
    ShortEnvelope { len: usize, min: usize },
    #[error("datagram too large: {size} bytes (max {max})")]
    DatagramTooLarge { size: usize, max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
