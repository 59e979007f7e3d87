//! DMR network frames ("DMRD").
//!
//! Layout (55 bytes):
//!   0..4 tag | 4 seq | 5..8 src | 8..11 dst | 11..15 peer | 15 flags |
//!   16..20 stream | 20..53 burst | 53 ber | 54 rssi
//!
//! Flags: bit7 slot 2, bit6 private call, bit5 data sync, bit4 voice sync,
//! bits0-3 data type (data sync) or voice sequence (voice).

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::frame::{get_u24, put_u24};
use crate::{
    FrameError, FrameInfo, FrameKind, PeerId, ProtocolAdapter, SessionKey, SlotNo, StreamId,
    TrafficClass,
};

pub const DMR_TAG: [u8; 4] = *b"DMRD";

/// Full network frame length.
pub const DMR_FRAME_LEN: usize = 55;

/// Length of the addressing header preceding the burst.
pub const DMR_HEADER_LEN: usize = 20;

pub const OFFSET_SEQ: usize = 4;
pub const OFFSET_SRC: usize = 5;
pub const OFFSET_DST: usize = 8;
pub const OFFSET_PEER: usize = 11;
pub const OFFSET_FLAGS: usize = 15;
pub const OFFSET_STREAM: usize = 16;
pub const OFFSET_BURST: usize = 20;

pub const FLAG_SLOT2: u8 = 0x80;
pub const FLAG_PRIVATE: u8 = 0x40;
pub const FLAG_DATA_SYNC: u8 = 0x20;
pub const FLAG_VOICE_SYNC: u8 = 0x10;
pub const DATA_TYPE_MASK: u8 = 0x0F;

/// DMR data types carried in the low nibble of a data-sync frame.
pub mod data_type {
    pub const VOICE_PI_HEADER: u8 = 0x00;
    pub const VOICE_LC_HEADER: u8 = 0x01;
    pub const TERMINATOR_WITH_LC: u8 = 0x02;
    pub const CSBK: u8 = 0x03;
    pub const DATA_HEADER: u8 = 0x06;
    pub const RATE_12_DATA: u8 = 0x07;
    pub const RATE_34_DATA: u8 = 0x08;
    pub const IDLE: u8 = 0x09;
    pub const RATE_1_DATA: u8 = 0x0A;
}

/// Re-encoder for the full link control carried by voice LC headers and
/// terminators. The LC names the destination and sits under the burst FEC,
/// so an address rewrite has to go through it.
pub trait LcCodec: Send + Sync {
    /// Re-encode the full LC in the 33-byte `burst` for `dst_id`.
    fn rewrite_full_lc(
        &self,
        burst: &mut [u8],
        data_type: u8,
        dst_id: u32,
        group: bool,
    ) -> Result<(), FrameError>;
}

/// DMR adapter. Sessions are keyed per (peer, slot).
///
/// Without an [`LcCodec`] the burst of an LC-bearing frame passes through
/// unchanged on rewrite.
#[derive(Clone, Default)]
pub struct DmrAdapter {
    lc_codec: Option<Arc<dyn LcCodec>>,
}

impl std::fmt::Debug for DmrAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmrAdapter")
            .field("lc_codec", &self.lc_codec.is_some())
            .finish()
    }
}

impl DmrAdapter {
    pub fn with_lc_codec(codec: Arc<dyn LcCodec>) -> Self {
        Self {
            lc_codec: Some(codec),
        }
    }

    /// Data types whose burst carries a full LC.
    fn carries_full_lc(flags: u8) -> Option<u8> {
        if flags & FLAG_DATA_SYNC == 0 {
            return None;
        }
        match flags & DATA_TYPE_MASK {
            dt @ (data_type::VOICE_LC_HEADER | data_type::TERMINATOR_WITH_LC) => Some(dt),
            _ => None,
        }
    }

    fn classify(flags: u8) -> Result<(TrafficClass, bool), FrameError> {
        if flags & FLAG_DATA_SYNC == 0 {
            // Voice burst (sync or embedded)
            return Ok((TrafficClass::Voice, false));
        }
        match flags & DATA_TYPE_MASK {
            data_type::VOICE_PI_HEADER | data_type::VOICE_LC_HEADER => {
                Ok((TrafficClass::Voice, false))
            }
            data_type::TERMINATOR_WITH_LC => Ok((TrafficClass::Voice, true)),
            data_type::CSBK => Ok((TrafficClass::Control, false)),
            data_type::DATA_HEADER
            | data_type::RATE_12_DATA
            | data_type::RATE_34_DATA
            | data_type::RATE_1_DATA => Ok((TrafficClass::Data, false)),
            other => Err(FrameError::Unroutable(other)),
        }
    }
}

impl ProtocolAdapter for DmrAdapter {
    fn name(&self) -> &'static str {
        "dmr"
    }

    fn tag(&self) -> [u8; 4] {
        DMR_TAG
    }

    fn parse(&self, frame: &Bytes) -> Result<FrameInfo, FrameError> {
        if frame.len() < DMR_FRAME_LEN {
            return Err(FrameError::TooShort {
                len: frame.len(),
                min: DMR_FRAME_LEN,
            });
        }
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&frame[..4]);
        if tag != DMR_TAG {
            return Err(FrameError::BadTag(tag));
        }

        let flags = frame[OFFSET_FLAGS];
        let (class, end_of_transmission) = Self::classify(flags)?;

        Ok(FrameInfo {
            src_id: get_u24(frame, OFFSET_SRC),
            dst_id: get_u24(frame, OFFSET_DST),
            slot: if flags & FLAG_SLOT2 != 0 { 2 } else { 1 },
            group: flags & FLAG_PRIVATE == 0,
            class,
            end_of_transmission,
            grant_demand: false,
            kind: FrameKind::Call,
        })
    }

    fn session_key(&self, peer_id: PeerId, _stream_id: StreamId, info: &FrameInfo) -> SessionKey {
        SessionKey::Slot {
            peer_id,
            slot: info.slot,
        }
    }

    fn rewrite(&self, frame: &mut BytesMut, dst_id: u32, slot: SlotNo) -> Result<(), FrameError> {
        if frame.len() < DMR_HEADER_LEN {
            return Err(FrameError::TooShort {
                len: frame.len(),
                min: DMR_HEADER_LEN,
            });
        }
        let prior_dst = get_u24(frame, OFFSET_DST);
        put_u24(frame, OFFSET_DST, dst_id);
        match slot {
            2 => frame[OFFSET_FLAGS] |= FLAG_SLOT2,
            _ => frame[OFFSET_FLAGS] &= !FLAG_SLOT2,
        }

        let flags = frame[OFFSET_FLAGS];
        if let (Some(codec), Some(dt)) = (&self.lc_codec, Self::carries_full_lc(flags)) {
            if prior_dst != dst_id {
                if frame.len() < DMR_FRAME_LEN {
                    return Err(FrameError::TooShort {
                        len: frame.len(),
                        min: DMR_FRAME_LEN,
                    });
                }
                let group = flags & FLAG_PRIVATE == 0;
                codec.rewrite_full_lc(&mut frame[OFFSET_BURST..OFFSET_BURST + 33], dt, dst_id, group)?;
            }
        }
        Ok(())
    }
}

/// Build a DMR network frame. Used by tests and tooling.
#[allow(clippy::too_many_arguments)]
pub fn build_frame(
    seq: u8,
    src_id: u32,
    dst_id: u32,
    peer_id: PeerId,
    slot: SlotNo,
    flags: u8,
    stream_id: StreamId,
    burst: &[u8],
) -> BytesMut {
    let mut frame = BytesMut::zeroed(DMR_FRAME_LEN);
    frame[..4].copy_from_slice(&DMR_TAG);
    frame[OFFSET_SEQ] = seq;
    put_u24(&mut frame, OFFSET_SRC, src_id);
    put_u24(&mut frame, OFFSET_DST, dst_id);
    frame[OFFSET_PEER..OFFSET_PEER + 4].copy_from_slice(&peer_id.to_be_bytes());
    frame[OFFSET_FLAGS] = flags | if slot == 2 { FLAG_SLOT2 } else { 0 };
    frame[OFFSET_STREAM..OFFSET_STREAM + 4].copy_from_slice(&stream_id.to_be_bytes());
    let n = burst.len().min(33);
    frame[OFFSET_BURST..OFFSET_BURST + n].copy_from_slice(&burst[..n]);
    frame
}
