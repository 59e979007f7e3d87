//! P25 network frames ("P25D").
//!
//! Layout (24-byte header + data):
//!   0..4 tag | 4 lco | 5..8 src | 8..11 dst | 11..13 sys id | 13 reserved |
//!   14 control | 15 mfid | 16..19 net id | 19 reserved |
//!   20 lsd1 (PDU: block index) | 21 lsd2 | 22 duid | 23 data length | 24.. data
//!
//! PDUs travel one block per frame. Block index 0 carries the 12-byte PDU
//! data header; index n > 0 carries data block n - 1.

use bytes::{Bytes, BytesMut};

use crate::crc;
use crate::frame::{get_u24, put_u24};
use crate::{
    FrameError, FrameInfo, FrameKind, PduBlock, PduHeaderInfo, PeerId, ProtocolAdapter,
    SessionKey, SlotNo, StreamId, TrafficClass,
};

pub const P25_TAG: [u8; 4] = *b"P25D";

pub const P25_HEADER_LEN: usize = 24;

pub const OFFSET_LCO: usize = 4;
pub const OFFSET_SRC: usize = 5;
pub const OFFSET_DST: usize = 8;
pub const OFFSET_CONTROL: usize = 14;

/// Control byte flag: this TDU is a grant demand.
pub const CONTROL_GRANT_DEMAND: u8 = 0x80;
pub const OFFSET_BLOCK: usize = 20;
pub const OFFSET_DUID: usize = 22;
pub const OFFSET_LEN: usize = 23;
pub const OFFSET_DATA: usize = 24;

/// Data unit identifiers.
pub mod duid {
    pub const HDU: u8 = 0x00;
    pub const TDU: u8 = 0x03;
    pub const LDU1: u8 = 0x05;
    pub const TSDU: u8 = 0x07;
    pub const LDU2: u8 = 0x0A;
    pub const PDU: u8 = 0x0C;
    pub const TDULC: u8 = 0x0F;
}

/// Link control opcode for unit-to-unit voice.
pub const LCO_PRIVATE: u8 = 0x03;

/// Largest PDU in data blocks.
pub const P25_MAX_PDU_BLOCKS: usize = 32;

/// PDU data header length including its CRC.
pub const PDU_HEADER_LEN: usize = 12;

/// Confirmed data block length.
pub const PDU_CONFIRMED_BLOCK_LEN: usize = 16;

/// Unconfirmed data block length.
pub const PDU_UNCONFIRMED_BLOCK_LEN: usize = 12;

/// PDU formats (header octet 0, bits 0-4).
pub mod pdu_format {
    pub const RESPONSE: u8 = 0x03;
    pub const UNCONFIRMED: u8 = 0x15;
    pub const CONFIRMED: u8 = 0x16;
}

/// Service access point signalling extended addressing.
pub const SAP_EXTENDED_ADDRESS: u8 = 0x1F;

/// Secondary header length at the start of extended-address user data.
pub const EXTENDED_ADDRESS_LEN: usize = 4;

/// Offset of the LLID inside the PDU data header.
const PDU_OFFSET_LLID: usize = 3;

/// Decoded PDU data header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PduHeader {
    pub ack_needed: bool,
    pub outbound: bool,
    pub format: u8,
    pub sap: u8,
    pub mfid: u8,
    pub llid: u32,
    pub full_message: bool,
    pub blocks_to_follow: u8,
    pub pad_count: u8,
    pub ns: u8,
    pub header_offset: u8,
}

impl PduHeader {
    /// Decode a 12-byte header, verifying its CRC.
    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < PDU_HEADER_LEN {
            return Err(FrameError::TooShort {
                len: raw.len(),
                min: PDU_HEADER_LEN,
            });
        }
        let raw = &raw[..PDU_HEADER_LEN];
        if !crc::check_ccitt16(raw) {
            return Err(FrameError::HeaderCrc);
        }
        Ok(Self {
            ack_needed: raw[0] & 0x40 != 0,
            outbound: raw[0] & 0x20 != 0,
            format: raw[0] & 0x1F,
            sap: raw[1] & 0x3F,
            mfid: raw[2],
            llid: get_u24(raw, PDU_OFFSET_LLID),
            full_message: raw[6] & 0x80 != 0,
            blocks_to_follow: raw[6] & 0x7F,
            pad_count: raw[7] & 0x1F,
            ns: (raw[8] >> 4) & 0x07,
            header_offset: raw[9] & 0x3F,
        })
    }

    /// Encode into 12 bytes with a fresh CRC.
    pub fn encode(&self) -> [u8; PDU_HEADER_LEN] {
        let mut raw = [0u8; PDU_HEADER_LEN];
        raw[0] = (self.ack_needed as u8) << 6 | (self.outbound as u8) << 5 | (self.format & 0x1F);
        raw[1] = self.sap & 0x3F;
        raw[2] = self.mfid;
        put_u24(&mut raw, PDU_OFFSET_LLID, self.llid);
        raw[6] = (self.full_message as u8) << 7 | (self.blocks_to_follow & 0x7F);
        raw[7] = self.pad_count & 0x1F;
        raw[8] = (self.ns & 0x07) << 4;
        raw[9] = self.header_offset & 0x3F;
        crc::write_ccitt16(&mut raw);
        raw
    }

    pub fn extended_address(&self) -> bool {
        self.sap == SAP_EXTENDED_ADDRESS
    }

    /// Data block length implied by the format.
    pub fn block_len(&self) -> usize {
        if self.format == pdu_format::CONFIRMED {
            PDU_CONFIRMED_BLOCK_LEN
        } else {
            PDU_UNCONFIRMED_BLOCK_LEN
        }
    }
}

/// P25 adapter. Sessions are keyed per (peer, stream).
#[derive(Debug, Clone, Copy, Default)]
pub struct P25Adapter;

impl P25Adapter {
    fn parse_pdu(frame: &Bytes) -> Result<PduBlock, FrameError> {
        let index = frame[OFFSET_BLOCK];
        let payload = frame.slice(OFFSET_DATA..);
        if index == 0 {
            let header = PduHeader::decode(&payload)?;
            let info = PduHeaderInfo {
                declared_blocks: header.blocks_to_follow as usize,
                extended_address: header.extended_address(),
                secondary_header_len: if header.extended_address() {
                    EXTENDED_ADDRESS_LEN
                } else {
                    0
                },
                llid: header.llid,
            };
            return Ok(PduBlock::Header {
                info,
                frame: frame.clone(),
            });
        }
        if payload.is_empty() {
            return Err(FrameError::EmptyBlock { index });
        }
        Ok(PduBlock::Data {
            seq: index as usize - 1,
            payload,
        })
    }
}

impl ProtocolAdapter for P25Adapter {
    fn name(&self) -> &'static str {
        "p25"
    }

    fn tag(&self) -> [u8; 4] {
        P25_TAG
    }

    fn parse(&self, frame: &Bytes) -> Result<FrameInfo, FrameError> {
        if frame.len() < P25_HEADER_LEN {
            return Err(FrameError::TooShort {
                len: frame.len(),
                min: P25_HEADER_LEN,
            });
        }
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&frame[..4]);
        if tag != P25_TAG {
            return Err(FrameError::BadTag(tag));
        }

        let unit = frame[OFFSET_DUID] & 0x0F;
        let (class, end_of_transmission, kind) = match unit {
            duid::HDU | duid::LDU1 | duid::LDU2 => (TrafficClass::Voice, false, FrameKind::Call),
            duid::TDU | duid::TDULC => (TrafficClass::Voice, true, FrameKind::Call),
            duid::TSDU => (TrafficClass::Control, false, FrameKind::Call),
            duid::PDU => (
                TrafficClass::Data,
                false,
                FrameKind::PduBlock(Self::parse_pdu(frame)?),
            ),
            other => return Err(FrameError::Unroutable(other)),
        };

        let group = match kind {
            FrameKind::PduBlock(_) => false,
            FrameKind::Call => frame[OFFSET_LCO] != LCO_PRIVATE,
        };

        let grant_demand =
            unit == duid::TDU && frame[OFFSET_CONTROL] & CONTROL_GRANT_DEMAND != 0;

        Ok(FrameInfo {
            src_id: get_u24(frame, OFFSET_SRC),
            dst_id: get_u24(frame, OFFSET_DST),
            slot: 0,
            group,
            class,
            end_of_transmission,
            grant_demand,
            kind,
        })
    }

    fn session_key(&self, peer_id: PeerId, stream_id: StreamId, _info: &FrameInfo) -> SessionKey {
        SessionKey::Stream { peer_id, stream_id }
    }

    fn max_pdu_blocks(&self) -> usize {
        P25_MAX_PDU_BLOCKS
    }

    fn rewrite(&self, frame: &mut BytesMut, dst_id: u32, _slot: SlotNo) -> Result<(), FrameError> {
        if frame.len() < P25_HEADER_LEN {
            return Err(FrameError::TooShort {
                len: frame.len(),
                min: P25_HEADER_LEN,
            });
        }
        put_u24(frame, OFFSET_DST, dst_id);

        // The PDU header carries the LLID again, under its own CRC
        let is_pdu_header =
            frame[OFFSET_DUID] & 0x0F == duid::PDU && frame[OFFSET_BLOCK] == 0;
        if is_pdu_header && frame.len() >= OFFSET_DATA + PDU_HEADER_LEN {
            let header = &mut frame[OFFSET_DATA..OFFSET_DATA + PDU_HEADER_LEN];
            put_u24(header, PDU_OFFSET_LLID, dst_id);
            crc::write_ccitt16(header);
        }
        Ok(())
    }

    fn pdu_frames(&self, header: &Bytes, blocks: &[Bytes]) -> Result<Vec<BytesMut>, FrameError> {
        if header.len() < P25_HEADER_LEN + PDU_HEADER_LEN {
            return Err(FrameError::TooShort {
                len: header.len(),
                min: P25_HEADER_LEN + PDU_HEADER_LEN,
            });
        }
        let mut frames = Vec::with_capacity(blocks.len() + 1);
        frames.push(BytesMut::from(&header[..]));
        for (seq, block) in blocks.iter().enumerate() {
            let mut frame = BytesMut::with_capacity(P25_HEADER_LEN + block.len());
            frame.extend_from_slice(&header[..P25_HEADER_LEN]);
            frame[OFFSET_BLOCK] = (seq + 1) as u8;
            frame[OFFSET_LEN] = block.len().min(u8::MAX as usize) as u8;
            frame.extend_from_slice(block);
            frames.push(frame);
        }
        Ok(frames)
    }
}

/// Build a P25 network frame. Used by tests and tooling.
pub fn build_frame(unit: u8, lco: u8, src_id: u32, dst_id: u32, block: u8, data: &[u8]) -> BytesMut {
    let mut frame = BytesMut::zeroed(P25_HEADER_LEN);
    frame[..4].copy_from_slice(&P25_TAG);
    frame[OFFSET_LCO] = lco;
    put_u24(&mut frame, OFFSET_SRC, src_id);
    put_u24(&mut frame, OFFSET_DST, dst_id);
    frame[OFFSET_BLOCK] = block;
    frame[OFFSET_DUID] = unit;
    frame[OFFSET_LEN] = data.len().min(u8::MAX as usize) as u8;
    frame.extend_from_slice(data);
    frame
}

/// Build the PDU header frame for an unconfirmed PDU to `llid`.
pub fn build_pdu_header_frame(src_id: u32, llid: u32, sap: u8, blocks: u8) -> BytesMut {
    let header = PduHeader {
        ack_needed: false,
        outbound: false,
        format: pdu_format::UNCONFIRMED,
        sap,
        mfid: 0,
        llid,
        full_message: true,
        blocks_to_follow: blocks,
        pad_count: 0,
        ns: 0,
        header_offset: 0,
    };
    build_frame(duid::PDU, 0, src_id, llid, 0, &header.encode())
}
