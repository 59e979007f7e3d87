//! PDU reassembler -- collects sequenced data blocks into one payload.
//!
//! One context per (peer, stream). The header block declares the block
//! count; storage is a fixed slice of that size, never larger than the
//! protocol maximum. Blocks may arrive in any order and a repeated block
//! overwrites its slot. The payload is emitted once, in sequence order,
//! when every slot is filled.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fne_protocol::{PduBlock, PduHeaderInfo, PeerId, StreamId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    OversizedPdu { declared: usize, max: usize },
    SequenceOutOfRange { seq: usize, declared: usize },
    /// Data block with no header seen for its stream.
    NoContext,
    /// Header declaring zero blocks.
    EmptyPdu,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::OversizedPdu { declared, max } => {
                write!(f, "pdu declares {declared} blocks (max {max})")
            }
            RejectReason::SequenceOutOfRange { seq, declared } => {
                write!(f, "block {seq} outside declared {declared}")
            }
            RejectReason::NoContext => write!(f, "block without header"),
            RejectReason::EmptyPdu => write!(f, "pdu declares no blocks"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPdu {
    pub peer_id: PeerId,
    pub stream_id: StreamId,
    /// Header-carrying network frame as received.
    pub header: Bytes,
    pub info: PduHeaderInfo,
    /// Data blocks in sequence order.
    pub blocks: Vec<Bytes>,
    /// Concatenation of `blocks`.
    pub payload: Bytes,
}

impl CompletedPdu {
    /// Payload after the secondary (extended address) header.
    pub fn user_data(&self) -> Bytes {
        let skip = if self.info.extended_address {
            self.info.secondary_header_len.min(self.payload.len())
        } else {
            0
        };
        self.payload.slice(skip..)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    Started { declared: usize },
    Progressed { received: usize, declared: usize },
    Completed(CompletedPdu),
    Rejected(RejectReason),
}

#[derive(Debug)]
struct ReassemblyContext {
    info: PduHeaderInfo,
    header: Bytes,
    blocks: Box<[Option<Bytes>]>,
    received: usize,
    byte_offset: usize,
    created_at: Instant,
}

impl ReassemblyContext {
    fn new(info: PduHeaderInfo, header: Bytes, now: Instant) -> Self {
        Self {
            info,
            header,
            blocks: vec![None; info.declared_blocks].into_boxed_slice(),
            received: 0,
            byte_offset: 0,
            created_at: now,
        }
    }

    fn store(&mut self, seq: usize, payload: Bytes) {
        let len = payload.len();
        match self.blocks[seq].replace(payload) {
            Some(old) => self.byte_offset = self.byte_offset - old.len() + len,
            None => {
                self.received += 1;
                self.byte_offset += len;
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.blocks.len()
    }

    fn finish(self, peer_id: PeerId, stream_id: StreamId) -> CompletedPdu {
        let blocks: Vec<Bytes> = self.blocks.into_vec().into_iter().flatten().collect();
        let mut payload = BytesMut::with_capacity(self.byte_offset);
        for block in &blocks {
            payload.extend_from_slice(block);
        }
        CompletedPdu {
            peer_id,
            stream_id,
            header: self.header,
            info: self.info,
            blocks,
            payload: payload.freeze(),
        }
    }
}

pub struct Reassembler {
    contexts: DashMap<(PeerId, StreamId), ReassemblyContext>,
    max_blocks: usize,
}

impl Reassembler {
    pub fn new(max_blocks: usize) -> Self {
        Self {
            contexts: DashMap::new(),
            max_blocks,
        }
    }

    pub fn begin_or_continue(
        &self,
        peer_id: PeerId,
        stream_id: StreamId,
        block: PduBlock,
        now: Instant,
    ) -> ReassemblyOutcome {
        let key = (peer_id, stream_id);
        match block {
            PduBlock::Header { info, frame } => {
                let declared = info.declared_blocks;
                if declared == 0 {
                    return ReassemblyOutcome::Rejected(RejectReason::EmptyPdu);
                }
                if declared > self.max_blocks {
                    return ReassemblyOutcome::Rejected(RejectReason::OversizedPdu {
                        declared,
                        max: self.max_blocks,
                    });
                }
                let ctx = ReassemblyContext::new(info, frame, now);
                if let Some(old) = self.contexts.insert(key, ctx) {
                    tracing::debug!(
                        peer_id,
                        stream_id,
                        received = old.received,
                        declared = old.blocks.len(),
                        "pdu: reassembly superseded"
                    );
                }
                ReassemblyOutcome::Started { declared }
            }
            PduBlock::Data { seq, payload } => {
                let Entry::Occupied(mut entry) = self.contexts.entry(key) else {
                    return ReassemblyOutcome::Rejected(RejectReason::NoContext);
                };
                let ctx = entry.get_mut();
                let declared = ctx.blocks.len();
                if seq >= declared {
                    return ReassemblyOutcome::Rejected(RejectReason::SequenceOutOfRange {
                        seq,
                        declared,
                    });
                }
                ctx.store(seq, payload);
                if !ctx.is_complete() {
                    return ReassemblyOutcome::Progressed {
                        received: ctx.received,
                        declared,
                    };
                }
                let pdu = entry.remove().finish(peer_id, stream_id);
                ReassemblyOutcome::Completed(pdu)
            }
        }
    }

    /// True while a header has been seen for (peer, stream) and blocks are outstanding.
    pub fn is_pending(&self, peer_id: PeerId, stream_id: StreamId) -> bool {
        self.contexts.contains_key(&(peer_id, stream_id))
    }

    /// Drop any context for (peer, stream). Returns true if one existed.
    pub fn abandon(&self, peer_id: PeerId, stream_id: StreamId) -> bool {
        self.contexts.remove(&(peer_id, stream_id)).is_some()
    }

    /// Drop contexts older than `max_age` without dispatching them.
    pub fn expire(&self, now: Instant, max_age: Duration) -> Vec<(PeerId, StreamId)> {
        let mut expired = Vec::new();
        self.contexts.retain(|key, ctx| {
            if now.saturating_duration_since(ctx.created_at) > max_age {
                expired.push(*key);
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
