//! Peer directory -- which UDP address each peer id was last heard from.
//!
//! Peers announce themselves by sending traffic; the envelope peer id is
//! recorded against the datagram's source address. Outbound frames are
//! addressed by looking the target peer up here. A live peer's address is
//! pinned: another source claiming its id is refused until the peer has been
//! silent for the pin window.

use fne_api::PeerDetail;
use fne_protocol::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_ADDRESS_PIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub frames: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Registered,
    Seen,
    /// Silent past the pin window, now heard from a new address.
    Moved { from: SocketAddr },
    /// A different source claimed a live peer's id. Nothing was recorded.
    Conflict { pinned: SocketAddr },
}

impl Observation {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Observation::Conflict { .. })
    }
}

#[derive(Clone)]
pub struct PeerDirectory {
    inner: Arc<RwLock<HashMap<PeerId, PeerEntry>>>,
    pin: Duration,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::with_address_pin(DEFAULT_ADDRESS_PIN)
    }
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address_pin(pin: Duration) -> Self {
        Self {
            inner: Arc::default(),
            pin,
        }
    }

    /// Record a datagram from `peer_id` at `addr`.
    pub fn observe(&self, peer_id: PeerId, addr: SocketAddr, now: Instant) -> Observation {
        let mut peers = self.inner.write();
        match peers.get_mut(&peer_id) {
            Some(entry) if entry.addr == addr => {
                entry.last_seen = now;
                entry.frames += 1;
                Observation::Seen
            }
            Some(entry) => {
                let silent = now.saturating_duration_since(entry.last_seen);
                if silent < self.pin {
                    tracing::warn!(
                        peer_id,
                        pinned = %entry.addr,
                        claimed = %addr,
                        "peer id claimed from another address, ignored"
                    );
                    return Observation::Conflict { pinned: entry.addr };
                }
                let from = entry.addr;
                tracing::warn!(
                    peer_id,
                    old = %from,
                    new = %addr,
                    silent_secs = silent.as_secs(),
                    "peer address changed"
                );
                entry.addr = addr;
                entry.last_seen = now;
                entry.frames += 1;
                Observation::Moved { from }
            }
            None => {
                tracing::info!(peer_id, %addr, total = peers.len() + 1, "peer registered");
                peers.insert(
                    peer_id,
                    PeerEntry {
                        addr,
                        last_seen: now,
                        frames: 1,
                    },
                );
                Observation::Registered
            }
        }
    }

    pub fn addr_of(&self, peer_id: PeerId) -> Option<SocketAddr> {
        self.inner.read().get(&peer_id).map(|e| e.addr)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.inner.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Snapshot for the API peers route.
    pub fn details(&self, now: Instant) -> Vec<PeerDetail> {
        let peers = self.inner.read();
        let mut out: Vec<PeerDetail> = peers
            .iter()
            .map(|(id, e)| PeerDetail {
                peer_id: *id,
                addr: e.addr.to_string(),
                last_seen_secs: now.saturating_duration_since(e.last_seen).as_secs(),
                frames: e.frames,
            })
            .collect();
        out.sort_by_key(|p| p.peer_id);
        out
    }
}
