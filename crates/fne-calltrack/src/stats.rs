//! Per-dispatcher counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::dispatcher::DropReason;

#[derive(Debug, Default)]
pub struct DispatchStats {
    frames_received: AtomicU64,
    frames_forwarded: AtomicU64,
    send_failures: AtomicU64,
    parrot_captured: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_stale: AtomicU64,
    dropped_unauthorized: AtomicU64,
    dropped_pdu: AtomicU64,
    dropped_parrot: AtomicU64,
    pdus_completed: AtomicU64,
    pdus_expired: AtomicU64,
    sessions_expired: AtomicU64,
    grant_demands: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_forwarded: u64,
    pub send_failures: u64,
    pub parrot_captured: u64,
    pub dropped_malformed: u64,
    pub dropped_duplicate: u64,
    pub dropped_stale: u64,
    pub dropped_unauthorized: u64,
    pub dropped_pdu: u64,
    pub dropped_parrot: u64,
    pub pdus_completed: u64,
    pub pdus_expired: u64,
    pub sessions_expired: u64,
    pub grant_demands: u64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl DispatchStats {
    pub fn received(&self) {
        bump(&self.frames_received, 1);
    }

    pub fn forwarded(&self, sent: usize, failed: usize) {
        bump(&self.frames_forwarded, sent as u64);
        bump(&self.send_failures, failed as u64);
    }

    pub fn captured(&self) {
        bump(&self.parrot_captured, 1);
    }

    pub fn grant_demand(&self) {
        bump(&self.grant_demands, 1);
    }

    pub fn pdu_completed(&self) {
        bump(&self.pdus_completed, 1);
    }

    pub fn expired(&self, sessions: usize, pdus: usize) {
        bump(&self.sessions_expired, sessions as u64);
        bump(&self.pdus_expired, pdus as u64);
    }

    pub fn dropped(&self, reason: &DropReason) {
        let counter = match reason {
            DropReason::Malformed(_) => &self.dropped_malformed,
            DropReason::Duplicate => &self.dropped_duplicate,
            DropReason::Stale => &self.dropped_stale,
            DropReason::Unauthorized => &self.dropped_unauthorized,
            DropReason::Pdu(_) => &self.dropped_pdu,
            DropReason::Parrot(_) => &self.dropped_parrot,
        };
        bump(counter, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_received: get(&self.frames_received),
            frames_forwarded: get(&self.frames_forwarded),
            send_failures: get(&self.send_failures),
            parrot_captured: get(&self.parrot_captured),
            dropped_malformed: get(&self.dropped_malformed),
            dropped_duplicate: get(&self.dropped_duplicate),
            dropped_stale: get(&self.dropped_stale),
            dropped_unauthorized: get(&self.dropped_unauthorized),
            dropped_pdu: get(&self.dropped_pdu),
            dropped_parrot: get(&self.dropped_parrot),
            pdus_completed: get(&self.pdus_completed),
            pdus_expired: get(&self.pdus_expired),
            sessions_expired: get(&self.sessions_expired),
            grant_demands: get(&self.grant_demands),
        }
    }
}

impl StatsSnapshot {
    pub fn dropped_total(&self) -> u64 {
        self.dropped_malformed
            + self.dropped_duplicate
            + self.dropped_stale
            + self.dropped_unauthorized
            + self.dropped_pdu
            + self.dropped_parrot
    }
}
