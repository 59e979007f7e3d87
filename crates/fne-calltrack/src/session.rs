//! Session table -- one live call per session key.
//!
//! Slot-keyed protocols get last-writer-wins: a new stream on a busy slot
//! supersedes the running call. Streams that were superseded or ended are
//! remembered briefly so late frames are rejected instead of reopening a call.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fne_protocol::{PeerId, SessionKey, SlotNo, StreamId};
use serde::Serialize;

/// Addressing of the call a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallIdentity {
    pub stream_id: StreamId,
    pub src_id: u32,
    pub dst_id: u32,
    pub slot: SlotNo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub peer_id: PeerId,
    pub stream_id: StreamId,
    pub src_id: u32,
    pub dst_id: u32,
    pub slot: SlotNo,
    pub started_at: Instant,
    pub started_wall: DateTime<Utc>,
    pub last_activity: Instant,
    pub last_seq: u16,
    pub frames: u64,
}

impl CallSession {
    fn open(peer_id: PeerId, call: CallIdentity, seq: u16, now: Instant) -> Self {
        Self {
            peer_id,
            stream_id: call.stream_id,
            src_id: call.src_id,
            dst_id: call.dst_id,
            slot: call.slot,
            started_at: now,
            started_wall: Utc::now(),
            last_activity: now,
            last_seq: seq,
            frames: 1,
        }
    }

    pub fn duration(&self) -> Duration {
        self.last_activity.saturating_duration_since(self.started_at)
    }

    pub fn summary(&self, now: Instant) -> CallSummary {
        CallSummary {
            peer_id: self.peer_id,
            stream_id: self.stream_id,
            src_id: self.src_id,
            dst_id: self.dst_id,
            slot: self.slot,
            started: self.started_wall,
            duration_ms: self.duration().as_millis() as u64,
            idle_ms: now.saturating_duration_since(self.last_activity).as_millis() as u64,
            frames: self.frames,
        }
    }
}

/// Serializable view of a live call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSummary {
    pub peer_id: PeerId,
    pub stream_id: StreamId,
    pub src_id: u32,
    pub dst_id: u32,
    pub slot: SlotNo,
    pub started: DateTime<Utc>,
    pub duration_ms: u64,
    pub idle_ms: u64,
    pub frames: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    NewCall,
    ContinuingCall,
    /// A different stream took over the key; `prior` is the stream it replaced.
    SupersededCall { prior: StreamId },
    /// Same stream and sequence as the previous frame.
    Duplicate,
    /// Frame for a stream that was already superseded or ended on this key.
    Stale,
}

#[derive(Debug)]
struct RetiredStreams {
    ids: VecDeque<StreamId>,
    updated: Instant,
}

pub struct SessionTable {
    sessions: DashMap<SessionKey, CallSession>,
    retired: DashMap<SessionKey, RetiredStreams>,
    retired_memory: usize,
}

impl SessionTable {
    pub fn new(retired_memory: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            retired: DashMap::new(),
            retired_memory,
        }
    }

    /// Record a frame against its session.
    pub fn touch(&self, key: SessionKey, call: CallIdentity, seq: u16, now: Instant) -> SessionEvent {
        // The session entry lock is held for the whole update; the retired
        // map is only ever locked after it.
        match self.sessions.entry(key) {
            Entry::Vacant(vacant) => {
                if self.is_retired(&key, call.stream_id) {
                    return SessionEvent::Stale;
                }
                vacant.insert(CallSession::open(key.peer_id(), call, seq, now));
                SessionEvent::NewCall
            }
            Entry::Occupied(mut occupied) => {
                let session = occupied.get_mut();
                if session.stream_id == call.stream_id {
                    if session.last_seq == seq {
                        return SessionEvent::Duplicate;
                    }
                    session.last_seq = seq;
                    session.last_activity = now;
                    session.frames += 1;
                    return SessionEvent::ContinuingCall;
                }
                if self.is_retired(&key, call.stream_id) {
                    return SessionEvent::Stale;
                }
                let prior = session.stream_id;
                self.retire(key, prior, now);
                *session = CallSession::open(key.peer_id(), call, seq, now);
                SessionEvent::SupersededCall { prior }
            }
        }
    }

    /// End the call on `key` if it is still `stream_id`. The stream is
    /// remembered so trailing frames are rejected as stale.
    pub fn end(&self, key: SessionKey, stream_id: StreamId, now: Instant) -> Option<CallSession> {
        let (_, session) = self
            .sessions
            .remove_if(&key, |_, s| s.stream_id == stream_id)?;
        self.retire(key, stream_id, now);
        Some(session)
    }

    /// Drop the call on `key` without remembering its stream.
    pub fn discard(&self, key: SessionKey, stream_id: StreamId) -> Option<CallSession> {
        self.sessions
            .remove_if(&key, |_, s| s.stream_id == stream_id)
            .map(|(_, s)| s)
    }

    /// Remove and return sessions idle for longer than `max_idle`.
    pub fn sweep(&self, now: Instant, max_idle: Duration) -> Vec<CallSession> {
        let mut expired = Vec::new();
        self.sessions.retain(|_, s| {
            if now.saturating_duration_since(s.last_activity) > max_idle {
                expired.push(s.clone());
                false
            } else {
                true
            }
        });
        self.retired
            .retain(|_, r| now.saturating_duration_since(r.updated) <= max_idle);
        expired
    }

    pub fn get(&self, key: &SessionKey) -> Option<CallSession> {
        self.sessions.get(key).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self, now: Instant) -> Vec<CallSummary> {
        let mut calls: Vec<_> = self.sessions.iter().map(|s| s.summary(now)).collect();
        calls.sort_by_key(|c| (c.peer_id, c.slot, c.stream_id));
        calls
    }

    fn is_retired(&self, key: &SessionKey, stream_id: StreamId) -> bool {
        self.retired
            .get(key)
            .is_some_and(|r| r.ids.contains(&stream_id))
    }

    fn retire(&self, key: SessionKey, stream_id: StreamId, now: Instant) {
        if self.retired_memory == 0 {
            return;
        }
        let mut entry = self.retired.entry(key).or_insert_with(|| RetiredStreams {
            ids: VecDeque::with_capacity(self.retired_memory),
            updated: now,
        });
        if entry.ids.len() == self.retired_memory {
            entry.ids.pop_front();
        }
        entry.ids.push_back(stream_id);
        entry.updated = now;
    }
}
