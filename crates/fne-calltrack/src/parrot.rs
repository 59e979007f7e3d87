//! Parrot (loopback) queue -- records one transmission and plays it back.
//!
//! A capture is owned by the first (peer, stream) that keys up. The queue
//! only becomes ready for playback once that stream's end marker arrives.
//! A capture that outgrows the queue is thrown away whole.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use fne_protocol::{PeerId, StreamId};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParrotFrame {
    pub peer_id: PeerId,
    pub stream_id: StreamId,
    pub seq: u16,
    pub payload: Bytes,
    /// Capture order, monotonically increasing.
    pub order: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureReject {
    /// Another stream owns the capture.
    Busy { peer_id: PeerId, stream_id: StreamId },
    /// Previous capture is waiting to be played back.
    Playback,
    /// This stream's capture was aborted for length.
    Aborted,
    /// Capture exceeded the queue and was discarded.
    Overflow { max: usize },
}

impl std::fmt::Display for CaptureReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureReject::Busy { peer_id, stream_id } => {
                write!(f, "parrot busy with peer {peer_id} stream {stream_id:#x}")
            }
            CaptureReject::Playback => write!(f, "parrot playback pending"),
            CaptureReject::Aborted => write!(f, "capture aborted"),
            CaptureReject::Overflow { max } => write!(f, "capture exceeded {max} frames"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured { frames: usize },
    Rejected(CaptureReject),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParrotStatus {
    pub frames: usize,
    pub ready: bool,
    pub capturing: Option<(PeerId, StreamId)>,
}

#[derive(Debug)]
struct Capture {
    peer_id: PeerId,
    stream_id: StreamId,
    last_activity: Instant,
}

impl Capture {
    fn is(&self, peer_id: PeerId, stream_id: StreamId) -> bool {
        self.peer_id == peer_id && self.stream_id == stream_id
    }
}

#[derive(Debug, Default)]
struct ParrotState {
    frames: VecDeque<ParrotFrame>,
    capture: Option<Capture>,
    ready_since: Option<Instant>,
    aborted: Option<Capture>,
    next_order: u64,
}

impl ParrotState {
    fn reset(&mut self) {
        self.frames.clear();
        self.capture = None;
        self.ready_since = None;
    }
}

pub struct ParrotQueue {
    state: Mutex<ParrotState>,
    max_frames: usize,
}

impl ParrotQueue {
    pub fn new(max_frames: usize) -> Self {
        Self {
            state: Mutex::new(ParrotState::default()),
            max_frames,
        }
    }

    pub fn capture(
        &self,
        peer_id: PeerId,
        stream_id: StreamId,
        seq: u16,
        payload: Bytes,
        now: Instant,
    ) -> CaptureOutcome {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.ready_since.is_some() {
            return CaptureOutcome::Rejected(CaptureReject::Playback);
        }
        if let Some(aborted) = state.aborted.as_mut().filter(|a| a.is(peer_id, stream_id)) {
            aborted.last_activity = now;
            return CaptureOutcome::Rejected(CaptureReject::Aborted);
        }

        match &mut state.capture {
            Some(c) if !c.is(peer_id, stream_id) => {
                return CaptureOutcome::Rejected(CaptureReject::Busy {
                    peer_id: c.peer_id,
                    stream_id: c.stream_id,
                });
            }
            Some(c) => c.last_activity = now,
            None => {
                state.aborted = None;
                state.capture = Some(Capture {
                    peer_id,
                    stream_id,
                    last_activity: now,
                });
                tracing::info!(peer_id, stream_id, "parrot: capture start");
            }
        }

        if state.frames.len() >= self.max_frames {
            tracing::warn!(
                peer_id,
                stream_id,
                max = self.max_frames,
                "parrot: capture too long, discarded"
            );
            state.reset();
            state.aborted = Some(Capture {
                peer_id,
                stream_id,
                last_activity: now,
            });
            return CaptureOutcome::Rejected(CaptureReject::Overflow {
                max: self.max_frames,
            });
        }

        let order = state.next_order;
        state.next_order += 1;
        state.frames.push_back(ParrotFrame {
            peer_id,
            stream_id,
            seq,
            payload,
            order,
        });
        CaptureOutcome::Captured {
            frames: state.frames.len(),
        }
    }

    /// End marker for `stream_id`. Returns true if the queue became ready.
    pub fn end_of_transmission(&self, peer_id: PeerId, stream_id: StreamId, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.aborted.as_ref().is_some_and(|a| a.is(peer_id, stream_id)) {
            state.aborted = None;
            return false;
        }
        let owns = state.capture.as_ref().is_some_and(|c| c.is(peer_id, stream_id));
        if !owns || state.ready_since.is_some() {
            return false;
        }
        if state.frames.is_empty() {
            state.capture = None;
            return false;
        }
        state.ready_since = Some(now);
        tracing::info!(
            peer_id,
            stream_id,
            frames = state.frames.len(),
            "parrot: capture complete"
        );
        true
    }

    pub fn has_ready_frames(&self) -> bool {
        let state = self.state.lock();
        state.ready_since.is_some() && !state.frames.is_empty()
    }

    /// When the current capture became ready for playback.
    pub fn ready_since(&self) -> Option<Instant> {
        self.state.lock().ready_since
    }

    /// Pop the next frame in capture order. Draining the last frame
    /// re-opens the queue for a new capture.
    pub fn drain_next(&self) -> Option<ParrotFrame> {
        let mut state = self.state.lock();
        state.ready_since?;
        let frame = state.frames.pop_front();
        if state.frames.is_empty() {
            state.reset();
        }
        frame
    }

    /// Next frame once playback has been ready for at least `delay`.
    pub fn next_due(&self, now: Instant, delay: Duration) -> Option<ParrotFrame> {
        let ready = self.ready_since()?;
        if now.saturating_duration_since(ready) < delay {
            return None;
        }
        self.drain_next()
    }

    /// Clear a capture (or abort marker) whose stream went quiet without
    /// an end marker. Returns true if a capture was cleared.
    pub fn expire(&self, now: Instant, max_idle: Duration) -> bool {
        let mut state = self.state.lock();
        let idle = |c: &Capture| now.saturating_duration_since(c.last_activity) > max_idle;
        if state.aborted.as_ref().is_some_and(idle) {
            state.aborted = None;
        }
        if state.ready_since.is_some() || !state.capture.as_ref().is_some_and(idle) {
            return false;
        }
        tracing::debug!(frames = state.frames.len(), "parrot: stale capture cleared");
        state.reset();
        true
    }

    pub fn status(&self) -> ParrotStatus {
        let state = self.state.lock();
        ParrotStatus {
            frames: state.frames.len(),
            ready: state.ready_since.is_some(),
            capturing: state.capture.as_ref().map(|c| (c.peer_id, c.stream_id)),
        }
    }
}
