//! Dispatcher -- per-frame pipeline for one protocol.
//!
//! classify -> session update -> [reassemble] -> route -> forward | capture | drop
//!
//! Every rejection is returned as a [`DropReason`]; nothing here fails the
//! caller or touches state belonging to other peers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use fne_protocol::{
    Channel, FrameError, FrameInfo, PduBlock, PeerId, ProtocolAdapter, SessionKey, StreamId,
    CURRENT_TIMING, PARROT_TALKGROUP,
};
use fne_routing::{Destination, Direction, RouteRequest, RoutingDecision, RoutingEngine, Target};
use serde::Serialize;

use crate::clock::Clock;
use crate::parrot::{CaptureOutcome, CaptureReject, ParrotQueue};
use crate::reassembly::{CompletedPdu, ReassemblyOutcome, Reassembler, RejectReason};
use crate::session::{CallIdentity, SessionEvent, SessionTable};
use crate::sink::FrameSink;
use crate::stats::DispatchStats;

/// One frame as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub peer_id: PeerId,
    pub stream_id: StreamId,
    pub seq: u16,
    pub data: Bytes,
    /// Received over a link to another FNE.
    pub external: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Malformed(FrameError),
    Duplicate,
    Stale,
    Unauthorized,
    Pdu(RejectReason),
    Parrot(CaptureReject),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Malformed(e) => write!(f, "malformed: {e}"),
            DropReason::Duplicate => write!(f, "duplicate"),
            DropReason::Stale => write!(f, "stale stream"),
            DropReason::Unauthorized => write!(f, "unauthorized"),
            DropReason::Pdu(r) => write!(f, "pdu: {r}"),
            DropReason::Parrot(r) => write!(f, "parrot: {r}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Sent to `sent` targets; `failed` targets could not be handed to the transport.
    Forwarded { sent: usize, failed: usize },
    Captured,
    Reassembling,
    Dropped(DropReason),
}

impl DispatchOutcome {
    /// Frame was taken into the engine (not necessarily forwarded).
    pub fn accepted(&self) -> bool {
        !matches!(self, DispatchOutcome::Dropped(_))
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub session_idle: Duration,
    pub pdu_max_age: Duration,
    /// Talkgroup whose group voice is captured for playback. None: parrot off.
    pub parrot_talkgroup: Option<u32>,
    pub parrot_max_frames: usize,
    pub retired_stream_memory: usize,
    /// Hex-dump every accepted frame at trace level.
    pub trace_frames: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            session_idle: Duration::from_millis(CURRENT_TIMING.session_idle_ms),
            pdu_max_age: Duration::from_millis(CURRENT_TIMING.pdu_max_age_ms),
            parrot_talkgroup: Some(PARROT_TALKGROUP),
            parrot_max_frames: CURRENT_TIMING.parrot_max_frames,
            retired_stream_memory: CURRENT_TIMING.retired_stream_memory,
            trace_frames: false,
        }
    }
}

/// What one sweep pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub sessions: usize,
    pub pdus: usize,
    pub parrot_cleared: bool,
}

impl SweepReport {
    pub fn merge(&mut self, other: SweepReport) {
        self.sessions += other.sessions;
        self.pdus += other.pdus;
        self.parrot_cleared |= other.parrot_cleared;
    }
}

pub struct Dispatcher<A: ProtocolAdapter> {
    adapter: A,
    config: DispatcherConfig,
    sessions: SessionTable,
    reassembler: Reassembler,
    parrot: ParrotQueue,
    routing: RoutingEngine,
    sink: Arc<dyn FrameSink>,
    clock: Arc<dyn Clock>,
    stats: DispatchStats,
}

impl<A: ProtocolAdapter> Dispatcher<A> {
    pub fn new(
        adapter: A,
        config: DispatcherConfig,
        routing: RoutingEngine,
        sink: Arc<dyn FrameSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions: SessionTable::new(config.retired_stream_memory),
            reassembler: Reassembler::new(adapter.max_pdu_blocks()),
            parrot: ParrotQueue::new(config.parrot_max_frames),
            adapter,
            config,
            routing,
            sink,
            clock,
            stats: DispatchStats::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.adapter.name()
    }

    /// Frame tag this dispatcher accepts.
    pub fn tag(&self) -> [u8; 4] {
        self.adapter.tag()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn parrot(&self) -> &ParrotQueue {
        &self.parrot
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Transport entry point. True if the frame was accepted.
    pub fn process_frame(
        &self,
        peer_id: PeerId,
        stream_id: StreamId,
        seq: u16,
        data: Bytes,
        external: bool,
    ) -> bool {
        self.dispatch(InboundFrame {
            peer_id,
            stream_id,
            seq,
            data,
            external,
        })
        .accepted()
    }

    pub fn dispatch(&self, frame: InboundFrame) -> DispatchOutcome {
        self.stats.received();
        let outcome = self.run(&frame);
        if let DispatchOutcome::Dropped(reason) = &outcome {
            self.stats.dropped(reason);
        }
        outcome
    }

    fn run(&self, frame: &InboundFrame) -> DispatchOutcome {
        let proto = self.adapter.name();
        let info = match self.adapter.parse(&frame.data) {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!(
                    proto,
                    peer_id = frame.peer_id,
                    stream_id = frame.stream_id,
                    error = %e,
                    "frame rejected"
                );
                return DispatchOutcome::Dropped(DropReason::Malformed(e));
            }
        };
        if self.config.trace_frames {
            tracing::trace!(
                proto,
                peer_id = frame.peer_id,
                stream_id = frame.stream_id,
                seq = frame.seq,
                data = %hex::encode(&frame.data),
                "frame"
            );
        }

        let now = self.clock.now();
        let key = self.adapter.session_key(frame.peer_id, frame.stream_id, &info);
        let call = CallIdentity {
            stream_id: frame.stream_id,
            src_id: info.src_id,
            dst_id: info.dst_id,
            slot: info.slot,
        };

        match self.sessions.touch(key, call, frame.seq, now) {
            SessionEvent::NewCall => tracing::info!(
                peer_id = frame.peer_id,
                stream_id = frame.stream_id,
                src_id = info.src_id,
                dst_id = info.dst_id,
                slot = info.slot,
                class = info.class.as_str(),
                "{proto}: call start"
            ),
            SessionEvent::ContinuingCall => {}
            SessionEvent::SupersededCall { prior } => tracing::debug!(
                peer_id = frame.peer_id,
                stream_id = frame.stream_id,
                prior_stream = prior,
                slot = info.slot,
                "{proto}: call superseded"
            ),
            SessionEvent::Duplicate => return DispatchOutcome::Dropped(DropReason::Duplicate),
            SessionEvent::Stale => return DispatchOutcome::Dropped(DropReason::Stale),
        }

        match info.channel(self.config.parrot_talkgroup) {
            Channel::Call => self.route_call(frame, &info, key, now),
            Channel::Pdu(block) => self.route_pdu(frame, &info, key, block, now),
            Channel::Loopback => self.capture(frame, &info, key, now),
        }
    }

    fn decide(&self, frame: &InboundFrame, info: &FrameInfo) -> RoutingDecision {
        self.routing.decide(&RouteRequest {
            peer_id: frame.peer_id,
            destination: Destination::new(info.dst_id, info.group),
            slot: info.slot,
            class: info.class,
            direction: Direction::Inbound,
            external: frame.external,
        })
    }

    fn route_call(
        &self,
        frame: &InboundFrame,
        info: &FrameInfo,
        key: SessionKey,
        now: Instant,
    ) -> DispatchOutcome {
        let decision = self.decide(frame, info);
        if !decision.permitted {
            self.sessions.discard(key, frame.stream_id);
            return DispatchOutcome::Dropped(DropReason::Unauthorized);
        }

        let mut sent = 0;
        let mut failed = 0;
        for target in &decision.targets {
            let buf = BytesMut::from(&frame.data[..]);
            if self.send(target, buf, frame.seq, frame.stream_id) {
                sent += 1;
            } else {
                failed += 1;
            }
        }

        if info.grant_demand {
            self.stats.grant_demand();
            tracing::debug!(
                peer_id = frame.peer_id,
                stream_id = frame.stream_id,
                src_id = info.src_id,
                dst_id = info.dst_id,
                "{}: grant demand",
                self.adapter.name()
            );
        }
        if info.end_of_transmission {
            self.end_call(key, frame.stream_id, now);
        }
        DispatchOutcome::Forwarded { sent, failed }
    }

    fn route_pdu(
        &self,
        frame: &InboundFrame,
        info: &FrameInfo,
        key: SessionKey,
        block: PduBlock,
        now: Instant,
    ) -> DispatchOutcome {
        let (peer_id, stream_id) = (frame.peer_id, frame.stream_id);
        let decision = self.decide(frame, info);
        if !decision.permitted {
            self.reassembler.abandon(peer_id, stream_id);
            self.sessions.discard(key, stream_id);
            return DispatchOutcome::Dropped(DropReason::Unauthorized);
        }

        match self.reassembler.begin_or_continue(peer_id, stream_id, block, now) {
            ReassemblyOutcome::Started { declared } => {
                tracing::debug!(peer_id, stream_id, declared, "pdu: reassembly start");
                DispatchOutcome::Reassembling
            }
            ReassemblyOutcome::Progressed { .. } => DispatchOutcome::Reassembling,
            ReassemblyOutcome::Rejected(reason) => {
                match reason {
                    RejectReason::OversizedPdu { .. } | RejectReason::SequenceOutOfRange { .. } => {
                        tracing::warn!(peer_id, stream_id, reason = %reason, "pdu: block rejected")
                    }
                    _ => tracing::debug!(peer_id, stream_id, reason = %reason, "pdu: block rejected"),
                }
                // A rejected block only keeps its session alive under a live reassembly
                if !self.reassembler.is_pending(peer_id, stream_id) {
                    self.sessions.discard(key, stream_id);
                }
                DispatchOutcome::Dropped(DropReason::Pdu(reason))
            }
            ReassemblyOutcome::Completed(pdu) => {
                self.stats.pdu_completed();
                tracing::info!(
                    peer_id,
                    stream_id,
                    llid = pdu.info.llid,
                    blocks = pdu.blocks.len(),
                    bytes = pdu.payload.len(),
                    extended = pdu.info.extended_address,
                    "pdu: reassembly complete"
                );
                let outcome = self.forward_pdu(&pdu, &decision.targets);
                self.sessions.discard(key, stream_id);
                outcome
            }
        }
    }

    /// Re-fragment a completed PDU for each target, fresh sequence per target.
    /// Each target gets the whole PDU or nothing.
    fn forward_pdu(&self, pdu: &CompletedPdu, targets: &[Target]) -> DispatchOutcome {
        let mut sent = 0;
        let mut failed = 0;
        for target in targets {
            let batch = match self.pdu_batch(pdu, target) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(peer_id = target.peer_id, error = %e, "pdu: re-fragment failed");
                    self.stats.forwarded(0, 1);
                    failed += 1;
                    continue;
                }
            };
            let frames = batch.len();
            match self.sink.send_batch(target.peer_id, batch, pdu.stream_id) {
                Ok(()) => {
                    self.stats.forwarded(frames, 0);
                    sent += 1;
                }
                Err(e) => {
                    tracing::debug!(
                        peer_id = target.peer_id,
                        stream_id = pdu.stream_id,
                        frames,
                        error = %e,
                        "pdu: send failed"
                    );
                    self.stats.forwarded(0, 1);
                    failed += 1;
                }
            }
        }
        DispatchOutcome::Forwarded { sent, failed }
    }

    fn pdu_batch(&self, pdu: &CompletedPdu, target: &Target) -> Result<Vec<(Bytes, u16)>, FrameError> {
        self.adapter
            .pdu_frames(&pdu.header, &pdu.blocks)?
            .into_iter()
            .enumerate()
            .map(|(seq, mut buf)| {
                self.adapter
                    .rewrite(&mut buf, target.destination_id, target.slot)?;
                Ok((buf.freeze(), seq as u16))
            })
            .collect()
    }

    fn capture(
        &self,
        frame: &InboundFrame,
        info: &FrameInfo,
        key: SessionKey,
        now: Instant,
    ) -> DispatchOutcome {
        if !self.routing.admits(frame.peer_id) {
            self.sessions.discard(key, frame.stream_id);
            return DispatchOutcome::Dropped(DropReason::Unauthorized);
        }

        let outcome = match self.parrot.capture(
            frame.peer_id,
            frame.stream_id,
            frame.seq,
            frame.data.clone(),
            now,
        ) {
            CaptureOutcome::Captured { .. } => {
                self.stats.captured();
                DispatchOutcome::Captured
            }
            CaptureOutcome::Rejected(reason) => {
                tracing::debug!(
                    peer_id = frame.peer_id,
                    stream_id = frame.stream_id,
                    reason = %reason,
                    "parrot: frame not captured"
                );
                DispatchOutcome::Dropped(DropReason::Parrot(reason))
            }
        };

        if info.end_of_transmission {
            self.parrot
                .end_of_transmission(frame.peer_id, frame.stream_id, now);
            self.end_call(key, frame.stream_id, now);
        }
        outcome
    }

    /// Rewrite `buf` for `target` and hand it to the transport.
    fn send(&self, target: &Target, mut buf: BytesMut, seq: u16, stream_id: StreamId) -> bool {
        if let Err(e) = self
            .adapter
            .rewrite(&mut buf, target.destination_id, target.slot)
        {
            tracing::warn!(peer_id = target.peer_id, error = %e, "rewrite failed");
            self.stats.forwarded(0, 1);
            return false;
        }
        match self
            .sink
            .send_to_peer(target.peer_id, buf.freeze(), seq, stream_id)
        {
            Ok(()) => {
                self.stats.forwarded(1, 0);
                true
            }
            Err(e) => {
                tracing::debug!(peer_id = target.peer_id, stream_id, error = %e, "send failed");
                self.stats.forwarded(0, 1);
                false
            }
        }
    }

    fn end_call(&self, key: SessionKey, stream_id: StreamId, now: Instant) {
        if let Some(call) = self.sessions.end(key, stream_id, now) {
            tracing::info!(
                peer_id = call.peer_id,
                stream_id,
                src_id = call.src_id,
                dst_id = call.dst_id,
                slot = call.slot,
                duration_ms = call.duration().as_millis() as u64,
                frames = call.frames,
                "{}: call end",
                self.adapter.name()
            );
        }
    }

    /// Expire idle sessions, stale reassemblies and abandoned parrot captures.
    pub fn sweep_expired(&self, now: Instant) -> SweepReport {
        let proto = self.adapter.name();
        let sessions = self.sessions.sweep(now, self.config.session_idle);
        for call in &sessions {
            tracing::debug!(
                peer_id = call.peer_id,
                stream_id = call.stream_id,
                dst_id = call.dst_id,
                slot = call.slot,
                "{proto}: call expired"
            );
        }
        let pdus = self.reassembler.expire(now, self.config.pdu_max_age);
        for (peer_id, stream_id) in &pdus {
            tracing::debug!(peer_id, stream_id, "pdu: reassembly expired");
        }
        let parrot_cleared = self.parrot.expire(now, self.config.session_idle);

        self.stats.expired(sessions.len(), pdus.len());
        SweepReport {
            sessions: sessions.len(),
            pdus: pdus.len(),
            parrot_cleared,
        }
    }

    /// Sweep using the dispatcher's own clock.
    pub fn sweep_now(&self) -> SweepReport {
        self.sweep_expired(self.clock.now())
    }
}
