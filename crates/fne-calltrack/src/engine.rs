//! FNE engine -- one dispatcher per air interface, selected by frame tag.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use fne_protocol::{DmrAdapter, FrameError, P25Adapter, PeerId, StreamId};
use fne_routing::RoutingEngine;
use serde::Serialize;

use crate::clock::Clock;
use crate::dispatcher::{
    DispatchOutcome, Dispatcher, DispatcherConfig, DropReason, InboundFrame, SweepReport,
};
use crate::parrot::{ParrotQueue, ParrotStatus};
use crate::session::CallSummary;
use crate::sink::FrameSink;
use crate::stats::StatsSnapshot;

/// Live call tagged with its protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveCall {
    pub protocol: &'static str,
    #[serde(flatten)]
    pub call: CallSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoreStats {
    pub dmr: StatsSnapshot,
    pub p25: StatsSnapshot,
    /// Frames whose tag matched no protocol.
    pub unrecognised: u64,
    pub pending_pdus: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParrotReport {
    pub protocol: &'static str,
    #[serde(flatten)]
    pub status: ParrotStatus,
}

pub struct FneCore {
    dmr: Dispatcher<DmrAdapter>,
    p25: Dispatcher<P25Adapter>,
    clock: Arc<dyn Clock>,
    unrecognised: AtomicU64,
}

impl FneCore {
    pub fn new(
        config: DispatcherConfig,
        routing: RoutingEngine,
        sink: Arc<dyn FrameSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_dmr_adapter(DmrAdapter::default(), config, routing, sink, clock)
    }

    /// Build with a configured DMR adapter, e.g. one carrying a link control codec.
    pub fn with_dmr_adapter(
        dmr: DmrAdapter,
        config: DispatcherConfig,
        routing: RoutingEngine,
        sink: Arc<dyn FrameSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dmr: Dispatcher::new(
                dmr,
                config.clone(),
                routing.clone(),
                sink.clone(),
                clock.clone(),
            ),
            p25: Dispatcher::new(P25Adapter, config, routing, sink, clock.clone()),
            clock,
            unrecognised: AtomicU64::new(0),
        }
    }

    pub fn dmr(&self) -> &Dispatcher<DmrAdapter> {
        &self.dmr
    }

    pub fn p25(&self) -> &Dispatcher<P25Adapter> {
        &self.p25
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn dispatch(&self, frame: InboundFrame) -> DispatchOutcome {
        let mut tag = [0u8; 4];
        match frame.data.get(..4) {
            Some(t) => tag.copy_from_slice(t),
            None => {
                self.unrecognised.fetch_add(1, Ordering::Relaxed);
                return DispatchOutcome::Dropped(DropReason::Malformed(FrameError::TooShort {
                    len: frame.data.len(),
                    min: 4,
                }));
            }
        }
        if tag == self.dmr.tag() {
            self.dmr.dispatch(frame)
        } else if tag == self.p25.tag() {
            self.p25.dispatch(frame)
        } else {
            self.unrecognised.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(peer_id = frame.peer_id, tag = %hex::encode(tag), "unrecognised frame tag");
            DispatchOutcome::Dropped(DropReason::Malformed(FrameError::BadTag(tag)))
        }
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

    pub fn sweep_expired(&self, now: Instant) -> SweepReport {
        let mut report = self.dmr.sweep_expired(now);
        report.merge(self.p25.sweep_expired(now));
        report
    }

    pub fn sweep_now(&self) -> SweepReport {
        self.sweep_expired(self.clock.now())
    }

    pub fn active_calls(&self) -> Vec<ActiveCall> {
        let now = self.clock.now();
        let tag = |protocol: &'static str| {
            move |call: CallSummary| ActiveCall { protocol, call }
        };
        let mut calls: Vec<_> = self
            .dmr
            .sessions()
            .snapshot(now)
            .into_iter()
            .map(tag(self.dmr.name()))
            .collect();
        calls.extend(
            self.p25
                .sessions()
                .snapshot(now)
                .into_iter()
                .map(tag(self.p25.name())),
        );
        calls
    }

    pub fn parrots(&self) -> [(&'static str, &ParrotQueue); 2] {
        [
            (self.dmr.name(), self.dmr.parrot()),
            (self.p25.name(), self.p25.parrot()),
        ]
    }

    pub fn parrot_status(&self) -> Vec<ParrotReport> {
        self.parrots()
            .into_iter()
            .map(|(protocol, queue)| ParrotReport {
                protocol,
                status: queue.status(),
            })
            .collect()
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            dmr: self.dmr.stats().snapshot(),
            p25: self.p25.stats().snapshot(),
            unrecognised: self.unrecognised.load(Ordering::Relaxed),
            pending_pdus: self.p25.reassembler().len(),
        }
    }
}
