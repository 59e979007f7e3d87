//! Parrot playback task.
//!
//! Once a capture is complete and the playback delay has elapsed, frames are
//! replayed one per tick, in capture order, with their original sequence
//! numbers and stream id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fne_calltrack::{Clock, FneCore, FrameSink, ParrotFrame};
use fne_protocol::PeerId;
use tokio::sync::broadcast;

use crate::peer_directory::PeerDirectory;

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    pub delay: Duration,
    pub frame_interval: Duration,
    pub originating_only: bool,
}

/// Peers a replayed frame is sent to.
pub fn playback_targets(
    frame: &ParrotFrame,
    originating_only: bool,
    peers: &PeerDirectory,
) -> Vec<PeerId> {
    if originating_only {
        vec![frame.peer_id]
    } else {
        peers.peer_ids()
    }
}

/// Replay at most one due frame per protocol. Returns the number of sends
/// handed to the transport.
pub fn play_due(
    core: &FneCore,
    sink: &dyn FrameSink,
    peers: &PeerDirectory,
    config: &PlaybackConfig,
    now: Instant,
) -> usize {
    let mut sent = 0;
    for (protocol, queue) in core.parrots() {
        let Some(frame) = queue.next_due(now, config.delay) else {
            continue;
        };
        for peer_id in playback_targets(&frame, config.originating_only, peers) {
            match sink.send_to_peer(peer_id, frame.payload.clone(), frame.seq, frame.stream_id) {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::debug!(peer_id, seq = frame.seq, error = %e, "{protocol}: parrot send failed");
                }
            }
        }
        if !queue.has_ready_frames() {
            tracing::info!(
                peer_id = frame.peer_id,
                stream_id = frame.stream_id,
                "{protocol}: parrot playback complete"
            );
        }
    }
    sent
}

/// Run the playback loop until shutdown.
pub async fn run_parrot_loop(
    core: Arc<FneCore>,
    sink: Arc<dyn FrameSink>,
    peers: PeerDirectory,
    config: PlaybackConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(config.frame_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = core.clock().now();
                play_due(&core, sink.as_ref(), &peers, &config, now);
            }
            _ = shutdown.recv() => {
                tracing::info!("parrot: shutting down");
                break;
            }
        }
    }
}
