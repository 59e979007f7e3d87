//! UDP transport -- one socket shared by every peer.
//!
//! Inbound datagrams are decoded as envelopes and handed to the engine.
//! Outbound frames go through a bounded queue drained by a single send task,
//! so the engine never waits on the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use fne_calltrack::{
    Clock, DispatchOutcome, FneCore, FrameSink, InboundFrame, TransportError,
};
use fne_protocol::{Envelope, EnvelopeCodec, PeerId, StreamId};
use fne_routing::{PermissionLookup, SharedRules};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio_util::udp::UdpFramed;

use crate::peer_directory::PeerDirectory;

pub type Outbound = (Envelope, SocketAddr);
pub type FrameStream = SplitStream<UdpFramed<EnvelopeCodec>>;
pub type DatagramSink = SplitSink<UdpFramed<EnvelopeCodec>, Outbound>;

/// Bind the peer socket and split it into receive and send halves.
pub async fn bind(listen_addr: &str) -> anyhow::Result<(SocketAddr, FrameStream, DatagramSink)> {
    let socket = UdpSocket::bind(listen_addr).await?;
    let local = socket.local_addr()?;
    let (sink, stream) = UdpFramed::new(socket, EnvelopeCodec).split();
    tracing::info!(%local, "transport: listening");
    Ok((local, stream, sink))
}

/// Engine-facing send handle. Frames are stamped with this FNE's peer id and
/// queued for the send task.
#[derive(Clone)]
pub struct UdpSink {
    local_peer_id: PeerId,
    peers: PeerDirectory,
    tx: mpsc::Sender<Outbound>,
}

impl UdpSink {
    pub fn new(local_peer_id: PeerId, peers: PeerDirectory, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            local_peer_id,
            peers,
            tx,
        }
    }
}

impl FrameSink for UdpSink {
    fn send_to_peer(
        &self,
        peer_id: PeerId,
        frame: Bytes,
        seq: u16,
        stream_id: StreamId,
    ) -> Result<(), TransportError> {
        let addr = self
            .peers
            .addr_of(peer_id)
            .ok_or(TransportError::UnknownPeer(peer_id))?;
        let envelope = Envelope {
            peer_id: self.local_peer_id,
            stream_id,
            seq,
            payload: frame,
        };
        self.tx
            .try_send((envelope, addr))
            .map_err(|e| queue_error(peer_id, e))
    }

    /// Reserves queue slots for every frame before sending any of them.
    fn send_batch(
        &self,
        peer_id: PeerId,
        frames: Vec<(Bytes, u16)>,
        stream_id: StreamId,
    ) -> Result<(), TransportError> {
        if frames.is_empty() {
            return Ok(());
        }
        let addr = self
            .peers
            .addr_of(peer_id)
            .ok_or(TransportError::UnknownPeer(peer_id))?;
        let permits = self
            .tx
            .try_reserve_many(frames.len())
            .map_err(|e| queue_error(peer_id, e))?;
        for (permit, (payload, seq)) in permits.zip(frames) {
            let envelope = Envelope {
                peer_id: self.local_peer_id,
                stream_id,
                seq,
                payload,
            };
            permit.send((envelope, addr));
        }
        Ok(())
    }
}

fn queue_error<T>(peer_id: PeerId, e: mpsc::error::TrySendError<T>) -> TransportError {
    match e {
        mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(peer_id),
        mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
    }
}

/// Receive datagrams until shutdown, dispatching each frame to the engine.
pub async fn run_recv_loop(
    mut stream: FrameStream,
    core: Arc<FneCore>,
    peers: PeerDirectory,
    rules: SharedRules,
    trace_frames: bool,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            item = stream.next() => {
                match item {
                    Some(Ok((envelope, addr))) => {
                        handle_envelope(&core, &peers, &rules, envelope, addr, trace_frames);
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "transport: datagram dropped");
                    }
                    None => {
                        tracing::warn!("transport: socket closed");
                        break;
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("transport: recv loop shutting down");
                break;
            }
        }
    }
}

fn handle_envelope(
    core: &FneCore,
    peers: &PeerDirectory,
    rules: &SharedRules,
    envelope: Envelope,
    addr: SocketAddr,
    trace_frames: bool,
) {
    let snapshot = rules.current();
    // Only configured peers get a return address
    if snapshot.is_peer_enabled(envelope.peer_id)
        && peers
            .observe(envelope.peer_id, addr, core.clock().now())
            .is_conflict()
    {
        return;
    }
    if trace_frames {
        tracing::trace!(
            peer_id = envelope.peer_id,
            stream_id = envelope.stream_id,
            seq = envelope.seq,
            %addr,
            frame = %hex::encode(&envelope.payload),
            "transport: rx"
        );
    }

    let frame = InboundFrame {
        peer_id: envelope.peer_id,
        stream_id: envelope.stream_id,
        seq: envelope.seq,
        data: envelope.payload,
        external: snapshot.is_peer_link(envelope.peer_id),
    };
    if let DispatchOutcome::Forwarded { failed, .. } = core.dispatch(frame) {
        if failed > 0 {
            tracing::debug!(peer_id = envelope.peer_id, failed, "transport: targets not reachable");
        }
    }
}

/// Drain the outbound queue onto the socket until shutdown.
pub async fn run_send_loop(
    mut sink: DatagramSink,
    mut rx: mpsc::Receiver<Outbound>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            item = rx.recv() => {
                let Some((envelope, addr)) = item else { break };
                if let Err(e) = sink.send((envelope, addr)).await {
                    tracing::warn!(%addr, error = %e, "transport: send failed");
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("transport: send loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sink_with(depth: usize) -> (UdpSink, PeerDirectory, mpsc::Receiver<Outbound>) {
        let peers = PeerDirectory::new();
        let (tx, rx) = mpsc::channel(depth);
        (UdpSink::new(9000, peers.clone(), tx), peers, rx)
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let (sink, _, _rx) = sink_with(4);
        let err = sink
            .send_to_peer(5, Bytes::from_static(b"DMRD"), 0, 1)
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(5)));
    }

    #[test]
    fn test_send_stamps_local_peer_id() {
        let (sink, peers, mut rx) = sink_with(4);
        let addr: SocketAddr = "127.0.0.1:62031".parse().unwrap();
        peers.observe(5, addr, Instant::now());

        sink.send_to_peer(5, Bytes::from_static(b"P25D"), 7, 0xBEEF)
            .unwrap();
        let (envelope, to) = rx.try_recv().unwrap();
        assert_eq!(to, addr);
        assert_eq!(envelope.peer_id, 9000);
        assert_eq!(envelope.seq, 7);
        assert_eq!(envelope.stream_id, 0xBEEF);
        assert_eq!(&envelope.payload[..], b"P25D");
    }

    #[test]
    fn test_full_queue_reported() {
        let (sink, peers, _rx) = sink_with(1);
        peers.observe(5, "127.0.0.1:1".parse().unwrap(), Instant::now());
        sink.send_to_peer(5, Bytes::new(), 0, 1).unwrap();
        let err = sink.send_to_peer(5, Bytes::new(), 1, 1).unwrap_err();
        assert!(matches!(err, TransportError::QueueFull(5)));
    }

    #[test]
    fn test_batch_queued_whole_or_not_at_all() {
        let (sink, peers, mut rx) = sink_with(2);
        peers.observe(5, "127.0.0.1:1".parse().unwrap(), Instant::now());
        let frames = |n: u16| (0..n).map(|seq| (Bytes::from_static(b"P25D"), seq)).collect();

        let err = sink.send_batch(5, frames(3), 0xD).unwrap_err();
        assert!(matches!(err, TransportError::QueueFull(5)));
        assert!(rx.try_recv().is_err(), "nothing queued from a refused batch");

        sink.send_batch(5, frames(2), 0xD).unwrap();
        let seqs: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|(envelope, _)| envelope.seq)
            .collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn test_closed_queue_reported() {
        let (sink, peers, rx) = sink_with(1);
        peers.observe(5, "127.0.0.1:1".parse().unwrap(), Instant::now());
        drop(rx);
        let err = sink.send_to_peer(5, Bytes::new(), 0, 1).unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
