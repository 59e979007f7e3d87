//! Outbound send contract. Delivery is fire-and-forget from the engine's side.

use bytes::Bytes;
use fne_protocol::{PeerId, StreamId};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("send queue full (peer {0})")]
    QueueFull(PeerId),
    #[error("transport closed")]
    Closed,
}

pub trait FrameSink: Send + Sync {
    fn send_to_peer(
        &self,
        peer_id: PeerId,
        frame: Bytes,
        seq: u16,
        stream_id: StreamId,
    ) -> Result<(), TransportError>;

    /// Hand over `frames` (with their sequence numbers) for one peer as a unit.
    /// Sinks that can fail partway must queue all of them or none.
    fn send_batch(
        &self,
        peer_id: PeerId,
        frames: Vec<(Bytes, u16)>,
        stream_id: StreamId,
    ) -> Result<(), TransportError> {
        for (frame, seq) in frames {
            self.send_to_peer(peer_id, frame, seq, stream_id)?;
        }
        Ok(())
    }
}
