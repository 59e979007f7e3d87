//! Datagram envelope codec for UDP peer links.
//!
//! Wire format: peer id (u32 BE) + stream id (u32 BE) + sequence (u16 BE)
//! followed by the raw protocol frame. One envelope per datagram.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{PeerId, ProtocolError, StreamId, MAX_DATAGRAM_BYTES};

/// Envelope header size in bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 10;

/// One frame as carried between the FNE and a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub peer_id: PeerId,
    pub stream_id: StreamId,
    pub seq: u16,
    pub payload: Bytes,
}

/// Codec for framing Envelope values over UDP datagrams.
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // UdpFramed hands us exactly one datagram; an empty buffer means nothing left
        if src.is_empty() {
            return Ok(None);
        }

        if src.len() > MAX_DATAGRAM_BYTES {
            let size = src.len();
            src.clear();
            return Err(ProtocolError::DatagramTooLarge {
                size,
                max: MAX_DATAGRAM_BYTES,
            });
        }

        if src.len() < ENVELOPE_HEADER_SIZE {
            let len = src.len();
            src.clear();
            return Err(ProtocolError::ShortEnvelope {
                len,
                min: ENVELOPE_HEADER_SIZE,
            });
        }

        let peer_id = src.get_u32();
        let stream_id = src.get_u32();
        let seq = src.get_u16();

        // Take the remainder of the datagram as the frame
        let payload = src.split().freeze();

        Ok(Some(Envelope {
            peer_id,
            stream_id,
            seq,
            payload,
        }))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total = ENVELOPE_HEADER_SIZE + item.payload.len();
        if total > MAX_DATAGRAM_BYTES {
            return Err(ProtocolError::DatagramTooLarge {
                size: total,
                max: MAX_DATAGRAM_BYTES,
            });
        }

        dst.reserve(total);
        dst.put_u32(item.peer_id);
        dst.put_u32(item.stream_id);
        dst.put_u16(item.seq);
        dst.extend_from_slice(&item.payload);

        Ok(())
    }
}
