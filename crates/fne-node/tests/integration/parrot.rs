//! Parrot playback through a live node.

use std::time::Duration;

use fne_protocol::dmr::{self, data_type, FLAG_DATA_SYNC, FLAG_VOICE_SYNC};
use fne_protocol::PARROT_TALKGROUP;

use crate::harness::{TestNode, RULES};

fn parrot_frame(peer_id: u32, seq: u8, flags: u8) -> bytes::Bytes {
    dmr::build_frame(seq, 3_110_001, PARROT_TALKGROUP, peer_id, 1, flags, 0xF1, &[seq; 33]).freeze()
}

async fn key_up(peer: &crate::harness::FakePeer, frames: u8) {
    for seq in 0..frames {
        peer.send(0xF1, seq as u16, parrot_frame(peer.peer_id, seq, FLAG_VOICE_SYNC))
            .await
            .unwrap();
    }
    let term = parrot_frame(peer.peer_id, frames, FLAG_DATA_SYNC | data_type::TERMINATOR_WITH_LC);
    peer.send(0xF1, frames as u16, term).await.unwrap();
}

/// A transmission on the parrot talkgroup is echoed back to its sender, in
/// order, after the playback delay.
#[tokio::test]
async fn test_parrot_echoes_to_originator() {
    let node = TestNode::start(RULES).await.unwrap();
    let p1 = node.peer(1).await.unwrap();
    let p2 = node.peer(2).await.unwrap();

    key_up(&p1, 3).await;
    // Nothing is relayed live
    p2.expect_silence(Duration::from_millis(100)).await.unwrap();

    let echoed = p1.recv_n(4, Duration::from_secs(2)).await.unwrap();
    assert_eq!(
        echoed.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    assert!(echoed.iter().all(|e| e.stream_id == 0xF1));
    assert_eq!(echoed[1].payload, parrot_frame(1, 1, FLAG_VOICE_SYNC));
    p2.expect_silence(Duration::from_millis(200)).await.unwrap();

    let diag = node
        .wait_diagnostics(|d| d["parrot"][0]["frames"] == 0, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(diag["counters"]["dmr"]["parrot_captured"], 4);

    node.shutdown().await;
}

/// With originating_only off, every registered peer hears the playback.
#[tokio::test]
async fn test_parrot_broadcast_playback() {
    let node = TestNode::start_with(RULES, |cfg| cfg.parrot.originating_only = false)
        .await
        .unwrap();
    let p1 = node.peer(1).await.unwrap();
    let p2 = node.peer(2).await.unwrap();

    key_up(&p1, 1).await;
    for peer in [&p1, &p2] {
        let frames = peer.recv_n(2, Duration::from_secs(2)).await.unwrap();
        assert_eq!(frames.len(), 2);
    }

    node.shutdown().await;
}

/// Disabling the parrot routes its talkgroup like any other: with no rule
/// for it, the traffic is refused.
#[tokio::test]
async fn test_parrot_disabled() {
    let node = TestNode::start_with(RULES, |cfg| cfg.parrot.enabled = false)
        .await
        .unwrap();
    let p1 = node.peer(1).await.unwrap();

    key_up(&p1, 2).await;
    p1.expect_silence(Duration::from_millis(500)).await.unwrap();
    node.wait_diagnostics(
        |d| d["counters"]["dmr"]["dropped_unauthorized"].as_u64() >= Some(1),
        Duration::from_secs(1),
    )
    .await
    .unwrap();

    node.shutdown().await;
}
