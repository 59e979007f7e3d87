//! Call routing through a live node: fan-out, patch rewrite, refusal.

use std::time::Duration;

use fne_protocol::dmr::{self, data_type, FLAG_DATA_SYNC, FLAG_VOICE_SYNC, OFFSET_DST};

use crate::harness::{TestNode, RULES};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(300);

fn dst_of(frame: &[u8]) -> u32 {
    u32::from_be_bytes([0, frame[OFFSET_DST], frame[OFFSET_DST + 1], frame[OFFSET_DST + 2]])
}

fn voice(peer_id: u32, dst: u32, stream_id: u32, seq: u8) -> bytes::Bytes {
    dmr::build_frame(seq, 3_110_001, dst, peer_id, 1, FLAG_VOICE_SYNC, stream_id, &[0x5A; 33]).freeze()
}

/// Group voice on a plain talkgroup reaches every other peer unchanged.
#[tokio::test]
async fn test_group_call_fans_out() {
    let node = TestNode::start(RULES).await.unwrap();
    let p1 = node.peer(1).await.unwrap();
    let p2 = node.peer(2).await.unwrap();
    let p3 = node.peer(3).await.unwrap();

    let frame = voice(1, 100, 0xA1, 0);
    p1.send(0xA1, 1, frame.clone()).await.unwrap();

    for peer in [&p2, &p3] {
        let env = peer.recv(WAIT).await.unwrap().expect("frame forwarded");
        assert_eq!(env.stream_id, 0xA1);
        assert_eq!(env.peer_id, crate::harness::FNE_PEER_ID);
        assert_eq!(env.payload, frame);
    }
    p1.expect_silence(QUIET).await.unwrap();

    let calls = node.api_post("/api/v1/calls").await.unwrap();
    assert_eq!(calls["total"], 1);
    assert_eq!(calls["calls"][0]["dst_id"], 100);
    assert_eq!(calls["calls"][0]["protocol"], "dmr");

    // Terminator ends the call
    let term = dmr::build_frame(1, 3_110_001, 100, 1, 1, FLAG_DATA_SYNC | data_type::TERMINATOR_WITH_LC, 0xA1, &[0; 33]);
    p1.send(0xA1, 2, term.freeze()).await.unwrap();
    assert!(p2.recv(WAIT).await.unwrap().is_some());
    node.wait_diagnostics(|d| d["sessions"]["dmr"] == 0, WAIT)
        .await
        .unwrap();

    node.shutdown().await;
}

/// A patched talkgroup is rewritten per target peer.
#[tokio::test]
async fn test_patch_rewrites_destination() {
    let node = TestNode::start(RULES).await.unwrap();
    let p1 = node.peer(1).await.unwrap();
    let p2 = node.peer(2).await.unwrap();
    let p3 = node.peer(3).await.unwrap();

    let frame = voice(1, 1, 0xB1, 0);
    p1.send(0xB1, 1, frame.clone()).await.unwrap();

    let mut to_p2: Vec<u32> = p2
        .recv_n(2, WAIT)
        .await
        .unwrap()
        .iter()
        .map(|e| dst_of(&e.payload))
        .collect();
    to_p2.sort_unstable();
    assert_eq!(to_p2, vec![2, 3]);

    let env = p3.recv(WAIT).await.unwrap().expect("canonical copy");
    assert_eq!(dst_of(&env.payload), 1);
    // Everything but the destination is untouched
    assert_eq!(env.payload[..OFFSET_DST], frame[..OFFSET_DST]);
    assert_eq!(env.payload[OFFSET_DST + 3..], frame[OFFSET_DST + 3..]);

    node.shutdown().await;
}

/// Frames from a peer missing from the rules never leave the node.
#[tokio::test]
async fn test_unknown_peer_refused() {
    let node = TestNode::start(RULES).await.unwrap();
    let p2 = node.peer(2).await.unwrap();
    let stranger = crate::harness::FakePeer::bind(77, node.udp_addr).await.unwrap();

    stranger.send(0xC1, 1, voice(77, 100, 0xC1, 0)).await.unwrap();
    p2.expect_silence(QUIET).await.unwrap();

    let diag = node
        .wait_diagnostics(|d| d["counters"]["dmr"]["dropped_unauthorized"] == 1, WAIT)
        .await
        .unwrap();
    assert_eq!(diag["counters"]["dmr"]["frames_forwarded"], 0);
    assert!(!node.running().peers.peer_ids().contains(&77));

    node.shutdown().await;
}

/// A second source claiming a live peer's id neither injects traffic nor
/// steals that peer's return path.
#[tokio::test]
async fn test_claimed_peer_id_ignored() {
    let node = TestNode::start(RULES).await.unwrap();
    let p1 = node.peer(1).await.unwrap();
    let p2 = node.peer(2).await.unwrap();
    let p3 = node.peer(3).await.unwrap();
    let impostor = crate::harness::FakePeer::bind(2, node.udp_addr).await.unwrap();

    impostor.send(0xC2, 1, voice(2, 100, 0xC2, 0)).await.unwrap();
    p3.expect_silence(QUIET).await.unwrap();

    p1.send(0xC3, 1, voice(1, 100, 0xC3, 0)).await.unwrap();
    let env = p2.recv(WAIT).await.unwrap().expect("real peer keeps its address");
    assert_eq!(env.stream_id, 0xC3);
    impostor.expect_silence(QUIET).await.unwrap();

    node.shutdown().await;
}

/// A repeated sequence number on the same stream is dropped as a duplicate.
#[tokio::test]
async fn test_duplicate_frame_suppressed() {
    let node = TestNode::start(RULES).await.unwrap();
    let p1 = node.peer(1).await.unwrap();
    let p2 = node.peer(2).await.unwrap();

    let frame = voice(1, 100, 0xD1, 0);
    p1.send(0xD1, 5, frame.clone()).await.unwrap();
    p1.send(0xD1, 5, frame).await.unwrap();

    assert!(p2.recv(WAIT).await.unwrap().is_some());
    p2.expect_silence(QUIET).await.unwrap();
    node.wait_diagnostics(|d| d["counters"]["dmr"]["dropped_duplicate"] == 1, WAIT)
        .await
        .unwrap();

    node.shutdown().await;
}

/// Idle calls are swept without an end marker.
#[tokio::test]
async fn test_idle_call_swept() {
    let node = TestNode::start_with(RULES, |cfg| cfg.calls.session_idle_ms = 150)
        .await
        .unwrap();
    let p1 = node.peer(1).await.unwrap();

    p1.send(0xE1, 1, voice(1, 100, 0xE1, 0)).await.unwrap();
    node.wait_diagnostics(|d| d["counters"]["dmr"]["sessions_expired"] == 1, WAIT)
        .await
        .unwrap();
    let status = node.api_post("/api/v1/status").await.unwrap();
    assert_eq!(status["active_calls"], 0);

    node.shutdown().await;
}

/// API routes refuse a wrong bearer token.
#[tokio::test]
async fn test_api_requires_token() {
    let node = TestNode::start(RULES).await.unwrap();
    let (status, _) = node.api_post_raw("/api/v1/status", "nope").await.unwrap();
    assert_eq!(status, 401);

    let rules = node.api_post("/api/v1/rules").await.unwrap();
    assert_eq!(rules["peers"].as_array().unwrap().len(), 3);
    let diag = node.api_post("/api/v1/diagnostics").await.unwrap();
    assert_eq!(diag["parrot"][0]["protocol"], "dmr");

    node.shutdown().await;
}
