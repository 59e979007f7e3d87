//! P25 data: multi-block PDU reassembly and re-dispatch through a live node.

use std::time::Duration;

use fne_protocol::p25::{self, duid, PduHeader, SAP_EXTENDED_ADDRESS};

use crate::harness::{TestNode, RULES};

const LLID: u32 = 0x00_2233;

fn block(index: u8, data: &[u8]) -> bytes::Bytes {
    p25::build_frame(duid::PDU, 0, 5001, LLID, index, data).freeze()
}

/// Blocks arriving out of order are reassembled and re-sent to each other
/// peer as a fresh header plus blocks in order.
#[tokio::test]
async fn test_pdu_reassembled_and_redispatched() {
    let node = TestNode::start(RULES).await.unwrap();
    let p1 = node.peer(1).await.unwrap();
    let p2 = node.peer(2).await.unwrap();

    let header = p25::build_pdu_header_frame(5001, LLID, SAP_EXTENDED_ADDRESS, 3).freeze();
    p1.send(0x51, 0, header).await.unwrap();
    p1.send(0x51, 1, block(3, b"CCCCCCCCCCCC")).await.unwrap();
    p1.send(0x51, 2, block(1, b"AAAAAAAAAAAA")).await.unwrap();
    // Partial PDUs are never forwarded
    p2.expect_silence(Duration::from_millis(200)).await.unwrap();

    p1.send(0x51, 3, block(2, b"BBBBBBBBBBBB")).await.unwrap();
    let frames = p2.recv_n(4, Duration::from_secs(2)).await.unwrap();
    assert_eq!(frames.len(), 4);
    assert_eq!(frames.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

    let rebuilt = PduHeader::decode(&frames[0].payload[p25::OFFSET_DATA..]).unwrap();
    assert_eq!(rebuilt.llid, LLID);
    assert_eq!(rebuilt.blocks_to_follow, 3);
    assert_eq!(&frames[1].payload[p25::OFFSET_DATA..], b"AAAAAAAAAAAA");
    assert_eq!(&frames[2].payload[p25::OFFSET_DATA..], b"BBBBBBBBBBBB");
    assert_eq!(&frames[3].payload[p25::OFFSET_DATA..], b"CCCCCCCCCCCC");

    let diag = node
        .wait_diagnostics(|d| d["counters"]["p25"]["pdus_completed"] == 1, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(diag["counters"]["pending_pdus"], 0);

    node.shutdown().await;
}

/// A PDU that never completes is discarded by the sweep.
#[tokio::test]
async fn test_incomplete_pdu_expires() {
    let node = TestNode::start_with(RULES, |cfg| cfg.calls.pdu_max_age_ms = 150)
        .await
        .unwrap();
    let p1 = node.peer(1).await.unwrap();
    let p2 = node.peer(2).await.unwrap();

    let header = p25::build_pdu_header_frame(5001, LLID, 0, 2).freeze();
    p1.send(0x52, 0, header).await.unwrap();
    p1.send(0x52, 1, block(1, b"AAAAAAAAAAAA")).await.unwrap();

    node.wait_diagnostics(|d| d["counters"]["p25"]["pdus_expired"] == 1, Duration::from_secs(2))
        .await
        .unwrap();
    p2.expect_silence(Duration::from_millis(100)).await.unwrap();

    node.shutdown().await;
}

/// A header declaring more blocks than the protocol allows is refused
/// outright and leaves no pending state.
#[tokio::test]
async fn test_oversized_pdu_refused() {
    let node = TestNode::start(RULES).await.unwrap();
    let p1 = node.peer(1).await.unwrap();

    let header = p25::build_pdu_header_frame(5001, LLID, 0, 40).freeze();
    p1.send(0x53, 0, header).await.unwrap();

    let diag = node
        .wait_diagnostics(|d| d["counters"]["p25"]["dropped_pdu"] == 1, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(diag["counters"]["pending_pdus"], 0);
    assert_eq!(diag["sessions"]["p25"], 0);

    node.shutdown().await;
}
