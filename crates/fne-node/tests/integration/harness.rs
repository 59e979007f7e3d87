//! Test harness for in-process fne-node integration tests.
//!
//! Provides TestNode (a node on ephemeral UDP/TCP ports) and FakePeer (a
//! repeater simulated with a plain UDP socket speaking the envelope format).

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use fne_node::config::FneConfig;
use fne_node::node::{self, RunningNode};
use fne_protocol::{Envelope, EnvelopeCodec, PeerId, StreamId};
use fne_routing::{RuleSet, SharedRules};
use tokio::net::UdpSocket;
use tokio_util::codec::{Decoder, Encoder};

pub const FNE_PEER_ID: PeerId = 9_000_000;

/// Rule set shared by most tests: three repeaters, one plain talkgroup and
/// one patched talkgroup.
pub const RULES: &str = r#"
[[peers]]
id = 1
name = "alpha"

[[peers]]
id = 2
name = "bravo"

[[peers]]
id = 3
name = "charlie"

[[talkgroups]]
id = 100

[[talkgroups]]
id = 1

[[talkgroups.rewrite]]
peer_id = 2
talkgroup = 2

[[talkgroups.rewrite]]
peer_id = 2
talkgroup = 3
"#;

/// A running in-process node.
pub struct TestNode {
    pub udp_addr: SocketAddr,
    pub api_addr: SocketAddr,
    pub bearer_token: String,
    running: RunningNode,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn start(rules: &str) -> anyhow::Result<Self> {
        Self::start_with(rules, |_| {}).await
    }

    /// Start with a config tweak applied on top of the test defaults.
    pub async fn start_with(
        rules: &str,
        tweak: impl FnOnce(&mut FneConfig),
    ) -> anyhow::Result<Self> {
        let mut cfg = FneConfig::default();
        cfg.node.peer_id = FNE_PEER_ID;
        cfg.node.api_addr = "127.0.0.1:0".into();
        cfg.network.listen_addr = "127.0.0.1:0".into();
        cfg.calls.sweep_interval_ms = 50;
        cfg.parrot.playback_delay_ms = 200;
        cfg.parrot.frame_interval_ms = 10;
        tweak(&mut cfg);

        let rules = SharedRules::new(RuleSet::from_toml_str(rules)?);
        let bearer_token = "test-token".to_string();
        let running = node::start(&cfg, rules, bearer_token.clone()).await?;
        Ok(Self {
            udp_addr: running.udp_addr,
            api_addr: running.api_addr,
            bearer_token,
            running,
        })
    }

    pub fn running(&self) -> &RunningNode {
        &self.running
    }

    pub async fn shutdown(self) {
        self.running.shutdown().await;
    }

    /// Create a fake peer and register its address with the node.
    pub async fn peer(&self, peer_id: PeerId) -> anyhow::Result<FakePeer> {
        let peer = FakePeer::bind(peer_id, self.udp_addr).await?;
        peer.register().await?;
        self.wait_peers(|ids| ids.contains(&peer_id)).await?;
        Ok(peer)
    }

    async fn wait_peers(&self, ready: impl Fn(&[PeerId]) -> bool) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !ready(&self.running.peers.peer_ids()) {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for peer registration");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Poll the diagnostics route until `check` holds, or timeout.
    pub async fn wait_diagnostics(
        &self,
        check: impl Fn(&serde_json::Value) -> bool,
        timeout: Duration,
    ) -> anyhow::Result<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let diag = self.api_post("/api/v1/diagnostics").await?;
            if check(&diag) {
                return Ok(diag);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("timeout waiting for diagnostics condition. last: {}", diag);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Raw POST returning (status_code, body_json).
    pub async fn api_post_raw(
        &self,
        path: &str,
        token: &str,
    ) -> anyhow::Result<(u16, serde_json::Value)> {
        let url = format!("http://{}{}", self.api_addr, path);
        let resp = reqwest::Client::new()
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", token))
            .body("{}")
            .send()
            .await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let val: serde_json::Value =
            serde_json::from_str(&text).unwrap_or(serde_json::json!({"_raw": text}));
        Ok((status, val))
    }

    pub async fn api_post(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let (_, val) = self.api_post_raw(path, &self.bearer_token).await?;
        Ok(val)
    }
}

/// A repeater peer simulated over a plain UDP socket.
pub struct FakePeer {
    pub peer_id: PeerId,
    socket: UdpSocket,
    fne: SocketAddr,
}

#[allow(dead_code)]
impl FakePeer {
    pub async fn bind(peer_id: PeerId, fne: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        Ok(Self {
            peer_id,
            socket,
            fne,
        })
    }

    /// Header-only envelope: records our address, dropped by the engine.
    pub async fn register(&self) -> anyhow::Result<()> {
        self.send(0, 0, Bytes::new()).await
    }

    pub async fn send(&self, stream_id: StreamId, seq: u16, payload: Bytes) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        EnvelopeCodec.encode(
            Envelope {
                peer_id: self.peer_id,
                stream_id,
                seq,
                payload,
            },
            &mut buf,
        )?;
        self.socket.send_to(&buf, self.fne).await?;
        Ok(())
    }

    /// Next envelope from the node, or None after `timeout`.
    pub async fn recv(&self, timeout: Duration) -> anyhow::Result<Option<Envelope>> {
        let mut buf = vec![0u8; 2048];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Ok(result) => {
                let (len, _) = result?;
                let mut bytes = BytesMut::from(&buf[..len]);
                Ok(EnvelopeCodec.decode(&mut bytes)?)
            }
            Err(_) => Ok(None),
        }
    }

    /// Collect envelopes until `n` arrived or `timeout` passes without one.
    pub async fn recv_n(&self, n: usize, timeout: Duration) -> anyhow::Result<Vec<Envelope>> {
        let mut out = Vec::new();
        while out.len() < n {
            match self.recv(timeout).await? {
                Some(env) => out.push(env),
                None => break,
            }
        }
        Ok(out)
    }

    /// Assert nothing arrives within `window`.
    pub async fn expect_silence(&self, window: Duration) -> anyhow::Result<()> {
        if let Some(env) = self.recv(window).await? {
            anyhow::bail!("peer {} expected silence, got {:?}", self.peer_id, env);
        }
        Ok(())
    }
}
