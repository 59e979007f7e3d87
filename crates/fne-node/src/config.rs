//! Configuration types for fne-node.
//! Parsed from ~/.fne/config.toml.

use fne_calltrack::DispatcherConfig;
use fne_protocol::{CURRENT_TIMING, PARROT_TALKGROUP};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FneConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub calls: CallsSection,
    #[serde(default)]
    pub parrot: ParrotSection,
    #[serde(default)]
    pub rules: RulesSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Peer id this FNE presents on the wire.
    #[serde(default = "default_peer_id")]
    pub peer_id: u32,
    #[serde(default = "default_api_addr")]
    pub api_addr: String,
    #[serde(default = "default_token_path")]
    pub token_path: String,
    /// Hex-dump frames at trace level.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
    /// A peer's source address is held for this long after it was last heard.
    /// Zero lets any datagram move it.
    #[serde(default = "default_address_pin_secs")]
    pub address_pin_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsSection {
    #[serde(default = "default_session_idle_ms")]
    pub session_idle_ms: u64,
    #[serde(default = "default_pdu_max_age_ms")]
    pub pdu_max_age_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParrotSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_parrot_talkgroup")]
    pub talkgroup: u32,
    #[serde(default = "default_parrot_max_frames")]
    pub max_frames: usize,
    #[serde(default = "default_playback_delay_ms")]
    pub playback_delay_ms: u64,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    /// Play back to the peer that keyed up, or to every known peer.
    #[serde(default = "default_true")]
    pub originating_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RulesSection {
    pub path: Option<String>,
    /// 0 disables periodic reload.
    #[serde(default)]
    pub reload_interval_secs: u64,
}

fn default_peer_id() -> u32 {
    9_000_000
}
fn default_api_addr() -> String {
    "127.0.0.1:9480".into()
}
fn default_token_path() -> String {
    "~/.fne/api-token".into()
}
fn default_listen_addr() -> String {
    "0.0.0.0:62031".into()
}
fn default_send_queue() -> usize {
    CURRENT_TIMING.send_queue_depth
}
fn default_address_pin_secs() -> u64 {
    30
}
fn default_session_idle_ms() -> u64 {
    CURRENT_TIMING.session_idle_ms
}
fn default_pdu_max_age_ms() -> u64 {
    CURRENT_TIMING.pdu_max_age_ms
}
fn default_sweep_interval_ms() -> u64 {
    CURRENT_TIMING.sweep_interval_ms
}
fn default_true() -> bool {
    true
}
fn default_parrot_talkgroup() -> u32 {
    PARROT_TALKGROUP
}
fn default_parrot_max_frames() -> usize {
    CURRENT_TIMING.parrot_max_frames
}
fn default_playback_delay_ms() -> u64 {
    CURRENT_TIMING.parrot_playback_delay_ms
}
fn default_frame_interval_ms() -> u64 {
    CURRENT_TIMING.parrot_frame_interval_ms
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            api_addr: default_api_addr(),
            token_path: default_token_path(),
            debug: false,
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            send_queue: default_send_queue(),
            address_pin_secs: default_address_pin_secs(),
        }
    }
}

impl Default for CallsSection {
    fn default() -> Self {
        Self {
            session_idle_ms: default_session_idle_ms(),
            pdu_max_age_ms: default_pdu_max_age_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl Default for ParrotSection {
    fn default() -> Self {
        Self {
            enabled: true,
            talkgroup: default_parrot_talkgroup(),
            max_frames: default_parrot_max_frames(),
            playback_delay_ms: default_playback_delay_ms(),
            frame_interval_ms: default_frame_interval_ms(),
            originating_only: true,
        }
    }
}

impl FneConfig {
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: FneConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Engine settings derived from the [calls] and [parrot] sections.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            session_idle: Duration::from_millis(self.calls.session_idle_ms),
            pdu_max_age: Duration::from_millis(self.calls.pdu_max_age_ms),
            parrot_talkgroup: self.parrot.enabled.then_some(self.parrot.talkgroup),
            parrot_max_frames: self.parrot.max_frames,
            retired_stream_memory: CURRENT_TIMING.retired_stream_memory,
            trace_frames: self.node.debug,
        }
    }

    pub fn address_pin(&self) -> Duration {
        Duration::from_secs(self.network.address_pin_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.calls.sweep_interval_ms.max(1))
    }
}
