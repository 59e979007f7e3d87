//! Rule set -- peer permissions and talkgroup rewrites loaded from TOML.
//!
//! The rule set is an immutable snapshot. [`SharedRules`] publishes the
//! current snapshot to concurrent readers and swaps in a new one on reload;
//! a decision that already loaded a snapshot keeps using it.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use fne_protocol::{PeerId, SlotNo, TrafficClass};
use serde::{Deserialize, Serialize};

use crate::{Destination, PermissionLookup, RuleError, RuleSource, Target};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub peers: Vec<PeerRule>,
    #[serde(default)]
    pub talkgroups: Vec<TalkgroupRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRule {
    pub id: PeerId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Link to another FNE rather than a repeater.
    #[serde(default)]
    pub peer_link: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TalkgroupRule {
    pub id: u32,
    #[serde(default = "default_slot")]
    pub slot: SlotNo,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Affiliation is tracked outside this rule set; accepted for compatibility.
    #[serde(default)]
    pub affiliated_only: bool,
    #[serde(default = "default_true")]
    pub allow_data: bool,
    /// Peers allowed on this talkgroup. Empty: all peers.
    #[serde(default)]
    pub inclusion: Vec<PeerId>,
    #[serde(default)]
    pub exclusion: Vec<PeerId>,
    /// Per-peer patches from this (canonical) talkgroup to the peer's local ones.
    #[serde(default)]
    pub rewrite: Vec<RewriteRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub peer_id: PeerId,
    pub talkgroup: u32,
    #[serde(default = "default_slot")]
    pub slot: SlotNo,
}

fn default_true() -> bool {
    true
}
fn default_slot() -> SlotNo {
    1
}

/// Slot 0 means the protocol has no slots and matches any rule slot.
fn slot_matches(rule_slot: SlotNo, slot: SlotNo) -> bool {
    slot == 0 || rule_slot == slot
}

impl TalkgroupRule {
    pub fn permits(&self, peer_id: PeerId) -> bool {
        if self.exclusion.contains(&peer_id) {
            return false;
        }
        self.inclusion.is_empty() || self.inclusion.contains(&peer_id)
    }
}

impl RuleSet {
    /// Parse and validate a rule set.
    pub fn from_toml_str(content: &str) -> Result<Self, RuleError> {
        let rules: RuleSet = toml::from_str(content)?;
        rules.validate()?;
        Ok(rules)
    }

    /// Load and validate a rule set from a TOML file.
    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Reject duplicate peers/talkgroups and rewrites naming unknown peers.
    pub fn validate(&self) -> Result<(), RuleError> {
        let mut peer_ids = HashSet::new();
        for peer in &self.peers {
            if !peer_ids.insert(peer.id) {
                return Err(RuleError::Invalid(format!("duplicate peer {}", peer.id)));
            }
        }

        let mut tg_keys = HashSet::new();
        for tg in &self.talkgroups {
            if !tg_keys.insert((tg.id, tg.slot)) {
                return Err(RuleError::Invalid(format!(
                    "duplicate talkgroup {} slot {}",
                    tg.id, tg.slot
                )));
            }
            for rw in &tg.rewrite {
                if !peer_ids.contains(&rw.peer_id) {
                    return Err(RuleError::Invalid(format!(
                        "talkgroup {} rewrites for unknown peer {}",
                        tg.id, rw.peer_id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn peer(&self, peer_id: PeerId) -> Option<&PeerRule> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    /// Talkgroup rule for (id, slot).
    pub fn talkgroup(&self, id: u32, slot: SlotNo) -> Option<&TalkgroupRule> {
        self.talkgroups
            .iter()
            .find(|t| t.id == id && slot_matches(t.slot, slot))
    }
}

impl PermissionLookup for RuleSet {
    fn is_authorized(&self, peer_id: PeerId, destination: Destination, class: TrafficClass) -> bool {
        if !self.is_peer_enabled(peer_id) {
            return false;
        }
        match destination {
            Destination::Unit(_) => true,
            Destination::Group(tg) => self.talkgroups.iter().any(|t| {
                t.id == tg
                    && t.active
                    && t.permits(peer_id)
                    && (class != TrafficClass::Data || t.allow_data)
            }),
        }
    }

    fn canonical_target(
        &self,
        peer_id: PeerId,
        destination: Destination,
        slot: SlotNo,
    ) -> (Destination, SlotNo) {
        let Destination::Group(local) = destination else {
            return (destination, slot);
        };
        for tg in &self.talkgroups {
            let patched = tg.rewrite.iter().any(|rw| {
                rw.peer_id == peer_id && rw.talkgroup == local && slot_matches(rw.slot, slot)
            });
            if patched {
                let slot = if slot == 0 { 0 } else { tg.slot };
                return (Destination::Group(tg.id), slot);
            }
        }
        (destination, slot)
    }

    fn rewrite_target(&self, peer_id: PeerId, destination: Destination, slot: SlotNo) -> Vec<Target> {
        let receivers = self
            .peers
            .iter()
            .filter(|p| p.enabled && p.id != peer_id);

        match destination {
            Destination::Unit(dst) => receivers
                .map(|p| Target {
                    peer_id: p.id,
                    destination_id: dst,
                    slot,
                })
                .collect(),
            Destination::Group(tg_id) => {
                let Some(tg) = self.talkgroup(tg_id, slot) else {
                    return Vec::new();
                };
                let mut targets = Vec::new();
                for peer in receivers.filter(|p| tg.permits(p.id)) {
                    let before = targets.len();
                    for rw in tg.rewrite.iter().filter(|rw| rw.peer_id == peer.id) {
                        targets.push(Target {
                            peer_id: peer.id,
                            destination_id: rw.talkgroup,
                            slot: if slot == 0 { 0 } else { rw.slot },
                        });
                    }
                    if targets.len() == before {
                        targets.push(Target {
                            peer_id: peer.id,
                            destination_id: tg_id,
                            slot,
                        });
                    }
                }
                targets
            }
        }
    }

    fn is_peer_link(&self, peer_id: PeerId) -> bool {
        self.peer(peer_id).is_some_and(|p| p.peer_link)
    }

    fn is_peer_enabled(&self, peer_id: PeerId) -> bool {
        self.peer(peer_id).is_some_and(|p| p.enabled)
    }
}

/// Shared, atomically swappable rule snapshot.
#[derive(Clone)]
pub struct SharedRules {
    inner: Arc<ArcSwap<RuleSet>>,
}

impl SharedRules {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(rules)),
        }
    }

    /// Current snapshot.
    pub fn current(&self) -> Arc<RuleSet> {
        self.inner.load_full()
    }

    /// Publish a new snapshot.
    pub fn store(&self, rules: RuleSet) {
        self.inner.store(Arc::new(rules));
    }

    /// Reload from file. Returns true if the snapshot changed.
    /// On error the current snapshot stays in place.
    pub fn reload(&self, path: &Path) -> Result<bool, RuleError> {
        let rules = RuleSet::load(path)?;
        if *self.inner.load_full() == rules {
            return Ok(false);
        }
        tracing::info!(
            path = %path.display(),
            peers = rules.peers.len(),
            talkgroups = rules.talkgroups.len(),
            "rules: snapshot replaced"
        );
        self.store(rules);
        Ok(true)
    }
}

impl RuleSource for SharedRules {
    fn snapshot(&self) -> Arc<dyn PermissionLookup> {
        self.inner.load_full()
    }
}
