//! FNE routing -- permission checks and talkgroup rewrite decisions.
//!
//! A [`RoutingEngine`] answers, for one frame, whether the source peer may
//! send it and which peers receive it under which destination and slot.
//! Decisions are pure: they read one rule snapshot and mutate nothing.

pub mod rules;

use std::sync::Arc;

use fne_protocol::{PeerId, SlotNo, TrafficClass};
use serde::Serialize;

pub use rules::{PeerRule, RewriteRule, RuleSet, SharedRules, TalkgroupRule};

/// Where a frame is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Destination {
    Group(u32),
    Unit(u32),
}

impl Destination {
    pub fn new(id: u32, group: bool) -> Self {
        if group {
            Destination::Group(id)
        } else {
            Destination::Unit(id)
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Destination::Group(id) | Destination::Unit(id) => *id,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Destination::Group(_))
    }
}

/// Direction of a routing decision relative to the FNE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Frame received from a peer. Peer-local talkgroups are first mapped
    /// back to their canonical id.
    Inbound,
    /// Frame originated by the FNE. The destination is already canonical.
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub peer_id: PeerId,
    pub destination: Destination,
    pub slot: SlotNo,
    pub class: TrafficClass,
    pub direction: Direction,
    /// Frame arrived over a peer link; never send it back out over one.
    pub external: bool,
}

/// One receiving peer and the addressing it expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    pub peer_id: PeerId,
    pub destination_id: u32,
    pub slot: SlotNo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    pub permitted: bool,
    /// Canonical destination after inbound normalisation.
    pub destination_id: u32,
    pub slot: SlotNo,
    pub targets: Vec<Target>,
}

impl RoutingDecision {
    fn denied(destination_id: u32, slot: SlotNo) -> Self {
        Self {
            permitted: false,
            destination_id,
            slot,
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid rules: {0}")]
    Invalid(String),
}

/// Read-only permission and rewrite data.
pub trait PermissionLookup: Send + Sync {
    fn is_authorized(&self, peer_id: PeerId, destination: Destination, class: TrafficClass) -> bool;

    /// Map a peer-local destination to its canonical form.
    fn canonical_target(
        &self,
        _peer_id: PeerId,
        destination: Destination,
        slot: SlotNo,
    ) -> (Destination, SlotNo) {
        (destination, slot)
    }

    /// Receiving peers for a canonical destination, with per-peer rewrites
    /// applied. Never includes `peer_id` itself.
    fn rewrite_target(&self, peer_id: PeerId, destination: Destination, slot: SlotNo) -> Vec<Target>;

    fn is_peer_link(&self, _peer_id: PeerId) -> bool {
        false
    }

    /// Peer is known and may send traffic at all.
    fn is_peer_enabled(&self, _peer_id: PeerId) -> bool {
        true
    }
}

/// Hands out the current rule snapshot.
pub trait RuleSource: Send + Sync {
    fn snapshot(&self) -> Arc<dyn PermissionLookup>;
}

impl<L: PermissionLookup + 'static> RuleSource for Arc<L> {
    fn snapshot(&self) -> Arc<dyn PermissionLookup> {
        self.clone()
    }
}

/// Stateless decision maker over a [`RuleSource`].
#[derive(Clone)]
pub struct RoutingEngine {
    source: Arc<dyn RuleSource>,
}

impl RoutingEngine {
    pub fn new(source: Arc<dyn RuleSource>) -> Self {
        Self { source }
    }

    /// Whether `peer_id` may use FNE services that bypass routing (parrot).
    pub fn admits(&self, peer_id: PeerId) -> bool {
        self.source.snapshot().is_peer_enabled(peer_id)
    }

    pub fn decide(&self, req: &RouteRequest) -> RoutingDecision {
        // One snapshot per decision; a concurrent reload cannot split it.
        let rules = self.source.snapshot();

        let (destination, slot) = match req.direction {
            Direction::Inbound => rules.canonical_target(req.peer_id, req.destination, req.slot),
            Direction::Outbound => (req.destination, req.slot),
        };

        if !rules.is_authorized(req.peer_id, destination, req.class) {
            tracing::debug!(
                peer_id = req.peer_id,
                dst_id = destination.id(),
                slot,
                class = req.class.as_str(),
                "routing: denied"
            );
            return RoutingDecision::denied(destination.id(), slot);
        }

        let mut targets = rules.rewrite_target(req.peer_id, destination, slot);
        targets.retain(|t| t.peer_id != req.peer_id);
        if req.external {
            targets.retain(|t| !rules.is_peer_link(t.peer_id));
        }

        RoutingDecision {
            permitted: true,
            destination_id: destination.id(),
            slot,
            targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RULES: &str = r#"
[[peers]]
id = 1
[[peers]]
id = 2
[[peers]]
id = 3
[[peers]]
id = 9
peer_link = true

[[talkgroups]]
id = 1
slot = 1

[[talkgroups.rewrite]]
peer_id = 2
talkgroup = 2
slot = 1

[[talkgroups.rewrite]]
peer_id = 2
talkgroup = 3
slot = 1

[[talkgroups]]
id = 50
slot = 2
exclusion = [3]
"#;

    fn engine() -> (RoutingEngine, SharedRules) {
        let shared = SharedRules::new(RuleSet::from_toml_str(RULES).unwrap());
        (RoutingEngine::new(Arc::new(shared.clone())), shared)
    }

    fn voice(peer_id: PeerId, tg: u32, slot: SlotNo) -> RouteRequest {
        RouteRequest {
            peer_id,
            destination: Destination::Group(tg),
            slot,
            class: TrafficClass::Voice,
            direction: Direction::Inbound,
            external: false,
        }
    }

    fn sorted(mut targets: Vec<Target>) -> Vec<(PeerId, u32, SlotNo)> {
        targets.sort_by_key(|t| (t.peer_id, t.destination_id, t.slot));
        targets
            .into_iter()
            .map(|t| (t.peer_id, t.destination_id, t.slot))
            .collect()
    }

    #[test]
    fn test_patch_one_to_two_and_three() {
        let (engine, _) = engine();
        let d = engine.decide(&voice(1, 1, 1));
        assert!(d.permitted);
        assert_eq!(d.destination_id, 1);
        assert_eq!(
            sorted(d.targets),
            vec![(2, 2, 1), (2, 3, 1), (3, 1, 1), (9, 1, 1)]
        );
    }

    #[test]
    fn test_inbound_patched_talkgroup_normalised() {
        let (engine, _) = engine();
        // Peer 2 keys up its local TG 3, which is canonical TG 1
        let d = engine.decide(&voice(2, 3, 1));
        assert!(d.permitted);
        assert_eq!(d.destination_id, 1);
        assert_eq!(sorted(d.targets), vec![(1, 1, 1), (3, 1, 1), (9, 1, 1)]);
    }

    #[test]
    fn test_outbound_skips_normalisation() {
        let (engine, _) = engine();
        let mut req = voice(2, 3, 1);
        req.direction = Direction::Outbound;
        // TG 3 has no rule of its own
        let d = engine.decide(&req);
        assert!(!d.permitted);
        assert_eq!(d.destination_id, 3);
    }

    #[test]
    fn test_denied_has_no_targets() {
        let (engine, _) = engine();
        let d = engine.decide(&voice(3, 50, 2));
        assert!(!d.permitted);
        assert!(d.targets.is_empty());

        let d = engine.decide(&voice(77, 1, 1));
        assert!(!d.permitted);
    }

    #[test]
    fn test_external_frames_not_sent_to_peer_links() {
        let (engine, _) = engine();
        let mut req = voice(1, 1, 1);
        req.external = true;
        let d = engine.decide(&req);
        assert!(d.targets.iter().all(|t| t.peer_id != 9));
        assert!(!d.targets.is_empty());
    }

    #[test]
    fn test_reload_visible_to_next_decision() {
        let (engine, shared) = engine();
        assert!(engine.decide(&voice(1, 1, 1)).permitted);

        let mut rules = (*shared.current()).clone();
        rules.talkgroups[0].active = false;
        shared.store(rules);

        assert!(!engine.decide(&voice(1, 1, 1)).permitted);
    }

    #[test]
    fn test_admits_enabled_peers_only() {
        let (engine, _) = engine();
        assert!(engine.admits(1));
        assert!(!engine.admits(77));
    }

    #[test]
    fn test_arc_lookup_is_a_rule_source() {
        let rules = Arc::new(RuleSet::from_toml_str(RULES).unwrap());
        let engine = RoutingEngine::new(Arc::new(rules));
        assert!(engine.decide(&voice(1, 50, 2)).permitted);
    }

    proptest! {
        #[test]
        fn decide_never_targets_source(
            peer in prop::sample::select(vec![1u32, 2, 3, 9, 42]),
            tg in prop::sample::select(vec![1u32, 2, 3, 50, 999]),
            slot in 0u8..=2,
            group in any::<bool>(),
            external in any::<bool>(),
        ) {
            let (engine, _) = engine();
            let req = RouteRequest {
                peer_id: peer,
                destination: Destination::new(tg, group),
                slot,
                class: TrafficClass::Voice,
                direction: Direction::Inbound,
                external,
            };
            let d = engine.decide(&req);
            prop_assert!(d.targets.iter().all(|t| t.peer_id != peer));
            if !d.permitted {
                prop_assert!(d.targets.is_empty());
            }
            if external {
                prop_assert!(d.targets.iter().all(|t| t.peer_id != 9));
            }
        }
    }
}
