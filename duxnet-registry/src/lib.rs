//! C3 — Node Registry and C4 — Reputation Engine.
//!
//! An in-memory map keyed by node_id, guarded by a single `RwLock` and
//! mirrored to durable storage by the caller. A secondary capability
//! index maps capability name to the set of node_ids advertising it;
//! every mutation keeps both maps consistent under the same write lock.

use duxnet_core::{now, DuxError, DuxResult, NodeId, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Unknown,
    Online,
    Offline,
    Busy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub network_address: String,
    pub capabilities: HashSet<String>,
    pub status: NodeStatus,
    pub reputation: f64,
    pub last_heartbeat: Timestamp,
    pub metadata: serde_json::Value,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityMatch {
    All,
    Any,
}

/// Typed reputation events and their rule-table deltas (§4.10). A
/// caller may override the delta for a single application via
/// `apply_event_with_delta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationEvent {
    TaskSuccess,
    TaskFailure,
    TaskTimeout,
    MaliciousBehavior,
    HealthMilestone,
    UptimeMilestone,
    CommunityContribution,
}

impl ReputationEvent {
    pub fn default_delta(self) -> f64 {
        match self {
            ReputationEvent::TaskSuccess => 10.0,
            ReputationEvent::TaskFailure => -5.0,
            ReputationEvent::TaskTimeout => -10.0,
            ReputationEvent::MaliciousBehavior => -50.0,
            ReputationEvent::HealthMilestone => 2.0,
            ReputationEvent::UptimeMilestone => 5.0,
            ReputationEvent::CommunityContribution => 15.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReputationChange {
    pub old: f64,
    pub new: f64,
    pub delta: f64,
    pub clamped: bool,
}

fn validate_capability(cap: &str) -> DuxResult<()> {
    if !cap.is_empty() && cap.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        Ok(())
    } else {
        Err(DuxError::validation(format!("invalid capability name: {cap}")))
    }
}

struct RegistryState {
    nodes: HashMap<NodeId, Node>,
    capability_index: HashMap<String, HashSet<NodeId>>,
}

/// The registry's sole piece of process-wide mutable state (§5): one
/// `RwLock` guarding both the node map and its capability index, kept
/// consistent under every write.
pub struct NodeRegistry {
    state: RwLock<RegistryState>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                nodes: HashMap::new(),
                capability_index: HashMap::new(),
            }),
        }
    }

    pub fn register(
        &self,
        network_address: String,
        capabilities: HashSet<String>,
        metadata: serde_json::Value,
    ) -> DuxResult<Node> {
        for cap in &capabilities {
            validate_capability(cap)?;
        }
        let node = Node {
            node_id: uuid::Uuid::new_v4(),
            network_address,
            capabilities: capabilities.clone(),
            status: NodeStatus::Unknown,
            reputation: 50.0,
            last_heartbeat: now(),
            metadata,
            deleted: false,
        };

        let mut state = self.state.write();
        for cap in &capabilities {
            state.capability_index.entry(cap.clone()).or_default().insert(node.node_id);
        }
        state.nodes.insert(node.node_id, node.clone());
        info!(node_id = %node.node_id, "registered node");
        Ok(node)
    }

    pub fn deregister(&self, node_id: NodeId) -> DuxResult<()> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| DuxError::validation("unknown node_id"))?;
        node.deleted = true;
        let caps = node.capabilities.clone();
        for cap in caps {
            if let Some(set) = state.capability_index.get_mut(&cap) {
                set.remove(&node_id);
            }
        }
        Ok(())
    }

    pub fn get(&self, node_id: NodeId) -> Option<Node> {
        self.state
            .read()
            .nodes
            .get(&node_id)
            .filter(|n| !n.deleted)
            .cloned()
    }

    pub fn set_status(&self, node_id: NodeId, status: NodeStatus) -> DuxResult<()> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| DuxError::validation("unknown node_id"))?;
        node.status = status;
        node.last_heartbeat = now();
        Ok(())
    }

    pub fn heartbeat(&self, node_id: NodeId) -> DuxResult<()> {
        self.set_status(node_id, NodeStatus::Online)
    }

    /// Adds a capability to a node, keeping the secondary index
    /// consistent under the same write lock.
    pub fn add_capability(&self, node_id: NodeId, capability: &str) -> DuxResult<()> {
        validate_capability(capability)?;
        let mut state = self.state.write();
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| DuxError::validation("unknown node_id"))?;
        node.capabilities.insert(capability.to_string());
        state
            .capability_index
            .entry(capability.to_string())
            .or_default()
            .insert(node_id);
        Ok(())
    }

    pub fn remove_capability(&self, node_id: NodeId, capability: &str) -> DuxResult<()> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| DuxError::validation("unknown node_id"))?;
        node.capabilities.remove(capability);
        if let Some(set) = state.capability_index.get_mut(capability) {
            set.remove(&node_id);
        }
        Ok(())
    }

    /// Lists active (non-deleted) nodes matching `capabilities` under
    /// `mode`: `All` intersects, `Any` unions.
    pub fn list_by_capabilities(&self, capabilities: &[&str], mode: CapabilityMatch) -> Vec<Node> {
        let state = self.state.read();
        if capabilities.is_empty() {
            return state.nodes.values().filter(|n| !n.deleted).cloned().collect();
        }

        let mut sets = capabilities
            .iter()
            .map(|c| state.capability_index.get(*c).cloned().unwrap_or_default());

        let ids: HashSet<NodeId> = match mode {
            CapabilityMatch::Any => sets.fold(HashSet::new(), |mut acc, s| {
                acc.extend(s);
                acc
            }),
            CapabilityMatch::All => {
                let first = sets.next().unwrap_or_default();
                sets.fold(first, |acc, s| acc.intersection(&s).copied().collect())
            }
        };

        ids.into_iter()
            .filter_map(|id| state.nodes.get(&id))
            .filter(|n| !n.deleted)
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<Node> {
        self.state.read().nodes.values().filter(|n| !n.deleted).cloned().collect()
    }

    /// Applies a reputation event's default delta, clamping to [0,100].
    pub fn apply_event(&self, node_id: NodeId, event: ReputationEvent) -> DuxResult<ReputationChange> {
        self.apply_event_with_delta(node_id, event.default_delta())
    }

    pub fn apply_event_with_delta(&self, node_id: NodeId, delta: f64) -> DuxResult<ReputationChange> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .get_mut(&node_id)
            .ok_or_else(|| DuxError::validation("unknown node_id"))?;
        let old = node.reputation;
        let raw_new = old + delta;
        let new = raw_new.clamp(0.0, 100.0);
        let clamped = (new - raw_new).abs() > f64::EPSILON;
        node.reputation = new;
        Ok(ReputationChange {
            old,
            new,
            delta,
            clamped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as HS;

    fn caps(names: &[&str]) -> HS<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn capability_index_stays_consistent() {
        let registry = NodeRegistry::new();
        let node = registry
            .register("127.0.0.1:9000".into(), caps(&["img_v1"]), serde_json::json!({}))
            .unwrap();

        let found = registry.list_by_capabilities(&["img_v1"], CapabilityMatch::All);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].node_id, node.node_id);

        registry.remove_capability(node.node_id, "img_v1").unwrap();
        let found = registry.list_by_capabilities(&["img_v1"], CapabilityMatch::All);
        assert!(found.is_empty());
    }

    #[test]
    fn match_all_intersects_match_any_unions() {
        let registry = NodeRegistry::new();
        let n1 = registry
            .register("a".into(), caps(&["x", "y"]), serde_json::json!({}))
            .unwrap();
        let n2 = registry.register("b".into(), caps(&["y"]), serde_json::json!({})).unwrap();

        let all = registry.list_by_capabilities(&["x", "y"], CapabilityMatch::All);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].node_id, n1.node_id);

        let mut any = registry.list_by_capabilities(&["x", "y"], CapabilityMatch::Any);
        any.sort_by_key(|n| n.node_id);
        let mut expected = vec![n1.node_id, n2.node_id];
        expected.sort();
        let mut got: Vec<_> = any.iter().map(|n| n.node_id).collect();
        got.sort();
        assert_eq!(got, expected);
    }

    #[test]
    fn reputation_clamps_at_upper_bound() {
        let registry = NodeRegistry::new();
        let node = registry.register("a".into(), caps(&[]), serde_json::json!({})).unwrap();
        registry.apply_event_with_delta(node.node_id, 45.0).unwrap(); // 50 -> 95
        let change = registry.apply_event(node.node_id, ReputationEvent::TaskSuccess).unwrap();
        assert_eq!(change.new, 100.0);
        assert!(change.clamped);
    }

    #[test]
    fn reputation_clamps_at_lower_bound() {
        let registry = NodeRegistry::new();
        let node = registry.register("a".into(), caps(&[]), serde_json::json!({})).unwrap();
        registry.apply_event_with_delta(node.node_id, -45.0).unwrap(); // 50 -> 5
        let change = registry.apply_event(node.node_id, ReputationEvent::TaskFailure).unwrap();
        assert_eq!(change.new, 0.0);
        assert!(change.clamped);
    }

    #[test]
    fn malicious_behavior_from_ten_clamps_to_zero() {
        let registry = NodeRegistry::new();
        let node = registry.register("a".into(), caps(&[]), serde_json::json!({})).unwrap();
        registry.apply_event_with_delta(node.node_id, -40.0).unwrap(); // 50 -> 10
        let change = registry
            .apply_event(node.node_id, ReputationEvent::MaliciousBehavior)
            .unwrap();
        assert_eq!(change.new, 0.0);
        assert!(change.clamped);
    }

    #[test]
    fn deregistered_node_is_excluded_from_listings() {
        let registry = NodeRegistry::new();
        let node = registry.register("a".into(), caps(&["x"]), serde_json::json!({})).unwrap();
        registry.deregister(node.node_id).unwrap();
        assert!(registry.get(node.node_id).is_none());
        assert!(registry.list_by_capabilities(&["x"], CapabilityMatch::Any).is_empty());
    }
}
