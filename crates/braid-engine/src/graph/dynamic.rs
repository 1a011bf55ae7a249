use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use braid_core::config::EngineConfig;
use braid_core::error::Result;
use braid_core::traits::NodeWork;

use super::edge::{forward_adjacency, is_reachable, Edge, EdgeMap};
use super::executor::GraphExecutor;
use super::node::GraphNode;

/// Structural rule a mutation must not break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invariant {
    /// A new node id must not already exist.
    NodeUnique,
    /// A referenced node must exist.
    NodeExists,
    /// A node with dependents cannot be removed.
    NoDependents,
    /// An edge must not close a cycle.
    NoCycle,
    /// A removed edge must exist.
    EdgeExists,
    /// An added edge must not already exist.
    EdgeUnique,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: Invariant,
    pub reason: String,
}

impl InvariantViolation {
    fn new(invariant: Invariant, reason: impl Into<String>) -> Self {
        Self {
            invariant,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    AddNode,
    RemoveNode,
    ReplaceNode,
    AddEdge,
    RemoveEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Applied,
    Rejected,
}

/// Audit record of one mutation attempt. Never edited once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Who asked for the change (user, tool call, supervisor, ...).
    pub actor: String,
    pub kind: MutationKind,
    pub payload: serde_json::Value,
    pub status: MutationStatus,
    /// Empty when applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<InvariantViolation>,
}

/// Result of a mutation call. Rejection is an ordinary outcome, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub success: bool,
    pub mutation_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<InvariantViolation>,
}

/// A DAG that accepts structural edits under explicit invariants.
///
/// Every attempt, applied or rejected, is appended to the mutation log.
/// Callers editing from several tasks must serialize their own calls.
#[derive(Default)]
pub struct DynamicAgentGraph {
    nodes: HashMap<String, GraphNode>,
    /// Insertion order of live nodes.
    order: Vec<String>,
    edges: EdgeMap,
    log: Vec<MutationEntry>,
}

impl DynamicAgentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: GraphNode, actor: &str) -> MutationOutcome {
        let payload = json!({
            "node_id": node.id,
            "work": node.work.name(),
            "priority": node.priority,
        });
        let mut violations = Vec::new();
        if self.nodes.contains_key(&node.id) {
            violations.push(InvariantViolation::new(
                Invariant::NodeUnique,
                format!("node '{}' already exists", node.id),
            ));
        }

        if violations.is_empty() {
            self.order.push(node.id.clone());
            self.nodes.insert(node.id.clone(), node);
        }
        self.record(MutationKind::AddNode, actor, payload, violations)
    }

    /// Remove a node and its incoming edges. Rejected while any node depends on it.
    pub fn remove_node(&mut self, node_id: &str, actor: &str) -> MutationOutcome {
        let payload = json!({ "node_id": node_id });
        let mut violations = Vec::new();
        if !self.nodes.contains_key(node_id) {
            violations.push(self.missing(node_id));
        } else {
            let dependents = self.dependents(node_id);
            if !dependents.is_empty() {
                violations.push(InvariantViolation::new(
                    Invariant::NoDependents,
                    format!("node '{}' is a dependency of {}", node_id, dependents.join(", ")),
                ));
            }
        }

        if violations.is_empty() {
            self.nodes.remove(node_id);
            self.order.retain(|id| id != node_id);
            self.edges.remove(node_id);
        }
        self.record(MutationKind::RemoveNode, actor, payload, violations)
    }

    /// Swap the work bound to a node. Edges and priority are kept.
    pub fn replace_node(&mut self, node_id: &str, work: Arc<dyn NodeWork>, actor: &str) -> MutationOutcome {
        let payload = json!({ "node_id": node_id, "work": work.name() });
        let mut violations = Vec::new();
        match self.nodes.get_mut(node_id) {
            Some(node) => node.work = work,
            None => violations.push(self.missing(node_id)),
        }
        self.record(MutationKind::ReplaceNode, actor, payload, violations)
    }

    /// Add `from -> to`. Rejected if `from` is reachable from `to`.
    pub fn add_edge(&mut self, from: &str, to: &str, actor: &str) -> MutationOutcome {
        let payload = json!({ "from": from, "to": to });
        let mut violations = Vec::new();
        for id in [from, to] {
            if !self.nodes.contains_key(id) {
                violations.push(self.missing(id));
            }
        }

        if violations.is_empty() {
            if self.has_edge(from, to) {
                violations.push(InvariantViolation::new(
                    Invariant::EdgeUnique,
                    format!("edge {} -> {} already exists", from, to),
                ));
            } else {
                let forward = forward_adjacency(&self.edges);
                if is_reachable(&forward, to, from) {
                    violations.push(InvariantViolation::new(
                        Invariant::NoCycle,
                        format!("edge {} -> {} would create a cycle", from, to),
                    ));
                }
            }
        }

        if violations.is_empty() {
            self.edges
                .entry(to.to_string())
                .or_default()
                .push(from.to_string());
        }
        self.record(MutationKind::AddEdge, actor, payload, violations)
    }

    pub fn remove_edge(&mut self, from: &str, to: &str, actor: &str) -> MutationOutcome {
        let payload = json!({ "from": from, "to": to });
        let mut violations = Vec::new();
        if self.has_edge(from, to) {
            if let Some(sources) = self.edges.get_mut(to) {
                sources.retain(|s| s != from);
                if sources.is_empty() {
                    self.edges.remove(to);
                }
            }
        } else {
            violations.push(InvariantViolation::new(
                Invariant::EdgeExists,
                format!("edge {} -> {} does not exist", from, to),
            ));
        }
        self.record(MutationKind::RemoveEdge, actor, payload, violations)
    }

    /// Every mutation attempt so far, oldest first.
    pub fn mutation_log(&self) -> &[MutationEntry] {
        &self.log
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&GraphNode> {
        self.nodes.get(node_id)
    }

    pub fn node_ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes `node_id` depends on.
    pub fn dependencies(&self, node_id: &str) -> Vec<String> {
        self.edges.get(node_id).cloned().unwrap_or_default()
    }

    /// Nodes depending on `node_id`, in insertion order.
    pub fn dependents(&self, node_id: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.edges
                    .get(*id)
                    .is_some_and(|sources| sources.iter().any(|s| s == node_id))
            })
            .cloned()
            .collect()
    }

    /// Current edges, grouped by target in insertion order.
    pub fn edges(&self) -> Vec<Edge> {
        self.order
            .iter()
            .flat_map(|to| {
                self.edges
                    .get(to)
                    .into_iter()
                    .flatten()
                    .map(move |from| Edge::new(from.clone(), to.clone()))
            })
            .collect()
    }

    /// Snapshot the current topology into an executor.
    pub fn to_executor(&self, config: EngineConfig) -> Result<GraphExecutor> {
        let nodes = self
            .order
            .iter()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect();
        Ok(GraphExecutor::new(nodes, self.edges())?.with_config(config))
    }

    fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges
            .get(to)
            .is_some_and(|sources| sources.iter().any(|s| s == from))
    }

    fn missing(&self, node_id: &str) -> InvariantViolation {
        InvariantViolation::new(
            Invariant::NodeExists,
            format!("node '{}' does not exist", node_id),
        )
    }

    fn record(
        &mut self,
        kind: MutationKind,
        actor: &str,
        payload: serde_json::Value,
        violations: Vec<InvariantViolation>,
    ) -> MutationOutcome {
        let mutation_id = uuid::Uuid::new_v4().to_string();
        let status = if violations.is_empty() {
            info!(mutation_id = %mutation_id, kind = ?kind, actor, "Graph mutation applied");
            MutationStatus::Applied
        } else {
            warn!(
                mutation_id = %mutation_id,
                kind = ?kind,
                actor,
                reason = %violations[0].reason,
                "Graph mutation rejected"
            );
            MutationStatus::Rejected
        };

        self.log.push(MutationEntry {
            id: mutation_id.clone(),
            timestamp: Utc::now(),
            actor: actor.to_string(),
            kind,
            payload,
            status,
            violations: violations.clone(),
        });

        MutationOutcome {
            success: status == MutationStatus::Applied,
            mutation_id,
            violations,
        }
    }
}

impl std::fmt::Debug for DynamicAgentGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicAgentGraph")
            .field("nodes", &self.order)
            .field("edges", &self.edges)
            .field("mutations", &self.log.len())
            .finish()
    }
}
