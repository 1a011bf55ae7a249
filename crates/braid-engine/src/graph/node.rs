use std::sync::Arc;

use braid_core::traits::{ConsensusStrategy, NodeWork};

/// A node in the execution graph, bound to one unit of work.
#[derive(Clone)]
pub struct GraphNode {
    /// Unique identifier for this node.
    pub id: String,
    /// The injected work implementation.
    pub work: Arc<dyn NodeWork>,
    /// Pool priority; lower runs sooner.
    pub priority: i32,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, work: Arc<dyn NodeWork>) -> Self {
        Self {
            id: id.into(),
            work,
            priority: 0,
        }
    }

    /// Wrap a concrete work value.
    pub fn from_work(id: impl Into<String>, work: impl NodeWork) -> Self {
        Self::new(id, Arc::new(work))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl std::fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("work", &self.work.name())
            .field("priority", &self.priority)
            .finish()
    }
}

/// A set of alternate executions sharing one placeholder position.
///
/// Other nodes depend on the placeholder `id`; its result is the merged
/// output of the members that succeeded.
#[derive(Clone)]
pub struct ForkGroup {
    /// Placeholder id used in edges.
    pub id: String,
    pub members: Vec<GraphNode>,
    /// Merges member outputs. Without one, outputs are concatenated.
    pub consensus: Option<Arc<dyn ConsensusStrategy>>,
    /// Overrides `[fork].min_results`.
    pub min_results: Option<usize>,
    /// Overrides `[fork].timeout_ms`.
    pub timeout_ms: Option<u64>,
    /// Pool priority for every member.
    pub priority: i32,
}

impl ForkGroup {
    pub fn new(id: impl Into<String>, members: Vec<GraphNode>) -> Self {
        Self {
            id: id.into(),
            members,
            consensus: None,
            min_results: None,
            timeout_ms: None,
            priority: 0,
        }
    }

    pub fn with_consensus(mut self, consensus: Arc<dyn ConsensusStrategy>) -> Self {
        self.consensus = Some(consensus);
        self
    }

    pub fn with_min_results(mut self, min_results: usize) -> Self {
        self.min_results = Some(min_results);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }
}

impl std::fmt::Debug for ForkGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkGroup")
            .field("id", &self.id)
            .field("members", &self.member_ids())
            .field("consensus", &self.consensus.is_some())
            .field("min_results", &self.min_results)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}
