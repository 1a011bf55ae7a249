use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource counters reported by a unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Add another usage record into this one.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

/// What a unit of work hands back on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub output: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl NodeOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            usage: TokenUsage::default(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// Result of one completed node or fork group. Never modified once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Which node (or fork placeholder) produced this.
    pub node_id: String,
    pub output: String,
    pub usage: TokenUsage,
    /// Execution time in milliseconds.
    pub elapsed_ms: u64,
}

/// Budget threshold reached by cumulative usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    None,
    SoftLimit,
    HardLimit,
}

/// Serializable snapshot of an in-progress run.
///
/// The engine only produces these; persisting them is the job of a
/// [`CheckpointStore`](crate::traits::CheckpointStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphCheckpoint {
    pub run_id: String,
    pub input: String,
    pub completed: HashMap<String, NodeResult>,
    pub pending: HashMap<String, usize>,
    pub usage: TokenUsage,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl GraphCheckpoint {
    /// Ids of the nodes that had finished when the snapshot was taken.
    pub fn completed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.completed.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Final result of a graph run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRunResult {
    pub run_id: String,
    /// Output of the terminal node (or the rendered outputs of all of them).
    pub output: String,
    /// Nodes no other node depends on, in declaration order.
    pub terminal_nodes: Vec<String>,
    pub node_results: HashMap<String, NodeResult>,
    pub usage: TokenUsage,
    pub elapsed_ms: u64,
}

/// Lifecycle event streamed out of a graph run.
///
/// The serialized `type` tag is the event name consumers match on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GraphEvent {
    #[serde(rename = "graph:start")]
    GraphStart {
        run_id: String,
        node_count: usize,
        at_ms: u64,
    },
    #[serde(rename = "node:start")]
    NodeStart {
        node_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fork_id: Option<String>,
        at_ms: u64,
    },
    #[serde(rename = "node:complete")]
    NodeComplete {
        node_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fork_id: Option<String>,
        result: NodeResult,
        at_ms: u64,
    },
    #[serde(rename = "node:error")]
    NodeError {
        node_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fork_id: Option<String>,
        error: String,
        timed_out: bool,
        at_ms: u64,
    },
    #[serde(rename = "fork:start")]
    ForkStart {
        fork_id: String,
        members: Vec<String>,
        at_ms: u64,
    },
    #[serde(rename = "fork:partial")]
    ForkPartial {
        fork_id: String,
        results: Vec<NodeResult>,
        at_ms: u64,
    },
    #[serde(rename = "fork:complete")]
    ForkComplete {
        fork_id: String,
        results: Vec<NodeResult>,
        at_ms: u64,
    },
    #[serde(rename = "consensus:start")]
    ConsensusStart {
        fork_id: String,
        candidates: usize,
        at_ms: u64,
    },
    #[serde(rename = "consensus:result")]
    ConsensusResult {
        fork_id: String,
        output: String,
        at_ms: u64,
    },
    #[serde(rename = "budget:warning")]
    BudgetWarning {
        status: BudgetStatus,
        used_tokens: u64,
        budget_tokens: u64,
        at_ms: u64,
    },
    #[serde(rename = "checkpoint:saved")]
    CheckpointSaved {
        checkpoint: GraphCheckpoint,
        at_ms: u64,
    },
    #[serde(rename = "graph:complete")]
    GraphComplete { result: GraphRunResult, at_ms: u64 },
    #[serde(rename = "graph:error")]
    GraphError {
        error: String,
        partial_results: HashMap<String, NodeResult>,
        at_ms: u64,
    },
}

impl GraphEvent {
    /// The event name carried in the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GraphStart { .. } => "graph:start",
            Self::NodeStart { .. } => "node:start",
            Self::NodeComplete { .. } => "node:complete",
            Self::NodeError { .. } => "node:error",
            Self::ForkStart { .. } => "fork:start",
            Self::ForkPartial { .. } => "fork:partial",
            Self::ForkComplete { .. } => "fork:complete",
            Self::ConsensusStart { .. } => "consensus:start",
            Self::ConsensusResult { .. } => "consensus:result",
            Self::BudgetWarning { .. } => "budget:warning",
            Self::CheckpointSaved { .. } => "checkpoint:saved",
            Self::GraphComplete { .. } => "graph:complete",
            Self::GraphError { .. } => "graph:error",
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::GraphComplete { .. } | Self::GraphError { .. })
    }
}
