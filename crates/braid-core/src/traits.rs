use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{GraphCheckpoint, NodeOutput, NodeResult};

/// Context handed to a unit of work for one execution.
#[derive(Debug, Clone)]
pub struct WorkContext {
    /// Node (or fork member) being executed.
    pub node_id: String,
    /// Enclosing fork group, if any.
    pub fork_id: Option<String>,
    /// Raised on task timeout, forced drain, or run timeout.
    /// Work is expected to observe it and unwind.
    pub cancel: CancellationToken,
}

/// A unit of work bound to a graph node.
///
/// The engine does not interpret what the work computes; it only schedules it,
/// hands it the rendered input, and accounts for the returned usage.
pub trait NodeWork: Send + Sync + 'static {
    fn execute(&self, input: String, ctx: WorkContext) -> BoxFuture<'_, Result<NodeOutput>>;

    /// Label used in logs.
    fn name(&self) -> &str {
        "work"
    }
}

/// Merges the outputs of a fork group into the placeholder's single result.
pub trait ConsensusStrategy: Send + Sync + 'static {
    fn merge(&self, fork_id: &str, candidates: Vec<NodeResult>)
        -> BoxFuture<'_, Result<NodeOutput>>;
}

/// External persistence collaborator for checkpoints.
pub trait CheckpointStore: Send + Sync + 'static {
    fn save(&self, checkpoint: &GraphCheckpoint) -> BoxFuture<'_, Result<()>>;
}

/// A long-lived execution managed by a supervisor.
///
/// `run` resolves when the child stops: `Ok` for a normal exit, `Err` for a
/// crash. The token is raised when the supervisor wants the child gone.
pub trait SupervisedChild: Send + Sync + 'static {
    fn run(&self, cancel: CancellationToken) -> BoxFuture<'_, Result<()>>;
}
