//! Braid: concurrent DAG execution core for multi-agent orchestration.
//!
//! Re-exports the public API of `braid-core` and `braid-engine`:
//!
//! - [`GraphExecutor`] schedules a static DAG of nodes and fork groups over a
//!   bounded [`WorkerPool`], streaming [`GraphEvent`]s as it goes.
//! - [`DynamicAgentGraph`] accepts structural edits under invariants and keeps
//!   an append-only mutation log.
//! - [`AgentSupervisor`] restarts long-lived children per strategy, bounded by
//!   a rolling restart-intensity window.

pub use braid_core::config::{
    BudgetConfig, EngineConfig, ExecutorConfig, ForkConfig, PoolConfig, RestartIntensity,
    RestartStrategy, SupervisorConfig,
};
pub use braid_core::error::{BraidError, Result};
pub use braid_core::event::EventBus;
pub use braid_core::traits::{
    CheckpointStore, ConsensusStrategy, NodeWork, SupervisedChild, WorkContext,
};
pub use braid_core::types::{
    BudgetStatus, GraphCheckpoint, GraphEvent, GraphRunResult, NodeOutput, NodeResult, TokenUsage,
};
pub use braid_engine::{
    AgentSupervisor, AsyncChannel, ChannelSender, ChildSpec, ChildStats, DynamicAgentGraph, Edge,
    ForkCoordinator, ForkGroup, GraphExecutor, GraphFailure, GraphNode, IncrementalReadyTracker,
    Invariant, InvariantViolation, MutationEntry, MutationKind, MutationOutcome, MutationStatus,
    PoolMetrics, PriorityQueue, RestartPolicy, RunOutcome, SupervisorBuilder, SupervisorStats,
    SupervisorStatus, TaskHandle, TokenBudgetController, WorkerPool,
};

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (e.g. `"braid=info,warn"`).
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
