pub mod budget;
pub mod channel;
pub mod fork;
pub mod graph;
pub mod pool;
pub mod queue;
pub mod ready;
pub mod supervisor;

pub use budget::TokenBudgetController;
pub use channel::{AsyncChannel, ChannelSender};
pub use fork::{ForkCoordinator, ForkSettlement};
pub use graph::{
    DynamicAgentGraph, Edge, ForkGroup, GraphExecutor, GraphFailure, GraphNode, Invariant,
    InvariantViolation, MutationEntry, MutationKind, MutationOutcome, MutationStatus, RunOutcome,
};
pub use pool::{PoolMetrics, TaskFn, TaskHandle, WorkerPool};
pub use queue::PriorityQueue;
pub use ready::IncrementalReadyTracker;
pub use supervisor::{
    AgentSupervisor, ChildSpec, ChildStats, RestartPolicy, SupervisorBuilder, SupervisorStats,
    SupervisorStatus,
};
