//! Graph execution: dependency-driven scheduling of agent nodes.
//!
//! A graph is a DAG of `GraphNode`s and `ForkGroup`s connected by `Edge`s,
//! where `to` depends on `from`. The `GraphExecutor` dispatches every node as
//! soon as its last dependency completes, feeding each node the base input
//! plus the outputs of its direct dependencies.
//!
//! `DynamicAgentGraph` is the editable variant: structural changes are checked
//! against invariants and recorded in an append-only mutation log.

pub mod context;
pub mod dynamic;
pub mod edge;
pub mod executor;
pub mod node;

pub use context::{build_node_input, render_outputs};
pub use dynamic::{
    DynamicAgentGraph, Invariant, InvariantViolation, MutationEntry, MutationKind,
    MutationOutcome, MutationStatus,
};
pub use edge::{Edge, EdgeMap};
pub use executor::{GraphExecutor, GraphFailure, RunOutcome};
pub use node::{ForkGroup, GraphNode};
