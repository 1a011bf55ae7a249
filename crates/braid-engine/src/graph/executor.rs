use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use braid_core::config::EngineConfig;
use braid_core::error::{BraidError, Result};
use braid_core::event::EventBus;
use braid_core::traits::{CheckpointStore, ConsensusStrategy, NodeWork, WorkContext};
use braid_core::types::{
    BudgetStatus, GraphCheckpoint, GraphEvent, GraphRunResult, NodeOutput, NodeResult, TokenUsage,
};

use super::context::{build_node_input, render_outputs};
use super::edge::{edges_by_target, find_cycle, terminal_nodes, Edge, EdgeMap};
use super::node::{ForkGroup, GraphNode};
use crate::budget::TokenBudgetController;
use crate::channel::{AsyncChannel, ChannelSender};
use crate::fork::ForkCoordinator;
use crate::pool::WorkerPool;
use crate::ready::IncrementalReadyTracker;

/// A failed run, with whatever completed before the failure.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct GraphFailure {
    pub error: BraidError,
    pub partial_results: HashMap<String, NodeResult>,
    pub usage: TokenUsage,
}

/// Outcome of one graph run.
pub type RunOutcome = std::result::Result<GraphRunResult, GraphFailure>;

impl GraphFailure {
    fn bare(error: BraidError) -> Self {
        Self {
            error,
            partial_results: HashMap::new(),
            usage: TokenUsage::default(),
        }
    }
}

impl From<GraphFailure> for BraidError {
    fn from(failure: GraphFailure) -> Self {
        failure.error
    }
}

enum Slot {
    Single(GraphNode),
    Fork(ForkGroup),
}

/// Validated, immutable topology shared by every run of an executor.
struct GraphSpec {
    slots: HashMap<String, Slot>,
    /// Declaration order: plain nodes first, then fork placeholders.
    order: Vec<String>,
    edges: EdgeMap,
    terminal: Vec<String>,
}

impl GraphSpec {
    fn build(nodes: Vec<GraphNode>, forks: Vec<ForkGroup>, edges: Vec<Edge>) -> Result<Self> {
        if nodes.is_empty() && forks.is_empty() {
            return Err(BraidError::Validation("graph has no nodes".into()));
        }

        let mut slots = HashMap::new();
        let mut order = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for node in nodes {
            if !seen.insert(node.id.clone()) {
                return Err(BraidError::DuplicateNode(node.id));
            }
            order.push(node.id.clone());
            slots.insert(node.id.clone(), Slot::Single(node));
        }

        for fork in forks {
            let size = fork.members.len();
            if size < 2 {
                return Err(BraidError::InvalidFork {
                    fork: fork.id,
                    reason: format!("needs at least 2 members, has {}", size),
                });
            }
            if let Some(min) = fork.min_results {
                if min == 0 || min > size {
                    return Err(BraidError::InvalidFork {
                        fork: fork.id,
                        reason: format!("min_results {} must be between 1 and {}", min, size),
                    });
                }
            }
            if !seen.insert(fork.id.clone()) {
                return Err(BraidError::DuplicateNode(fork.id));
            }
            for member in &fork.members {
                if !seen.insert(member.id.clone()) {
                    return Err(BraidError::DuplicateNode(member.id.clone()));
                }
            }
            order.push(fork.id.clone());
            slots.insert(fork.id.clone(), Slot::Fork(fork));
        }

        // Fork members are not addressable by edges, only their placeholder is
        for edge in &edges {
            for endpoint in [&edge.from, &edge.to] {
                if !slots.contains_key(endpoint) {
                    return Err(BraidError::DanglingEdge {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
        }

        let edges = edges_by_target(&edges);
        if let Some(cycle) = find_cycle(&order, &edges) {
            return Err(BraidError::CycleDetected(cycle));
        }
        let terminal = terminal_nodes(&order, &edges);

        Ok(Self {
            slots,
            order,
            edges,
            terminal,
        })
    }
}

/// Reactive scheduler for a static DAG of nodes and fork groups.
///
/// Ready nodes are submitted to a per-run [`WorkerPool`]; each completion
/// feeds the ready tracker, the budget, and the event stream. Cloning is
/// cheap and clones share the same validated topology.
#[derive(Clone)]
pub struct GraphExecutor {
    spec: Arc<GraphSpec>,
    config: EngineConfig,
    event_bus: Option<Arc<EventBus>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
}

impl GraphExecutor {
    /// Build an executor over plain nodes.
    ///
    /// Fails on duplicate ids, edges naming unknown nodes, or cycles.
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<Edge>) -> Result<Self> {
        Self::with_forks(nodes, Vec::new(), edges)
    }

    /// Build an executor over plain nodes and fork groups. Edges address a
    /// fork group by its placeholder id.
    pub fn with_forks(
        nodes: Vec<GraphNode>,
        forks: Vec<ForkGroup>,
        edges: Vec<Edge>,
    ) -> Result<Self> {
        let spec = GraphSpec::build(nodes, forks, edges)?;
        debug!(
            nodes = spec.order.len(),
            terminal = ?spec.terminal,
            "Graph validated"
        );
        Ok(Self {
            spec: Arc::new(spec),
            config: EngineConfig::default(),
            event_bus: None,
            checkpoint_store: None,
        })
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Also publish every event on a broadcast bus.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Hand checkpoints to an external store. Save failures are logged only.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Node and fork placeholder ids in declaration order.
    pub fn node_ids(&self) -> &[String] {
        &self.spec.order
    }

    /// Ids no other node depends on, in declaration order.
    pub fn terminal_nodes(&self) -> &[String] {
        &self.spec.terminal
    }

    /// Run the graph to completion.
    pub async fn run(&self, input: impl Into<String>) -> RunOutcome {
        let sink = EventSink::new(None, self.event_bus.clone());
        self.execute(RunStart::fresh(input.into()), sink).await
    }

    /// Run the graph in the background, yielding its events in order.
    ///
    /// The stream ends after `graph:complete` or `graph:error`. Must be
    /// called inside a tokio runtime.
    pub fn stream(&self, input: impl Into<String>) -> AsyncChannel<GraphEvent> {
        self.spawn_stream(RunStart::fresh(input.into()))
    }

    /// Continue a run from a checkpoint. Completed nodes are not re-run;
    /// nodes that were ready but unfinished are dispatched again.
    pub async fn resume(&self, checkpoint: GraphCheckpoint) -> RunOutcome {
        let sink = EventSink::new(None, self.event_bus.clone());
        self.execute(RunStart::from_checkpoint(checkpoint), sink).await
    }

    /// Streaming variant of [`resume`](Self::resume).
    pub fn resume_stream(&self, checkpoint: GraphCheckpoint) -> AsyncChannel<GraphEvent> {
        self.spawn_stream(RunStart::from_checkpoint(checkpoint))
    }

    fn spawn_stream(&self, start: RunStart) -> AsyncChannel<GraphEvent> {
        let (tx, channel) = AsyncChannel::new();
        let sink = EventSink::new(Some(tx), self.event_bus.clone());
        let executor = self.clone();
        tokio::spawn(async move {
            // Outcome is delivered as the terminal event
            let _ = executor.execute(start, sink).await;
        });
        channel
    }

    async fn execute(&self, start: RunStart, sink: EventSink) -> RunOutcome {
        let mut run = match Run::new(self, start, sink.clone()) {
            Ok(run) => run,
            Err(e) => {
                error!(error = %e, "Graph run could not start");
                sink.emit(GraphEvent::GraphError {
                    error: e.to_string(),
                    partial_results: HashMap::new(),
                    at_ms: sink.at_ms(),
                });
                sink.close();
                return Err(GraphFailure::bare(e));
            }
        };
        let outcome = run.drive().await;
        run.finish(outcome).await
    }
}

impl std::fmt::Debug for GraphExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphExecutor")
            .field("nodes", &self.spec.order)
            .field("terminal", &self.spec.terminal)
            .finish()
    }
}

/// Where a run begins: from scratch or from a checkpoint.
struct RunStart {
    run_id: String,
    input: String,
    completed: HashMap<String, NodeResult>,
    pending: Option<HashMap<String, usize>>,
    usage: TokenUsage,
    elapsed_ms: u64,
}

impl RunStart {
    fn fresh(input: String) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            input,
            completed: HashMap::new(),
            pending: None,
            usage: TokenUsage::default(),
            elapsed_ms: 0,
        }
    }

    fn from_checkpoint(checkpoint: GraphCheckpoint) -> Self {
        Self {
            run_id: checkpoint.run_id,
            input: checkpoint.input,
            completed: checkpoint.completed,
            pending: Some(checkpoint.pending),
            usage: checkpoint.usage,
            elapsed_ms: checkpoint.elapsed_ms,
        }
    }
}

/// Emits events to the stream consumer and the optional bus.
#[derive(Clone)]
struct EventSink {
    tx: Option<ChannelSender<GraphEvent>>,
    bus: Option<Arc<EventBus>>,
    started: Instant,
}

impl EventSink {
    fn new(tx: Option<ChannelSender<GraphEvent>>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            tx,
            bus,
            started: Instant::now(),
        }
    }

    fn at_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn emit(&self, event: GraphEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event.clone());
        }
        if let Some(tx) = &self.tx {
            tx.push(event);
        }
    }

    fn close(&self) {
        if let Some(tx) = &self.tx {
            tx.close();
        }
    }
}

/// One unit submitted to the pool: a plain node or a fork member.
struct NodeJob {
    node_id: String,
    fork_id: Option<String>,
    work: Arc<dyn NodeWork>,
    input: String,
}

struct Finished {
    output: NodeOutput,
    elapsed_ms: u64,
}

enum RunMessage {
    Started {
        node_id: String,
        fork_id: Option<String>,
    },
    TaskDone {
        node_id: String,
        fork_id: Option<String>,
        outcome: Result<Finished>,
    },
    ForkSettled {
        fork_id: String,
        outcome: Result<Vec<NodeResult>>,
    },
    ConsensusDone {
        fork_id: String,
        member_usage: TokenUsage,
        started: Instant,
        outcome: Result<NodeOutput>,
    },
}

struct ActiveFork {
    coordinator: ForkCoordinator,
    consensus: Option<Arc<dyn ConsensusStrategy>>,
    started: Instant,
}

/// State of one run. Owned by the scheduling loop alone.
struct Run {
    spec: Arc<GraphSpec>,
    config: EngineConfig,
    store: Option<Arc<dyn CheckpointStore>>,
    run_id: String,
    input: String,
    pool: WorkerPool<NodeJob, Finished>,
    tracker: IncrementalReadyTracker,
    resume_from: Option<(HashMap<String, usize>, Vec<String>)>,
    results: HashMap<String, NodeResult>,
    budget: TokenBudgetController,
    budget_status: BudgetStatus,
    sink: EventSink,
    tx: mpsc::UnboundedSender<RunMessage>,
    rx: mpsc::UnboundedReceiver<RunMessage>,
    /// Dispatched plain nodes and fork groups not yet folded into `results`.
    in_flight: usize,
    /// Cancellation signals of submitted tasks, by node or member id.
    running: HashMap<String, CancellationToken>,
    started_events: HashSet<String>,
    forks: HashMap<String, ActiveFork>,
    /// Member usage already accounted for forks whose result isn't stored yet.
    open_fork_usage: HashMap<String, TokenUsage>,
    completions: usize,
    started: Instant,
    base_elapsed_ms: u64,
}

impl Run {
    fn new(executor: &GraphExecutor, start: RunStart, sink: EventSink) -> Result<Self> {
        let spec = executor.spec.clone();
        for id in start.completed.keys() {
            if !spec.slots.contains_key(id) {
                return Err(BraidError::Validation(format!(
                    "checkpoint references unknown node '{}'",
                    id
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let pool_tx = tx.clone();
        let pool_name = format!("graph-{}", start.run_id.chars().take(8).collect::<String>());
        let pool = WorkerPool::from_fn(
            pool_name,
            executor.config.pool.clone(),
            move |job: NodeJob, cancel: CancellationToken| {
                let tx = pool_tx.clone();
                Box::pin(async move {
                    let NodeJob {
                        node_id,
                        fork_id,
                        work,
                        input,
                    } = job;
                    let _ = tx.send(RunMessage::Started {
                        node_id: node_id.clone(),
                        fork_id: fork_id.clone(),
                    });
                    let started = Instant::now();
                    let ctx = WorkContext {
                        node_id,
                        fork_id,
                        cancel,
                    };
                    let output = work.execute(input, ctx).await?;
                    Ok(Finished {
                        output,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    })
                })
            },
        )?;

        let tracker = IncrementalReadyTracker::new(&spec.edges, &spec.order);
        let resume_from = start
            .pending
            .map(|pending| (pending, start.completed.keys().cloned().collect()));
        let budget = TokenBudgetController::new(executor.config.budget.clone()).with_spent(start.usage);
        let budget_status = budget.check();

        Ok(Self {
            spec,
            config: executor.config.clone(),
            store: executor.checkpoint_store.clone(),
            run_id: start.run_id,
            input: start.input,
            pool,
            tracker,
            resume_from,
            results: start.completed,
            budget,
            budget_status,
            sink,
            tx,
            rx,
            in_flight: 0,
            running: HashMap::new(),
            started_events: HashSet::new(),
            forks: HashMap::new(),
            open_fork_usage: HashMap::new(),
            completions: 0,
            started: Instant::now(),
            base_elapsed_ms: start.elapsed_ms,
        })
    }

    fn elapsed_ms(&self) -> u64 {
        self.base_elapsed_ms + self.started.elapsed().as_millis() as u64
    }

    async fn drive(&mut self) -> Result<()> {
        let total = self.spec.slots.len();
        info!(run_id = %self.run_id, nodes = total, resumed = self.resume_from.is_some(), "Graph run started");
        self.sink.emit(GraphEvent::GraphStart {
            run_id: self.run_id.clone(),
            node_count: total,
            at_ms: self.sink.at_ms(),
        });

        let ready = match self.resume_from.take() {
            Some((pending, completed)) => self.tracker.restore_from(&pending, completed),
            None => self.tracker.seed_initial_ready(),
        };
        for id in ready {
            self.dispatch(&id)?;
        }

        let timeout = self.config.executor.timeout();
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            if self.results.len() == total {
                return Ok(());
            }
            if self.in_flight == 0 {
                warn!(run_id = %self.run_id, completed = self.results.len(), total, "No node ready and nothing running");
                return Err(BraidError::Deadlock {
                    completed: self.results.len(),
                    total,
                });
            }

            let message = tokio::select! {
                message = self.rx.recv() => message,
                _ = wait_until(deadline) => {
                    let limit_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
                    warn!(run_id = %self.run_id, timeout_ms = limit_ms, "Graph run timed out");
                    return Err(BraidError::GraphTimeout(limit_ms));
                }
            };
            // The run holds a sender itself, so the channel never closes here
            let Some(message) = message else {
                return Err(BraidError::PoolClosed(self.run_id.clone()));
            };
            self.handle(message)?;
        }
    }

    fn handle(&mut self, message: RunMessage) -> Result<()> {
        match message {
            RunMessage::Started { node_id, fork_id } => {
                self.mark_started(&node_id, fork_id);
                Ok(())
            }
            RunMessage::TaskDone {
                node_id,
                fork_id: None,
                outcome,
            } => {
                self.running.remove(&node_id);
                self.in_flight = self.in_flight.saturating_sub(1);
                self.mark_started(&node_id, None);
                match outcome {
                    Ok(finished) => {
                        let result = NodeResult {
                            node_id: node_id.clone(),
                            output: finished.output.output,
                            usage: finished.output.usage,
                            elapsed_ms: finished.elapsed_ms,
                        };
                        info!(node_id = %node_id, elapsed_ms = result.elapsed_ms, tokens = result.usage.total(), "Node complete");
                        self.sink.emit(GraphEvent::NodeComplete {
                            node_id: node_id.clone(),
                            fork_id: None,
                            result: result.clone(),
                            at_ms: self.sink.at_ms(),
                        });
                        let usage = result.usage;
                        self.complete(&node_id, result, usage)
                    }
                    Err(e) => {
                        error!(node_id = %node_id, error = %e, "Node failed");
                        self.emit_node_error(&node_id, None, &e);
                        Err(node_failure(&node_id, e))
                    }
                }
            }
            RunMessage::TaskDone {
                node_id,
                fork_id: Some(fork_id),
                outcome,
            } => self.on_member_done(node_id, fork_id, outcome),
            RunMessage::ForkSettled { fork_id, outcome } => self.on_fork_settled(fork_id, outcome),
            RunMessage::ConsensusDone {
                fork_id,
                member_usage,
                started,
                outcome,
            } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                let output = match outcome {
                    Ok(output) => output,
                    Err(e @ BraidError::Consensus { .. }) => return Err(e),
                    Err(e) => {
                        return Err(BraidError::Consensus {
                            fork: fork_id,
                            message: e.to_string(),
                        })
                    }
                };
                info!(fork_id = %fork_id, "Consensus reached");
                self.sink.emit(GraphEvent::ConsensusResult {
                    fork_id: fork_id.clone(),
                    output: output.output.clone(),
                    at_ms: self.sink.at_ms(),
                });
                let mut usage = member_usage;
                usage.accumulate(&output.usage);
                let result = NodeResult {
                    node_id: fork_id.clone(),
                    output: output.output,
                    usage,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                // Member usage was already accounted as members finished
                self.complete(&fork_id, result, output.usage)
            }
        }
    }

    fn on_member_done(&mut self, member_id: String, fork_id: String, outcome: Result<Finished>) -> Result<()> {
        self.running.remove(&member_id);
        if !self.forks.contains_key(&fork_id) {
            debug!(fork_id = %fork_id, member = %member_id, "Late fork member report dropped");
            return Ok(());
        }
        self.mark_started(&member_id, Some(fork_id.clone()));

        match outcome {
            Ok(finished) => {
                let result = NodeResult {
                    node_id: member_id.clone(),
                    output: finished.output.output,
                    usage: finished.output.usage,
                    elapsed_ms: finished.elapsed_ms,
                };
                debug!(fork_id = %fork_id, member = %member_id, elapsed_ms = result.elapsed_ms, "Fork member complete");
                self.sink.emit(GraphEvent::NodeComplete {
                    node_id: member_id,
                    fork_id: Some(fork_id.clone()),
                    result: result.clone(),
                    at_ms: self.sink.at_ms(),
                });
                self.open_fork_usage
                    .entry(fork_id.clone())
                    .or_default()
                    .accumulate(&result.usage);
                self.account(&result.usage)?;
                if let Some(fork) = self.forks.get(&fork_id) {
                    fork.coordinator.on_node_complete(result);
                }
            }
            Err(e) => {
                warn!(fork_id = %fork_id, member = %member_id, error = %e, "Fork member failed");
                self.emit_node_error(&member_id, Some(fork_id.clone()), &e);
                if let Some(fork) = self.forks.get(&fork_id) {
                    fork.coordinator.on_node_error(&member_id, &e);
                }
            }
        }
        Ok(())
    }

    fn on_fork_settled(&mut self, fork_id: String, outcome: Result<Vec<NodeResult>>) -> Result<()> {
        let Some(fork) = self.forks.remove(&fork_id) else {
            return Ok(());
        };
        // Members still running lost the race
        for member in fork.coordinator.members() {
            if let Some(token) = self.running.remove(member) {
                debug!(fork_id = %fork_id, member = %member, "Cancelling unsettled fork member");
                token.cancel();
            }
        }
        let results = outcome?;

        self.sink.emit(GraphEvent::ForkComplete {
            fork_id: fork_id.clone(),
            results: results.clone(),
            at_ms: self.sink.at_ms(),
        });

        let mut member_usage = TokenUsage::default();
        for r in &results {
            member_usage.accumulate(&r.usage);
        }

        match fork.consensus {
            Some(consensus) => {
                info!(fork_id = %fork_id, candidates = results.len(), "Consensus started");
                self.sink.emit(GraphEvent::ConsensusStart {
                    fork_id: fork_id.clone(),
                    candidates: results.len(),
                    at_ms: self.sink.at_ms(),
                });
                let tx = self.tx.clone();
                let started = fork.started;
                tokio::spawn(async move {
                    let outcome = consensus.merge(&fork_id, results).await;
                    let _ = tx.send(RunMessage::ConsensusDone {
                        fork_id,
                        member_usage,
                        started,
                        outcome,
                    });
                });
                Ok(())
            }
            None => {
                self.in_flight = self.in_flight.saturating_sub(1);
                let output = render_outputs(results.iter().map(|r| (r.node_id.as_str(), r.output.as_str())));
                let result = NodeResult {
                    node_id: fork_id.clone(),
                    output,
                    usage: member_usage,
                    elapsed_ms: fork.started.elapsed().as_millis() as u64,
                };
                self.complete(&fork_id, result, TokenUsage::default())
            }
        }
    }

    /// Store a result, account its fresh usage, and release successors.
    fn complete(&mut self, id: &str, result: NodeResult, fresh_usage: TokenUsage) -> Result<()> {
        self.results.insert(id.to_string(), result);
        self.open_fork_usage.remove(id);
        self.account(&fresh_usage)?;

        let ready = self.tracker.mark_completed(id);
        self.completions += 1;
        let every = self.config.executor.checkpoint_every;
        if every > 0 && self.completions % every == 0 {
            self.checkpoint();
        }

        for next in ready {
            self.dispatch(&next)?;
        }
        Ok(())
    }

    fn account(&mut self, usage: &TokenUsage) -> Result<()> {
        self.budget.release(usage);

        let status = self.budget.check();
        if status > self.budget_status {
            self.budget_status = status;
            warn!(
                run_id = %self.run_id,
                status = ?status,
                used = self.budget.total().total(),
                budget = self.budget.budget(),
                "Token budget threshold crossed"
            );
            self.sink.emit(GraphEvent::BudgetWarning {
                status,
                used_tokens: self.budget.total().total(),
                budget_tokens: self.budget.budget(),
                at_ms: self.sink.at_ms(),
            });
        }

        if self.budget.is_exceeded() {
            return Err(BraidError::BudgetExceeded {
                used: self.budget.total().total(),
                budget: self.budget.budget(),
            });
        }
        Ok(())
    }

    fn checkpoint(&self) {
        // A resumed run re-runs open forks, so their members' usage is left out
        let usage = self.open_fork_usage.values().fold(self.budget.total(), |total, open| {
            TokenUsage::new(
                total.input_tokens.saturating_sub(open.input_tokens),
                total.output_tokens.saturating_sub(open.output_tokens),
            )
        });
        let checkpoint = GraphCheckpoint {
            run_id: self.run_id.clone(),
            input: self.input.clone(),
            completed: self.results.clone(),
            pending: self.tracker.snapshot(),
            usage,
            elapsed_ms: self.elapsed_ms(),
            timestamp: Utc::now(),
        };
        debug!(run_id = %self.run_id, completed = checkpoint.completed.len(), "Checkpoint taken");

        if let Some(store) = &self.store {
            let store = store.clone();
            let snapshot = checkpoint.clone();
            tokio::spawn(async move {
                if let Err(e) = store.save(&snapshot).await {
                    warn!(run_id = %snapshot.run_id, error = %e, "Failed to save checkpoint");
                }
            });
        }

        self.sink.emit(GraphEvent::CheckpointSaved {
            checkpoint,
            at_ms: self.sink.at_ms(),
        });
    }

    fn dispatch(&mut self, id: &str) -> Result<()> {
        let spec = self.spec.clone();
        let Some(slot) = spec.slots.get(id) else {
            return Err(BraidError::Validation(format!("unknown node '{}'", id)));
        };
        let input = self.node_input(id);

        match slot {
            Slot::Single(node) => {
                self.submit(node, None, node.priority, input)?;
                self.in_flight += 1;
                Ok(())
            }
            Slot::Fork(group) => self.start_fork(group, input),
        }
    }

    fn node_input(&self, id: &str) -> String {
        let deps = self.spec.edges.get(id).map(Vec::as_slice).unwrap_or_default();
        build_node_input(
            &self.input,
            deps.iter()
                .filter_map(|dep| self.results.get(dep).map(|r| (dep.as_str(), r.output.as_str()))),
        )
    }

    fn submit(&mut self, node: &GraphNode, fork_id: Option<String>, priority: i32, input: String) -> Result<()> {
        let job = NodeJob {
            node_id: node.id.clone(),
            fork_id: fork_id.clone(),
            work: node.work.clone(),
            input,
        };
        let handle = self.pool.submit(node.id.clone(), job, priority)?;
        self.running
            .insert(node.id.clone(), handle.cancel_token().clone());
        debug!(node_id = %node.id, work = node.work.name(), priority, "Node dispatched");

        let tx = self.tx.clone();
        let node_id = node.id.clone();
        tokio::spawn(async move {
            let outcome = handle.wait().await;
            let _ = tx.send(RunMessage::TaskDone {
                node_id,
                fork_id,
                outcome,
            });
        });
        Ok(())
    }

    fn start_fork(&mut self, group: &ForkGroup, input: String) -> Result<()> {
        let members = group.member_ids();
        let min_results = group
            .min_results
            .unwrap_or(self.config.fork.min_results)
            .clamp(1, members.len());
        let timeout = Duration::from_millis(group.timeout_ms.unwrap_or(self.config.fork.timeout_ms));

        self.sink.emit(GraphEvent::ForkStart {
            fork_id: group.id.clone(),
            members: members.clone(),
            at_ms: self.sink.at_ms(),
        });
        info!(fork_id = %group.id, members = members.len(), min_results, "Fork started");

        let sink = self.sink.clone();
        let partial_id = group.id.clone();
        let (coordinator, settlement) =
            ForkCoordinator::new(group.id.clone(), members, timeout, min_results, move |results| {
                sink.emit(GraphEvent::ForkPartial {
                    fork_id: partial_id.clone(),
                    results: results.to_vec(),
                    at_ms: sink.at_ms(),
                });
            })?;

        self.forks.insert(
            group.id.clone(),
            ActiveFork {
                coordinator,
                consensus: group.consensus.clone(),
                started: Instant::now(),
            },
        );
        self.in_flight += 1;

        for member in &group.members {
            self.submit(member, Some(group.id.clone()), group.priority, input.clone())?;
        }

        let tx = self.tx.clone();
        let fork_id = group.id.clone();
        tokio::spawn(async move {
            let outcome = settlement.wait().await;
            let _ = tx.send(RunMessage::ForkSettled { fork_id, outcome });
        });
        Ok(())
    }

    /// Emit `node:start` the first time a node is seen, so it always
    /// precedes that node's completion or error.
    fn mark_started(&mut self, node_id: &str, fork_id: Option<String>) {
        if self.started_events.insert(node_id.to_string()) {
            self.sink.emit(GraphEvent::NodeStart {
                node_id: node_id.to_string(),
                fork_id,
                at_ms: self.sink.at_ms(),
            });
        }
    }

    fn emit_node_error(&self, node_id: &str, fork_id: Option<String>, error: &BraidError) {
        self.sink.emit(GraphEvent::NodeError {
            node_id: node_id.to_string(),
            fork_id,
            error: error.to_string(),
            timed_out: error.is_timeout(),
            at_ms: self.sink.at_ms(),
        });
    }

    fn build_result(&self) -> GraphRunResult {
        let terminal = self.spec.terminal.clone();
        let output = match terminal.as_slice() {
            [only] => self
                .results
                .get(only)
                .map(|r| r.output.clone())
                .unwrap_or_default(),
            many => render_outputs(many.iter().filter_map(|id| {
                self.results
                    .get(id)
                    .map(|r| (id.as_str(), r.output.as_str()))
            })),
        };
        GraphRunResult {
            run_id: self.run_id.clone(),
            output,
            terminal_nodes: terminal,
            node_results: self.results.clone(),
            usage: self.budget.total(),
            elapsed_ms: self.elapsed_ms(),
        }
    }

    async fn finish(mut self, outcome: Result<()>) -> RunOutcome {
        match outcome {
            Ok(()) => {
                if let Err(e) = self.pool.drain(None).await {
                    debug!(run_id = %self.run_id, error = %e, "Pool drain after run");
                }
                let result = self.build_result();
                info!(
                    run_id = %self.run_id,
                    nodes = result.node_results.len(),
                    tokens = result.usage.total(),
                    elapsed_ms = result.elapsed_ms,
                    "Graph run complete"
                );
                self.sink.emit(GraphEvent::GraphComplete {
                    result: result.clone(),
                    at_ms: self.sink.at_ms(),
                });
                self.sink.close();
                Ok(result)
            }
            Err(error) => {
                for (_, token) in self.running.drain() {
                    token.cancel();
                }
                self.forks.clear();
                let grace = Duration::from_millis(self.config.executor.abort_grace_ms);
                if let Err(e) = self.pool.drain(Some(grace)).await {
                    debug!(run_id = %self.run_id, error = %e, "Pool drain after failure");
                }

                error!(
                    run_id = %self.run_id,
                    error = %error,
                    completed = self.results.len(),
                    "Graph run failed"
                );
                self.sink.emit(GraphEvent::GraphError {
                    error: error.to_string(),
                    partial_results: self.results.clone(),
                    at_ms: self.sink.at_ms(),
                });
                self.sink.close();
                Err(GraphFailure {
                    error,
                    partial_results: self.results,
                    usage: self.budget.total(),
                })
            }
        }
    }
}

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Timeouts, cancellations and node failures keep their identity; anything
/// else is reported as a failure of the node.
fn node_failure(node_id: &str, error: BraidError) -> BraidError {
    match error {
        e @ (BraidError::TaskTimeout { .. } | BraidError::Cancelled(_) | BraidError::NodeFailed { .. }) => e,
        other => BraidError::NodeFailed {
            node: node_id.to_string(),
            message: other.to_string(),
        },
    }
}
