//! Test doubles shared by the Braid crates.
//!
//! Every double implements one of the collaborator traits from `braid-core`
//! with scripted behavior, so scheduling tests can control timing, usage,
//! and failure precisely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};

use braid_core::error::{BraidError, Result};
use braid_core::traits::{CheckpointStore, ConsensusStrategy, NodeWork, WorkContext};
use braid_core::types::{GraphCheckpoint, GraphEvent, NodeOutput, NodeResult, TokenUsage};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Returns a fixed output after an optional delay, honoring cancellation.
#[derive(Debug, Clone, Default)]
pub struct ScriptedWork {
    output: String,
    echo: bool,
    usage: TokenUsage,
    delay: Duration,
}

impl ScriptedWork {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    /// Output whatever input the node receives.
    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage::new(input_tokens, output_tokens);
        self
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }
}

impl NodeWork for ScriptedWork {
    fn execute(&self, input: String, ctx: WorkContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = ctx.cancel.cancelled() => return Err(BraidError::Cancelled(ctx.node_id)),
                }
            }
            let output = if self.echo { input } else { self.output.clone() };
            Ok(NodeOutput::new(output).with_usage(self.usage))
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Fails with `NodeFailed` after an optional delay.
#[derive(Debug, Clone)]
pub struct FailingWork {
    message: String,
    delay: Duration,
}

impl FailingWork {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }
}

impl NodeWork for FailingWork {
    fn execute(&self, _input: String, ctx: WorkContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Err(BraidError::NodeFailed {
                node: ctx.node_id,
                message: self.message.clone(),
            })
        })
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Ignores its cancellation signal and sleeps the full duration.
///
/// Remembers whether the signal had been raised by the time it woke up.
#[derive(Debug, Clone)]
pub struct StubbornWork {
    duration: Duration,
    saw_cancel: Arc<AtomicBool>,
}

impl StubbornWork {
    pub fn new(ms: u64) -> Self {
        Self {
            duration: Duration::from_millis(ms),
            saw_cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn saw_cancel(&self) -> bool {
        self.saw_cancel.load(Ordering::SeqCst)
    }
}

impl NodeWork for StubbornWork {
    fn execute(&self, _input: String, ctx: WorkContext) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            tokio::time::sleep(self.duration).await;
            if ctx.cancel.is_cancelled() {
                self.saw_cancel.store(true, Ordering::SeqCst);
            }
            Ok(NodeOutput::new("stubborn"))
        })
    }

    fn name(&self) -> &str {
        "stubborn"
    }
}

/// Shared log of which nodes started, in order, and what input each got.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    starts: Arc<Mutex<Vec<(String, String)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node ids in start order.
    pub fn starts(&self) -> Vec<String> {
        lock(&self.starts).iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn input_of(&self, node_id: &str) -> Option<String> {
        lock(&self.starts)
            .iter()
            .find(|(id, _)| id == node_id)
            .map(|(_, input)| input.clone())
    }

    pub fn count(&self) -> usize {
        lock(&self.starts).len()
    }
}

/// Wraps another unit of work, recording each start in a [`Recorder`].
#[derive(Clone)]
pub struct RecordingWork {
    inner: Arc<dyn NodeWork>,
    recorder: Recorder,
}

impl RecordingWork {
    pub fn new(inner: impl NodeWork, recorder: Recorder) -> Self {
        Self {
            inner: Arc::new(inner),
            recorder,
        }
    }
}

impl NodeWork for RecordingWork {
    fn execute(&self, input: String, ctx: WorkContext) -> BoxFuture<'_, Result<NodeOutput>> {
        lock(&self.recorder.starts).push((ctx.node_id.clone(), input.clone()));
        self.inner.execute(input, ctx)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Joins candidate outputs sorted by member id, reporting fixed usage.
#[derive(Debug, Clone, Default)]
pub struct JoinConsensus {
    usage: TokenUsage,
    calls: Arc<AtomicUsize>,
}

impl JoinConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage::new(input_tokens, output_tokens);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConsensusStrategy for JoinConsensus {
    fn merge(&self, _fork_id: &str, mut candidates: Vec<NodeResult>) -> BoxFuture<'_, Result<NodeOutput>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            candidates.sort_by(|a, b| a.node_id.cmp(&b.node_id));
            let joined = candidates
                .iter()
                .map(|c| c.output.as_str())
                .collect::<Vec<_>>()
                .join(" | ");
            Ok(NodeOutput::new(joined).with_usage(self.usage))
        })
    }
}

/// Consensus that always fails.
#[derive(Debug, Clone, Default)]
pub struct FailingConsensus;

impl ConsensusStrategy for FailingConsensus {
    fn merge(&self, fork_id: &str, _candidates: Vec<NodeResult>) -> BoxFuture<'_, Result<NodeOutput>> {
        let fork = fork_id.to_string();
        Box::pin(async move {
            Err(BraidError::Consensus {
                fork,
                message: "no agreement".into(),
            })
        })
    }
}

/// Keeps every saved checkpoint in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    saved: Arc<Mutex<Vec<GraphCheckpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<GraphCheckpoint> {
        lock(&self.saved).clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &GraphCheckpoint) -> BoxFuture<'_, Result<()>> {
        let checkpoint = checkpoint.clone();
        Box::pin(async move {
            lock(&self.saved).push(checkpoint);
            Ok(())
        })
    }
}

/// A store whose every save fails.
#[derive(Debug, Clone, Default)]
pub struct FailingCheckpointStore;

impl CheckpointStore for FailingCheckpointStore {
    fn save(&self, _checkpoint: &GraphCheckpoint) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Err(BraidError::Io(std::io::Error::other("disk full"))) })
    }
}

/// Drain an event stream, giving up after ten seconds.
pub async fn collect_events<S>(stream: S) -> Vec<GraphEvent>
where
    S: Stream<Item = GraphEvent> + Unpin,
{
    let collect = stream.collect::<Vec<_>>();
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .unwrap_or_default()
}

/// Event names in order, e.g. `["graph:start", "node:start", ...]`.
pub fn event_names(events: &[GraphEvent]) -> Vec<&'static str> {
    events.iter().map(GraphEvent::name).collect()
}

/// Position of the first event with `name` for `node_id`.
pub fn position_of(events: &[GraphEvent], name: &str, node_id: &str) -> Option<usize> {
    events.iter().position(|e| {
        e.name() == name
            && match e {
                GraphEvent::NodeStart { node_id: id, .. }
                | GraphEvent::NodeComplete { node_id: id, .. }
                | GraphEvent::NodeError { node_id: id, .. } => id == node_id,
                GraphEvent::ForkStart { fork_id, .. }
                | GraphEvent::ForkPartial { fork_id, .. }
                | GraphEvent::ForkComplete { fork_id, .. }
                | GraphEvent::ConsensusStart { fork_id, .. }
                | GraphEvent::ConsensusResult { fork_id, .. } => fork_id == node_id,
                _ => false,
            }
    })
}

/// Count events by name.
pub fn event_counts(events: &[GraphEvent]) -> HashMap<&'static str, usize> {
    let mut counts = HashMap::new();
    for e in events {
        *counts.entry(e.name()).or_insert(0) += 1;
    }
    counts
}
