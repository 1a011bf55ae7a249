use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use braid_core::config::PoolConfig;
use braid_core::error::{BraidError, Result};

use crate::queue::PriorityQueue;

/// How many recent task latencies feed the p50 metric.
const LATENCY_WINDOW: usize = 1024;

/// The function every worker runs for a dequeued task.
pub type TaskFn<I, O> = Arc<dyn Fn(I, CancellationToken) -> BoxFuture<'static, Result<O>> + Send + Sync>;

/// Point-in-time snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub busy_workers: usize,
    pub slow_workers: usize,
    pub p50_latency_ms: u64,
    /// Incremented on every dequeue by a free worker.
    pub work_steals: u64,
}

/// Single-resolution handle for a submitted task.
pub struct TaskHandle<O> {
    id: String,
    rx: oneshot::Receiver<Result<O>>,
    cancel: CancellationToken,
}

impl<O> TaskHandle<O> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The task's cancellation signal.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ask the task to stop. A queued task never starts; a running one fails
    /// with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the task to finish.
    pub async fn wait(self) -> Result<O> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(BraidError::PoolClosed(self.id)),
        }
    }
}

struct QueuedTask<I, O> {
    id: String,
    input: I,
    priority: i32,
    seq: u64,
    submitted_at: Instant,
    cancel: CancellationToken,
    respond: oneshot::Sender<Result<O>>,
}

#[derive(Debug)]
struct WorkerSlot {
    busy_with: Option<String>,
    started_at: Option<Instant>,
    last_active: Instant,
    flagged_slow: bool,
}

struct PoolState<I, O> {
    queue: PriorityQueue<QueuedTask<I, O>>,
    workers: HashMap<usize, WorkerSlot>,
    in_flight: HashMap<u64, CancellationToken>,
    min_size: usize,
    max_size: usize,
    draining: bool,
    next_seq: u64,
    next_worker: usize,
    submitted: u64,
    completed: u64,
    failed: u64,
    timed_out: u64,
    work_steals: u64,
    latencies: VecDeque<u64>,
}

impl<I, O> PoolState<I, O> {
    fn busy_workers(&self) -> usize {
        self.workers.values().filter(|w| w.busy_with.is_some()).count()
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    fn record_latency(&mut self, ms: u64) {
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(ms);
    }

    fn p50(&self) -> u64 {
        if self.latencies.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.latencies.iter().copied().collect();
        sorted.sort_unstable();
        sorted[(sorted.len() - 1) / 2]
    }
}

struct PoolShared<I, O> {
    name: String,
    config: PoolConfig,
    run: TaskFn<I, O>,
    state: Mutex<PoolState<I, O>>,
    work_ready: Notify,
    idle: Notify,
    /// Raised when drain begins, waking every parked worker.
    draining: CancellationToken,
    /// Raised when the pool is gone; stops the heartbeat.
    shutdown: CancellationToken,
}

impl<I, O> PoolShared<I, O> {
    fn lock(&self) -> MutexGuard<'_, PoolState<I, O>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Outcome<O> {
    Finished(Result<O>),
    TimedOut,
    Cancelled,
}

/// Bounded pool of concurrent executors pulling from one shared priority queue.
///
/// Workers are independent pull loops: a free worker takes the
/// highest-priority task (lowest number, ties by submission order) and runs
/// it to completion before pulling again, so a short task never waits behind
/// a slower one running elsewhere. The pool grows (up to `max_size`) when a
/// queued task has no idle worker to take it or the queue is deeper than
/// `grow_threshold`, and shrinks back toward `min_size` as workers idle.
pub struct WorkerPool<I, O> {
    shared: Arc<PoolShared<I, O>>,
}

impl<I, O> WorkerPool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Create a pool and start `min_size` workers. Must be called inside a
    /// tokio runtime.
    pub fn new(name: impl Into<String>, config: PoolConfig, run: TaskFn<I, O>) -> Result<Self> {
        config.validate()?;
        let state = PoolState {
            queue: PriorityQueue::new(|a: &QueuedTask<I, O>, b: &QueuedTask<I, O>| {
                a.priority.cmp(&b.priority).then(a.seq.cmp(&b.seq))
            }),
            workers: HashMap::new(),
            in_flight: HashMap::new(),
            min_size: config.min_size,
            max_size: config.max_size,
            draining: false,
            next_seq: 0,
            next_worker: 0,
            submitted: 0,
            completed: 0,
            failed: 0,
            timed_out: 0,
            work_steals: 0,
            latencies: VecDeque::new(),
        };
        let shared = Arc::new(PoolShared {
            name: name.into(),
            config,
            run,
            state: Mutex::new(state),
            work_ready: Notify::new(),
            idle: Notify::new(),
            draining: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        });

        {
            let mut st = shared.lock();
            for _ in 0..shared.config.min_size {
                spawn_worker(&shared, &mut st);
            }
        }
        tokio::spawn(heartbeat_loop(shared.clone()));

        info!(
            pool = %shared.name,
            min = shared.config.min_size,
            max = shared.config.max_size,
            "Worker pool started"
        );

        Ok(Self { shared })
    }

    /// Build a pool from a closure.
    pub fn from_fn<F>(name: impl Into<String>, config: PoolConfig, f: F) -> Result<Self>
    where
        F: Fn(I, CancellationToken) -> BoxFuture<'static, Result<O>> + Send + Sync + 'static,
    {
        Self::new(name, config, Arc::new(f))
    }

    /// Enqueue work. Lower `priority` runs sooner.
    ///
    /// Fails with `PoolDraining` once `drain` has been called.
    pub fn submit(&self, id: impl Into<String>, input: I, priority: i32) -> Result<TaskHandle<O>> {
        let id = id.into();
        let (respond, rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let mut st = self.shared.lock();
        if st.draining {
            return Err(BraidError::PoolDraining);
        }

        let seq = st.next_seq;
        st.next_seq += 1;
        st.submitted += 1;
        st.queue.push(QueuedTask {
            id: id.clone(),
            input,
            priority,
            seq,
            submitted_at: Instant::now(),
            cancel: cancel.clone(),
            respond,
        });

        let depth = st.queue.len();
        let workers = st.workers.len();
        // A task no idle worker will pick up gets a new worker; past the
        // threshold the pool grows even while some workers look idle.
        let idle_workers = workers - st.busy_workers();
        if workers < st.max_size
            && (depth > idle_workers || depth > self.shared.config.grow_threshold)
        {
            debug!(pool = %self.shared.name, depth, workers, idle_workers, "Backlog uncovered, growing pool");
            spawn_worker(&self.shared, &mut st);
        }
        drop(st);

        self.shared.work_ready.notify_one();
        debug!(pool = %self.shared.name, task = %id, priority, "Task submitted");

        Ok(TaskHandle { id, rx, cancel })
    }

    pub fn metrics(&self) -> PoolMetrics {
        let st = self.shared.lock();
        PoolMetrics {
            submitted: st.submitted,
            completed: st.completed,
            failed: st.failed,
            timed_out: st.timed_out,
            queue_depth: st.queue.len(),
            active_workers: st.workers.len(),
            busy_workers: st.busy_workers(),
            slow_workers: st.workers.values().filter(|w| w.flagged_slow).count(),
            p50_latency_ms: st.p50(),
            work_steals: st.work_steals,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.lock().workers.len()
    }

    pub fn is_draining(&self) -> bool {
        self.shared.lock().draining
    }

    /// Change the size bounds. Workers above the new maximum retire once idle.
    pub fn resize(&self, min_size: usize, max_size: usize) -> Result<()> {
        if max_size == 0 || min_size > max_size {
            return Err(BraidError::Config(format!(
                "invalid pool bounds: min {} max {}",
                min_size, max_size
            )));
        }
        let mut st = self.shared.lock();
        st.min_size = min_size;
        st.max_size = max_size;
        while st.workers.len() < min_size {
            spawn_worker(&self.shared, &mut st);
        }
        info!(pool = %self.shared.name, min_size, max_size, "Worker pool resized");
        Ok(())
    }

    /// Stop accepting work and wait for queued and in-flight tasks.
    ///
    /// With a timeout, in-flight tasks are cancelled once it elapses, queued
    /// tasks are failed, and the call returns `DrainTimeout`.
    pub async fn drain(&self, timeout: Option<Duration>) -> Result<()> {
        {
            let mut st = self.shared.lock();
            st.draining = true;
        }
        self.shared.draining.cancel();
        info!(pool = %self.shared.name, "Draining worker pool");

        let wait_idle = async {
            loop {
                let notified = self.shared.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.shared.lock().is_idle() {
                    break;
                }
                notified.await;
            }
        };

        let drained = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait_idle).await.is_ok(),
            None => {
                wait_idle.await;
                true
            }
        };

        if !drained {
            let limit_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
            let (tokens, queued) = {
                let mut st = self.shared.lock();
                let tokens: Vec<CancellationToken> = st.in_flight.values().cloned().collect();
                (tokens, st.queue.drain())
            };
            warn!(
                pool = %self.shared.name,
                in_flight = tokens.len(),
                queued = queued.len(),
                "Drain timeout, cancelling remaining tasks"
            );
            for token in tokens {
                token.cancel();
            }
            for task in queued {
                task.cancel.cancel();
                let _ = task.respond.send(Err(BraidError::PoolDraining));
            }
            self.shared.shutdown.cancel();
            return Err(BraidError::DrainTimeout(limit_ms));
        }

        self.shared.shutdown.cancel();
        info!(pool = %self.shared.name, "Worker pool drained");
        Ok(())
    }
}

impl<I, O> Drop for WorkerPool<I, O> {
    fn drop(&mut self) {
        self.shared.lock().draining = true;
        self.shared.draining.cancel();
        self.shared.shutdown.cancel();
    }
}

fn spawn_worker<I, O>(shared: &Arc<PoolShared<I, O>>, st: &mut PoolState<I, O>)
where
    I: Send + 'static,
    O: Send + 'static,
{
    let worker_id = st.next_worker;
    st.next_worker += 1;
    st.workers.insert(
        worker_id,
        WorkerSlot {
            busy_with: None,
            started_at: None,
            last_active: Instant::now(),
            flagged_slow: false,
        },
    );
    tokio::spawn(worker_loop(shared.clone(), worker_id));
}

async fn worker_loop<I, O>(shared: Arc<PoolShared<I, O>>, worker_id: usize)
where
    I: Send + 'static,
    O: Send + 'static,
{
    debug!(pool = %shared.name, worker_id, "Worker started");

    loop {
        let next = {
            let mut st = shared.lock();
            match st.queue.pop() {
                Some(task) => {
                    st.work_steals += 1;
                    st.in_flight.insert(task.seq, task.cancel.clone());
                    if let Some(slot) = st.workers.get_mut(&worker_id) {
                        slot.busy_with = Some(task.id.clone());
                        slot.started_at = Some(Instant::now());
                    }
                    Some(task)
                }
                None if st.draining => {
                    st.workers.remove(&worker_id);
                    if st.is_idle() {
                        shared.idle.notify_waiters();
                    }
                    debug!(pool = %shared.name, worker_id, "Worker exiting, pool draining");
                    return;
                }
                None => None,
            }
        };

        if let Some(task) = next {
            run_task(&shared, worker_id, task).await;
            continue;
        }

        tokio::select! {
            _ = shared.work_ready.notified() => {}
            _ = tokio::time::sleep(shared.config.heartbeat()) => {}
            _ = shared.draining.cancelled() => {}
        }

        let mut st = shared.lock();
        let idle_for = st
            .workers
            .get(&worker_id)
            .map(|w| w.last_active.elapsed())
            .unwrap_or_default();
        let over_max = st.workers.len() > st.max_size;
        let idle_expired = idle_for >= shared.config.idle_shrink() && st.workers.len() > st.min_size;
        if st.queue.is_empty() && !st.draining && (over_max || idle_expired) {
            st.workers.remove(&worker_id);
            info!(
                pool = %shared.name,
                worker_id,
                idle_ms = idle_for.as_millis() as u64,
                remaining = st.workers.len(),
                "Retiring idle worker"
            );
            return;
        }
    }
}

async fn run_task<I, O>(shared: &Arc<PoolShared<I, O>>, worker_id: usize, task: QueuedTask<I, O>)
where
    I: Send + 'static,
    O: Send + 'static,
{
    let QueuedTask {
        id,
        input,
        seq,
        submitted_at,
        cancel,
        respond,
        ..
    } = task;

    let started = Instant::now();
    let timeout = shared.config.task_timeout();

    let outcome = if cancel.is_cancelled() {
        Outcome::Cancelled
    } else {
        // The work runs on its own task so a unit that ignores its
        // cancellation signal can't hold this worker hostage.
        let work = tokio::spawn((shared.run)(input, cancel.clone()));
        tokio::select! {
            joined = work => match joined {
                Ok(result) => Outcome::Finished(result),
                Err(e) => Outcome::Finished(Err(BraidError::NodeFailed {
                    node: id.clone(),
                    message: format!("task panicked: {}", e),
                })),
            },
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                Outcome::TimedOut
            }
            _ = cancel.cancelled() => Outcome::Cancelled,
        }
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let result = match outcome {
        Outcome::Finished(result) => result,
        Outcome::TimedOut => {
            warn!(pool = %shared.name, task = %id, timeout_ms = timeout.as_millis() as u64, "Task timed out");
            Err(BraidError::TaskTimeout {
                task: id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
        Outcome::Cancelled => {
            debug!(pool = %shared.name, task = %id, "Task cancelled");
            Err(BraidError::Cancelled(id.clone()))
        }
    };

    {
        let mut st = shared.lock();
        st.in_flight.remove(&seq);
        if let Some(slot) = st.workers.get_mut(&worker_id) {
            slot.busy_with = None;
            slot.started_at = None;
            slot.flagged_slow = false;
            slot.last_active = Instant::now();
        }
        match &result {
            Ok(_) => st.completed += 1,
            Err(e) => {
                st.failed += 1;
                if matches!(e, BraidError::TaskTimeout { .. }) {
                    st.timed_out += 1;
                }
            }
        }
        st.record_latency(elapsed_ms);
        if st.is_idle() {
            shared.idle.notify_waiters();
        }
    }

    debug!(
        pool = %shared.name,
        task = %id,
        worker_id,
        elapsed_ms,
        queued_ms = started.duration_since(submitted_at).as_millis() as u64,
        ok = result.is_ok(),
        "Task finished"
    );

    // Receiver may be gone if the caller stopped caring
    let _ = respond.send(result);
}

/// Idle and slow-worker bookkeeping. Never dequeues or dispatches anything.
async fn heartbeat_loop<I, O>(shared: Arc<PoolShared<I, O>>) {
    let interval = shared.config.heartbeat();
    let slow_after = shared.config.task_timeout() / 2;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shared.shutdown.cancelled() => break,
        }

        let mut st = shared.lock();
        for (worker_id, slot) in st.workers.iter_mut() {
            let Some(started) = slot.started_at else { continue };
            if !slot.flagged_slow && started.elapsed() >= slow_after {
                slot.flagged_slow = true;
                warn!(
                    pool = %shared.name,
                    worker_id = *worker_id,
                    task = slot.busy_with.as_deref().unwrap_or_default(),
                    running_ms = started.elapsed().as_millis() as u64,
                    "Slow worker"
                );
            }
        }
    }
    debug!(pool = %shared.name, "Pool heartbeat stopped");
}
