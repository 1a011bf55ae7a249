use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use braid_core::config::{RestartIntensity, RestartStrategy, SupervisorConfig};
use braid_core::error::{BraidError, Result};
use braid_core::traits::SupervisedChild;

/// Default time a stopped child gets to unwind before it is aborted.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// When a child that stopped gets restarted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Always.
    #[default]
    Permanent,
    /// Only after a crash.
    Transient,
    /// Never.
    Temporary,
}

impl RestartPolicy {
    fn should_restart(&self, crashed: bool) -> bool {
        match self {
            Self::Permanent => true,
            Self::Transient => crashed,
            Self::Temporary => false,
        }
    }
}

/// A child as declared to the supervisor.
#[derive(Clone)]
pub struct ChildSpec {
    pub id: String,
    pub child: Arc<dyn SupervisedChild>,
    pub restart: RestartPolicy,
}

impl ChildSpec {
    pub fn new(id: impl Into<String>, child: Arc<dyn SupervisedChild>) -> Self {
        Self {
            id: id.into(),
            child,
            restart: RestartPolicy::default(),
        }
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorStatus {
    Idle,
    Running,
    /// Cancelled, or every child finished for good.
    Stopped,
    /// Gave up after exceeding its restart intensity.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChildStats {
    pub id: String,
    pub restarts: u32,
    pub running: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStats {
    pub id: String,
    pub status: SupervisorStatus,
    pub strategy: RestartStrategy,
    /// Restart decisions taken, each counted once however many children it touched.
    pub total_restarts: u32,
    pub children: Vec<ChildStats>,
}

/// Builds an [`AgentSupervisor`].
pub struct SupervisorBuilder {
    id: String,
    strategy: RestartStrategy,
    intensity: RestartIntensity,
    shutdown_grace: Duration,
    children: Vec<ChildSpec>,
}

impl SupervisorBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            strategy: RestartStrategy::default(),
            intensity: RestartIntensity::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            children: Vec::new(),
        }
    }

    /// Start from the `[supervisor]` config section.
    pub fn from_config(id: impl Into<String>, config: &SupervisorConfig) -> Self {
        Self::new(id)
            .strategy(config.strategy)
            .intensity(config.intensity)
    }

    pub fn strategy(mut self, strategy: RestartStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn intensity(mut self, intensity: RestartIntensity) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Add a child. Children start in the order they are added.
    pub fn child(mut self, spec: ChildSpec) -> Self {
        self.children.push(spec);
        self
    }

    pub fn build(self) -> Result<AgentSupervisor> {
        if self.intensity.window_ms == 0 {
            return Err(BraidError::Config(format!(
                "supervisor '{}': restart window must be positive",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for spec in &self.children {
            if !seen.insert(spec.id.as_str()) {
                return Err(BraidError::Validation(format!(
                    "supervisor '{}': duplicate child '{}'",
                    self.id, spec.id
                )));
            }
        }

        let children = self
            .children
            .iter()
            .map(|spec| ChildStats {
                id: spec.id.clone(),
                restarts: 0,
                running: false,
                last_error: None,
            })
            .collect();

        Ok(AgentSupervisor {
            id: self.id,
            strategy: self.strategy,
            intensity: self.intensity,
            shutdown_grace: self.shutdown_grace,
            specs: self.children,
            state: Mutex::new(SupervisorState {
                status: SupervisorStatus::Idle,
                total_restarts: 0,
                children,
            }),
        })
    }
}

struct SupervisorState {
    status: SupervisorStatus,
    total_restarts: u32,
    children: Vec<ChildStats>,
}

struct ChildExit {
    index: usize,
    generation: u64,
    outcome: Result<()>,
}

/// Live handle on one started child.
struct Running {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Children still owned by one `run` call.
///
/// Dropping it cancels and aborts every remaining child and leaves the
/// supervisor `Stopped` unless `run` already recorded another final status.
struct RunGuard<'a> {
    supervisor: &'a AgentSupervisor,
    slots: Vec<Option<Running>>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.supervisor.lock();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(running) = slot.take() {
                running.cancel.cancel();
                running.task.abort();
                st.children[index].running = false;
                debug!(supervisor = %self.supervisor.id, child = %self.supervisor.specs[index].id, "Child aborted on supervisor exit");
            }
        }
        if st.status == SupervisorStatus::Running {
            st.status = SupervisorStatus::Stopped;
            debug!(supervisor = %self.supervisor.id, "Supervisor run dropped, marked stopped");
        }
    }
}

/// Supervises long-lived children, restarting them per strategy.
///
/// More than `max_restarts` restart decisions within the rolling window make
/// the supervisor stop every child and fail with
/// [`BraidError::RestartIntensityExceeded`]. A supervisor is itself a
/// [`SupervisedChild`], so a parent sees that failure as an ordinary crash.
pub struct AgentSupervisor {
    id: String,
    strategy: RestartStrategy,
    intensity: RestartIntensity,
    shutdown_grace: Duration,
    specs: Vec<ChildSpec>,
    state: Mutex<SupervisorState>,
}

impl AgentSupervisor {
    pub fn builder(id: impl Into<String>) -> SupervisorBuilder {
        SupervisorBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> SupervisorStats {
        let st = self.lock();
        SupervisorStats {
            id: self.id.clone(),
            status: st.status,
            strategy: self.strategy,
            total_restarts: st.total_restarts,
            children: st.children.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run every child until `cancel` is raised, every child has finished for
    /// good, or the restart intensity is exceeded.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        {
            let mut st = self.lock();
            if st.status == SupervisorStatus::Running {
                return Err(BraidError::SupervisorRunning(self.id.clone()));
            }
            st.status = SupervisorStatus::Running;
        }
        info!(supervisor = %self.id, children = self.specs.len(), strategy = ?self.strategy, "Supervisor started");

        // Owns the live children from here on, so dropping this future
        // mid-await still tears them down.
        let mut guard = RunGuard {
            supervisor: self,
            slots: self.specs.iter().map(|_| None).collect(),
        };
        let slots = &mut guard.slots;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut next_generation = 0u64;
        let mut recent: VecDeque<Instant> = VecDeque::new();

        for index in 0..self.specs.len() {
            slots[index] = Some(self.start_child(index, &mut next_generation, &tx));
        }

        loop {
            if slots.iter().all(Option::is_none) {
                self.lock().status = SupervisorStatus::Stopped;
                info!(supervisor = %self.id, "All children finished, supervisor stopping");
                return Ok(());
            }

            let exit = tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop_children(slots, 0).await;
                    self.lock().status = SupervisorStatus::Stopped;
                    info!(supervisor = %self.id, "Supervisor cancelled");
                    return Ok(());
                }
                exit = rx.recv() => exit,
            };
            // `tx` lives in this frame, so recv never yields None
            let Some(exit) = exit else { continue };

            // Exits of children stopped on purpose are stale
            let current = slots[exit.index].as_ref().map(|r| r.generation);
            if current != Some(exit.generation) {
                continue;
            }
            if let Some(done) = slots[exit.index].take() {
                done.task.abort();
            }

            let spec = &self.specs[exit.index];
            let crashed = exit.outcome.is_err();
            {
                let mut st = self.lock();
                let child = &mut st.children[exit.index];
                child.running = false;
                if let Err(e) = &exit.outcome {
                    child.last_error = Some(e.to_string());
                }
            }
            match &exit.outcome {
                Ok(()) => info!(supervisor = %self.id, child = %spec.id, "Child exited"),
                Err(e) => warn!(supervisor = %self.id, child = %spec.id, error = %e, "Child crashed"),
            }

            if !spec.restart.should_restart(crashed) {
                debug!(supervisor = %self.id, child = %spec.id, policy = ?spec.restart, "Child not restarted");
                continue;
            }

            let now = Instant::now();
            recent.push_back(now);
            while recent
                .front()
                .is_some_and(|t| now.duration_since(*t) > self.intensity.window())
            {
                recent.pop_front();
            }
            if recent.len() > self.intensity.max_restarts as usize {
                self.stop_children(slots, 0).await;
                self.lock().status = SupervisorStatus::Failed;
                error!(
                    supervisor = %self.id,
                    max_restarts = self.intensity.max_restarts,
                    window_ms = self.intensity.window_ms,
                    "Restart intensity exceeded, supervisor giving up"
                );
                return Err(BraidError::RestartIntensityExceeded {
                    supervisor: self.id.clone(),
                    max_restarts: self.intensity.max_restarts,
                    window_ms: self.intensity.window_ms,
                });
            }

            let restart: Vec<usize> = match self.strategy {
                RestartStrategy::OneForOne => vec![exit.index],
                RestartStrategy::OneForAll => {
                    let mut group: Vec<usize> = slots
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| s.is_some())
                        .map(|(i, _)| i)
                        .collect();
                    self.stop_children(slots, 0).await;
                    group.push(exit.index);
                    group.sort_unstable();
                    group
                }
                RestartStrategy::RestForOne => {
                    let mut group: Vec<usize> = (exit.index + 1..slots.len())
                        .filter(|i| slots[*i].is_some())
                        .collect();
                    self.stop_children(slots, exit.index + 1).await;
                    group.push(exit.index);
                    group.sort_unstable();
                    group
                }
            };

            {
                let mut st = self.lock();
                st.total_restarts += 1;
                for index in &restart {
                    st.children[*index].restarts += 1;
                }
            }
            info!(
                supervisor = %self.id,
                child = %spec.id,
                restarting = restart.len(),
                "Restarting children"
            );
            for index in restart {
                slots[index] = Some(self.start_child(index, &mut next_generation, &tx));
            }
        }
    }

    fn start_child(
        &self,
        index: usize,
        next_generation: &mut u64,
        tx: &mpsc::UnboundedSender<ChildExit>,
    ) -> Running {
        let generation = *next_generation;
        *next_generation += 1;

        let spec = &self.specs[index];
        let cancel = CancellationToken::new();
        let child = spec.child.clone();
        let token = cancel.clone();
        let tx = tx.clone();
        let task = tokio::spawn(async move {
            let outcome = child.run(token).await;
            let _ = tx.send(ChildExit {
                index,
                generation,
                outcome,
            });
        });

        self.lock().children[index].running = true;
        debug!(supervisor = %self.id, child = %spec.id, generation, "Child started");
        Running {
            generation,
            cancel,
            task,
        }
    }

    /// Stop running children from `from` onward, last started first.
    async fn stop_children(&self, slots: &mut [Option<Running>], from: usize) {
        for index in (from..slots.len()).rev() {
            // The handle stays in its slot until the child is gone
            let Some(running) = slots[index].as_mut() else { continue };
            running.cancel.cancel();
            let ignored = tokio::time::timeout(self.shutdown_grace, &mut running.task)
                .await
                .is_err();
            if ignored {
                warn!(supervisor = %self.id, child = %self.specs[index].id, "Child ignored shutdown, aborting");
                running.task.abort();
                // Resolves once the child's future has been dropped
                let _ = (&mut running.task).await;
            }
            slots[index] = None;
            self.lock().children[index].running = false;
            debug!(supervisor = %self.id, child = %self.specs[index].id, "Child stopped");
        }
    }
}

impl SupervisedChild for AgentSupervisor {
    fn run(&self, cancel: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(AgentSupervisor::run(self, cancel))
    }
}

impl std::fmt::Debug for AgentSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSupervisor")
            .field("id", &self.id)
            .field("strategy", &self.strategy)
            .field("intensity", &self.intensity)
            .field(
                "children",
                &self.specs.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
