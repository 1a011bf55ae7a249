use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use braid_core::error::{BraidError, Result};
use braid_core::types::NodeResult;

type OnPartial = Box<dyn Fn(&[NodeResult]) + Send + Sync>;
type Settle = oneshot::Sender<Result<Vec<NodeResult>>>;

struct ForkState {
    results: Vec<NodeResult>,
    failures: Vec<(String, String)>,
    reported: HashSet<String>,
    settle: Option<Settle>,
}

struct ForkShared {
    fork_id: String,
    members: Vec<String>,
    min_results: usize,
    state: Mutex<ForkState>,
    on_partial: OnPartial,
    timer: CancellationToken,
}

impl ForkShared {
    fn lock(&self) -> MutexGuard<'_, ForkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn total(&self) -> usize {
        self.members.len()
    }

    /// Failures that can still be absorbed while reaching `min_results`.
    fn tolerated_failures(&self) -> usize {
        self.total() - self.min_results
    }

    fn settle(&self, settle: Option<Settle>, outcome: Result<Vec<NodeResult>>) {
        let Some(tx) = settle else { return };
        self.timer.cancel();
        match &outcome {
            Ok(results) => info!(
                fork_id = %self.fork_id,
                results = results.len(),
                members = self.total(),
                "Fork settled"
            ),
            Err(e) => warn!(fork_id = %self.fork_id, error = %e, "Fork rejected"),
        }
        let _ = tx.send(outcome);
    }

    fn on_timeout(&self) {
        let (settle, outcome) = {
            let mut st = self.lock();
            let Some(settle) = st.settle.take() else { return };
            let outcome = if st.results.len() >= self.min_results {
                Ok(st.results.clone())
            } else {
                Err(BraidError::ForkFailed {
                    fork: self.fork_id.clone(),
                    reason: format!(
                        "timed out with {}/{} required results",
                        st.results.len(),
                        self.min_results
                    ),
                })
            };
            (Some(settle), outcome)
        };
        self.settle(settle, outcome);
    }
}

/// Resolves once the fork group it belongs to settles.
pub struct ForkSettlement {
    fork_id: String,
    rx: oneshot::Receiver<Result<Vec<NodeResult>>>,
}

impl ForkSettlement {
    pub async fn wait(self) -> Result<Vec<NodeResult>> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BraidError::ForkFailed {
                fork: self.fork_id,
                reason: "coordinator dropped before settling".into(),
            }),
        }
    }
}

/// Settles a fan-out group exactly once.
///
/// Resolves with every result when all members have reported, rejects as soon
/// as failures make `min_results` unreachable, and on timeout resolves with
/// whatever has accumulated if that meets `min_results`.
pub struct ForkCoordinator {
    shared: Arc<ForkShared>,
}

impl ForkCoordinator {
    /// Create a coordinator and start its timeout. Must be called inside a
    /// tokio runtime.
    pub fn new(
        fork_id: impl Into<String>,
        members: Vec<String>,
        timeout: Duration,
        min_results: usize,
        on_partial: impl Fn(&[NodeResult]) + Send + Sync + 'static,
    ) -> Result<(Self, ForkSettlement)> {
        let fork_id = fork_id.into();
        if members.is_empty() {
            return Err(BraidError::InvalidFork {
                fork: fork_id,
                reason: "no members".into(),
            });
        }
        if min_results == 0 || min_results > members.len() {
            return Err(BraidError::InvalidFork {
                fork: fork_id,
                reason: format!(
                    "min_results {} must be between 1 and {}",
                    min_results,
                    members.len()
                ),
            });
        }

        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(ForkShared {
            fork_id: fork_id.clone(),
            members,
            min_results,
            state: Mutex::new(ForkState {
                results: Vec::new(),
                failures: Vec::new(),
                reported: HashSet::new(),
                settle: Some(tx),
            }),
            on_partial: Box::new(on_partial),
            timer: CancellationToken::new(),
        });

        let timer_shared = shared.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    debug!(fork_id = %timer_shared.fork_id, "Fork timeout elapsed");
                    timer_shared.on_timeout();
                }
                _ = timer_shared.timer.cancelled() => {}
            }
        });

        debug!(
            fork_id = %fork_id,
            members = shared.total(),
            min_results,
            timeout_ms = timeout.as_millis() as u64,
            "Fork coordinator started"
        );

        Ok((Self { shared }, ForkSettlement { fork_id, rx }))
    }

    pub fn fork_id(&self) -> &str {
        &self.shared.fork_id
    }

    pub fn members(&self) -> &[String] {
        &self.shared.members
    }

    /// Record a member's successful completion.
    pub fn on_node_complete(&self, result: NodeResult) {
        let (partial, settle, outcome) = {
            let mut st = self.shared.lock();
            if st.settle.is_none() || !self.accept(&mut st, &result.node_id) {
                return;
            }
            st.results.push(result);
            let partial = st.results.clone();

            if st.results.len() + st.failures.len() == self.shared.total() {
                (partial, st.settle.take(), Ok(st.results.clone()))
            } else {
                (partial, None, Ok(Vec::new()))
            }
        };

        (self.shared.on_partial)(&partial);
        self.shared.settle(settle, outcome);
    }

    /// Record a member's failure.
    pub fn on_node_error(&self, member_id: &str, error: &BraidError) {
        let (settle, outcome) = {
            let mut st = self.shared.lock();
            if st.settle.is_none() || !self.accept(&mut st, member_id) {
                return;
            }
            st.failures.push((member_id.to_string(), error.to_string()));
            debug!(
                fork_id = %self.shared.fork_id,
                member = member_id,
                failures = st.failures.len(),
                "Fork member failed"
            );

            if st.failures.len() > self.shared.tolerated_failures() {
                let reason = format!(
                    "{} of {} members failed, {} results required (last: {})",
                    st.failures.len(),
                    self.shared.total(),
                    self.shared.min_results,
                    error
                );
                let outcome = Err(BraidError::ForkFailed {
                    fork: self.shared.fork_id.clone(),
                    reason,
                });
                (st.settle.take(), outcome)
            } else if st.results.len() + st.failures.len() == self.shared.total() {
                (st.settle.take(), Ok(st.results.clone()))
            } else {
                (None, Ok(Vec::new()))
            }
        };
        self.shared.settle(settle, outcome);
    }

    pub fn is_settled(&self) -> bool {
        self.shared.lock().settle.is_none()
    }

    /// Cancel the pending timer. Safe to call more than once.
    pub fn dispose(&self) {
        self.shared.timer.cancel();
    }

    /// Only known members count, and each only once.
    fn accept(&self, st: &mut ForkState, member_id: &str) -> bool {
        if !self.shared.members.iter().any(|m| m == member_id) {
            warn!(fork_id = %self.shared.fork_id, member = member_id, "Report from unknown fork member ignored");
            return false;
        }
        st.reported.insert(member_id.to_string())
    }
}

impl Drop for ForkCoordinator {
    fn drop(&mut self) {
        self.dispose();
    }
}
