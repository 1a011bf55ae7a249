use thiserror::Error;

#[derive(Debug, Error)]
pub enum BraidError {
    // Validation errors (raised before execution)
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Edge {from} -> {to} references unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("Graph contains a cycle through: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("Invalid fork group {fork}: {reason}")]
    InvalidFork { fork: String, reason: String },

    #[error("Graph validation failed: {0}")]
    Validation(String),

    // Execution errors
    #[error("Node {node} failed: {message}")]
    NodeFailed { node: String, message: String },

    #[error("Task {task} timed out after {timeout_ms}ms")]
    TaskTimeout { task: String, timeout_ms: u64 },

    #[error("Task {0} cancelled")]
    Cancelled(String),

    #[error("Fork {fork} failed: {reason}")]
    ForkFailed { fork: String, reason: String },

    #[error("Consensus for fork {fork} failed: {message}")]
    Consensus { fork: String, message: String },

    // Pool errors
    #[error("Worker pool is draining")]
    PoolDraining,

    #[error("Worker pool drain timeout after {0}ms")]
    DrainTimeout(u64),

    #[error("Worker pool closed before task {0} finished")]
    PoolClosed(String),

    // Run-level errors
    #[error("Token budget exceeded: {used}/{budget}")]
    BudgetExceeded { used: u64, budget: u64 },

    #[error("Graph deadlock: {completed}/{total} nodes completed and nothing in flight")]
    Deadlock { completed: usize, total: usize },

    #[error("Graph run timed out after {0}ms")]
    GraphTimeout(u64),

    // Supervision errors
    #[error("Supervisor {supervisor} exceeded restart intensity ({max_restarts} in {window_ms}ms)")]
    RestartIntensityExceeded {
        supervisor: String,
        max_restarts: u32,
        window_ms: u64,
    },

    #[error("Child {child} failed: {message}")]
    ChildFailed { child: String, message: String },

    #[error("Supervisor {0} is already running")]
    SupervisorRunning(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BraidError {
    /// Whether this error is a timeout rather than a generic failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::TaskTimeout { .. } | Self::GraphTimeout(_) | Self::DrainTimeout(_)
        )
    }

    /// Whether this error was raised before any execution started.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateNode(_)
                | Self::DanglingEdge { .. }
                | Self::CycleDetected(_)
                | Self::InvalidFork { .. }
                | Self::Validation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BraidError>;
