use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BraidError, Result};

/// Top-level Braid engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub fork: ForkConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Worker pool sizing and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Queue depth above which another worker is started even while some
    /// are idle. A task with no idle worker to take it always gets one.
    #[serde(default = "default_grow_threshold")]
    pub grow_threshold: usize,
    /// A worker idle for this long retires (down to `min_size`).
    #[serde(default = "default_idle_shrink_ms")]
    pub idle_shrink_ms: u64,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            grow_threshold: default_grow_threshold(),
            idle_shrink_ms: default_idle_shrink_ms(),
            task_timeout_ms: default_task_timeout_ms(),
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

impl PoolConfig {
    /// Fixed-size pool with the remaining defaults.
    pub fn fixed(size: usize) -> Self {
        Self {
            min_size: size,
            max_size: size,
            ..Self::default()
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn idle_shrink(&self) -> Duration {
        Duration::from_millis(self.idle_shrink_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(BraidError::Config("pool.max_size must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(BraidError::Config(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

fn default_min_size() -> usize { 1 }
fn default_max_size() -> usize { 4 }
fn default_grow_threshold() -> usize { 4 }
fn default_idle_shrink_ms() -> u64 { 30_000 }
fn default_task_timeout_ms() -> u64 { 120_000 }
fn default_heartbeat_ms() -> u64 { 1_000 }

/// Token budget for a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Total token budget (0 = unlimited).
    #[serde(default)]
    pub max_tokens: u64,
    /// Percentage of budget at which a soft warning is emitted.
    #[serde(default = "default_soft_pct")]
    pub soft_pct: u8,
    /// Percentage of budget at which a hard warning is emitted.
    #[serde(default = "default_hard_pct")]
    pub hard_pct: u8,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: 0,
            soft_pct: default_soft_pct(),
            hard_pct: default_hard_pct(),
        }
    }
}

impl BudgetConfig {
    pub fn with_max_tokens(max_tokens: u64) -> Self {
        Self {
            max_tokens,
            ..Self::default()
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_tokens == 0
    }
}

fn default_soft_pct() -> u8 { 80 }
fn default_hard_pct() -> u8 { 95 }

/// Graph executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Wall-clock limit for a whole run (None = no limit).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Emit a checkpoint every N completions (0 disables).
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    /// How long a failing run waits for in-flight work to unwind.
    #[serde(default = "default_abort_grace_ms")]
    pub abort_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            checkpoint_every: default_checkpoint_every(),
            abort_grace_ms: default_abort_grace_ms(),
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn default_checkpoint_every() -> usize { 5 }
fn default_abort_grace_ms() -> u64 { 100 }

/// Defaults applied to fork groups that don't set their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkConfig {
    #[serde(default = "default_fork_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_min_results")]
    pub min_results: usize,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_fork_timeout_ms(),
            min_results: default_min_results(),
        }
    }
}

fn default_fork_timeout_ms() -> u64 { 60_000 }
fn default_min_results() -> usize { 1 }

/// How a supervisor reacts when one child stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategy {
    /// Restart only the child that stopped.
    #[default]
    OneForOne,
    /// Stop and restart every child.
    OneForAll,
    /// Restart the stopped child and every child declared after it.
    RestForOne,
}

/// Restart-intensity window: more than `max_restarts` within `window_ms`
/// makes the supervisor give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartIntensity {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for RestartIntensity {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            window_ms: default_window_ms(),
        }
    }
}

impl RestartIntensity {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

fn default_max_restarts() -> u32 { 3 }
fn default_window_ms() -> u64 { 5_000 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub strategy: RestartStrategy,
    #[serde(default)]
    pub intensity: RestartIntensity,
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| BraidError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| BraidError::Config(e.to_string()))?;
        config.pool.validate()?;
        Ok(config)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
