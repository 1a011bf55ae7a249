pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{BraidError, Result};
pub use event::EventBus;
pub use traits::{CheckpointStore, ConsensusStrategy, NodeWork, SupervisedChild, WorkContext};
pub use types::*;
