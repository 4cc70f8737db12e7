pub mod artifacts;
pub mod classify;
pub mod complexity;
pub mod config;
pub mod events;
pub mod orchestration_log;
pub mod prompt;
pub mod registry;
pub mod stream;
pub mod types;

pub use classify::{Finding, GateFailure, RetryDecision};
pub use config::RunOptions;
pub use registry::{Registry, RunState};
pub use types::*;
