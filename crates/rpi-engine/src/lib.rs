//! rpi - phased orchestration engine
//!
//! Drives discovery, implementation and validation as isolated agent
//! sessions in a per-run git worktree, gates each phase, and supervises
//! the processes a run leaves behind.

pub mod cleanup;
pub mod engine;
pub mod executor;
pub mod gate;
pub mod git;
pub mod lease;
pub mod live_status;
pub mod process;
pub mod roots;
pub mod supervisor;
pub mod worktree;

pub use engine::{EngineError, PhasedEngine, RunSummary};
pub use executor::{DirectExecutor, FallbackExecutor, PhaseExecutor, StreamExecutor};
pub use gate::{CouncilGate, PhaseGate, WorkTracker};
pub use supervisor::{cancel_runs, CancelOptions, CancelReport};
pub use worktree::{Worktree, WorktreeManager};
