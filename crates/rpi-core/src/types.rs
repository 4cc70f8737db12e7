//! Core types for phased orchestration.
//!
//! Phases, verdicts, failure classes and terminal statuses are closed
//! enumerations; free-text values from agents and reports are normalized
//! into them at the boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("unknown phase: {0:?} (valid: discovery, implementation, validation)")]
    UnknownPhase(String),
    #[error("invalid phase number: {0}")]
    InvalidPhaseNumber(u32),
    #[error("invalid runtime {0:?} (valid: auto|direct|stream)")]
    InvalidRuntime(String),
}

// --- Phases ---

/// One of the three sequential stages of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discovery,
    Implementation,
    Validation,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Discovery, Phase::Implementation, Phase::Validation];
    pub const LAST: Phase = Phase::Validation;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Implementation => "implementation",
            Self::Validation => "validation",
        }
    }

    /// 1-based phase number as persisted in run state.
    pub fn number(self) -> u32 {
        match self {
            Self::Discovery => 1,
            Self::Implementation => 2,
            Self::Validation => 3,
        }
    }

    pub fn from_number(n: u32) -> Result<Self, TypeError> {
        match n {
            1 => Ok(Self::Discovery),
            2 => Ok(Self::Implementation),
            3 => Ok(Self::Validation),
            other => Err(TypeError::InvalidPhaseNumber(other)),
        }
    }

    /// Resolve a phase name or one of its legacy aliases.
    pub fn parse(name: &str) -> Result<Self, TypeError> {
        match name.trim().to_lowercase().as_str() {
            "discovery" | "research" | "plan" | "pre-mortem" | "premortem" | "pre_mortem" => {
                Ok(Self::Discovery)
            }
            "implementation" | "crank" | "implement" => Ok(Self::Implementation),
            "validation" | "vibe" | "validate" | "post-mortem" | "postmortem" | "post_mortem" => {
                Ok(Self::Validation)
            }
            _ => Err(TypeError::UnknownPhase(name.to_string())),
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Discovery => Some(Self::Implementation),
            Self::Implementation => Some(Self::Validation),
            Self::Validation => None,
        }
    }

    /// Key under which retry attempts for this phase are counted.
    pub fn attempt_key(self) -> String {
        format!("phase_{}", self.number())
    }

    /// Phases from `self` through the last phase, in order.
    pub fn remaining(self) -> impl Iterator<Item = Phase> {
        Self::ALL.into_iter().filter(move |p| *p >= self)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// --- Verdicts ---

/// Normalized gate verdict.
///
/// Council reports emit PASS/WARN/FAIL, the work tracker yields
/// DONE/BLOCKED/PARTIAL, and transport outcomes surface as
/// TIMEOUT/STALL/EXIT_ERROR. Anything else is kept verbatim (upper-cased).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Verdict {
    Pass,
    Warn,
    Fail,
    Done,
    Blocked,
    Partial,
    Timeout,
    Stall,
    ExitError,
    Other(String),
}

impl Verdict {
    /// Trim and upper-case before matching so equivalent spellings collapse.
    pub fn normalize(raw: &str) -> Self {
        let upper = raw.trim().to_uppercase();
        match upper.as_str() {
            "PASS" => Self::Pass,
            "WARN" => Self::Warn,
            "FAIL" => Self::Fail,
            "DONE" => Self::Done,
            "BLOCKED" => Self::Blocked,
            "PARTIAL" => Self::Partial,
            "TIMEOUT" => Self::Timeout,
            "STALL" => Self::Stall,
            "EXIT_ERROR" => Self::ExitError,
            _ => Self::Other(upper),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
            Self::Done => "DONE",
            Self::Blocked => "BLOCKED",
            Self::Partial => "PARTIAL",
            Self::Timeout => "TIMEOUT",
            Self::Stall => "STALL",
            Self::ExitError => "EXIT_ERROR",
            Self::Other(s) => s,
        }
    }

    /// Whether the run may advance past the gate.
    pub fn is_passing(&self) -> bool {
        matches!(self, Self::Pass | Self::Warn | Self::Done)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Failure classification ---

/// Canonical lowercase failure class used as the escalation reason.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailureClass {
    PreMortemFail,
    CrankBlocked,
    CrankPartial,
    VibeFail,
    Timeout,
    Stall,
    ExitError,
    /// Lowercased verdict text for anything outside the table.
    Other(String),
}

impl FailureClass {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PreMortemFail => "pre_mortem_fail",
            Self::CrankBlocked => "crank_blocked",
            Self::CrankPartial => "crank_partial",
            Self::VibeFail => "vibe_fail",
            Self::Timeout => "timeout",
            Self::Stall => "stall",
            Self::ExitError => "exit_error",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do after a gate failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    Retry,
    Escalate,
}

impl GateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Escalate => "escalate",
        }
    }
}

// --- Run lifecycle ---

/// Terminal status persisted in run state. `Active` serializes as `""`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    #[default]
    #[serde(rename = "")]
    Active,
    Completed,
    Failed,
    Interrupted,
    Stale,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
            Self::Stale => "stale",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Active
    }
}

/// Status shown to operators, derived from persisted state and liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
    Stale,
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
            Self::Stale => "stale",
            Self::Unknown => "unknown",
        }
    }
}

// --- Executors ---

/// Requested runtime mode for phase execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    #[default]
    Auto,
    Direct,
    Stream,
}

impl RuntimeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Direct => "direct",
            Self::Stream => "stream",
        }
    }

    /// Trim and lowercase; empty means `auto`.
    pub fn parse(raw: &str) -> Result<Self, TypeError> {
        match raw.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "direct" => Ok(Self::Direct),
            "stream" => Ok(Self::Stream),
            _ => Err(TypeError::InvalidRuntime(raw.to_string())),
        }
    }
}

impl FromStr for RuntimeMode {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// --- Processes ---

/// One row of a process-table snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    pub command: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_aliases_resolve() {
        assert_eq!(Phase::parse("research").unwrap(), Phase::Discovery);
        assert_eq!(Phase::parse("Pre-Mortem").unwrap(), Phase::Discovery);
        assert_eq!(Phase::parse(" crank ").unwrap(), Phase::Implementation);
        assert_eq!(Phase::parse("post_mortem").unwrap(), Phase::Validation);
        assert_eq!(Phase::parse("vibe").unwrap(), Phase::Validation);
    }

    #[test]
    fn unknown_phase_lists_valid_names() {
        let err = Phase::parse("deploy").unwrap_err();
        assert_eq!(
            err.to_string(),
            "unknown phase: \"deploy\" (valid: discovery, implementation, validation)"
        );
    }

    #[test]
    fn phase_numbering_round_trips() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_number(phase.number()).unwrap(), phase);
        }
        assert!(Phase::from_number(0).is_err());
        assert!(Phase::from_number(4).is_err());
    }

    #[test]
    fn remaining_starts_at_phase() {
        let rest: Vec<_> = Phase::Implementation.remaining().collect();
        assert_eq!(rest, vec![Phase::Implementation, Phase::Validation]);
        assert_eq!(Phase::Validation.next(), None);
    }

    #[test]
    fn verdict_normalizes_case_and_whitespace() {
        assert_eq!(Verdict::normalize(" fail "), Verdict::Fail);
        assert_eq!(Verdict::normalize("Blocked"), Verdict::Blocked);
        assert_eq!(Verdict::normalize("exit_error"), Verdict::ExitError);
        assert_eq!(Verdict::normalize("weird"), Verdict::Other("WEIRD".into()));
        assert!(Verdict::normalize("warn").is_passing());
        assert!(!Verdict::normalize("partial").is_passing());
    }

    #[test]
    fn terminal_status_serializes_active_as_empty() {
        let json = serde_json::to_string(&TerminalStatus::Active).unwrap();
        assert_eq!(json, "\"\"");
        let parsed: TerminalStatus = serde_json::from_str("\"interrupted\"").unwrap();
        assert_eq!(parsed, TerminalStatus::Interrupted);
        assert!(parsed.is_terminal());
    }

    #[test]
    fn runtime_mode_parse() {
        assert_eq!(RuntimeMode::parse("").unwrap(), RuntimeMode::Auto);
        assert_eq!(RuntimeMode::parse(" STREAM ").unwrap(), RuntimeMode::Stream);
        let err = RuntimeMode::parse("tmux").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid runtime \"tmux\" (valid: auto|direct|stream)"
        );
    }
}
