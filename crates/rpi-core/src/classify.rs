//! Gate failure classification and retry decisions.
//!
//! The table is keyed by (phase, normalized verdict) and is total: every
//! verdict not named for a phase falls through to its lowercased text.

use crate::types::{FailureClass, GateAction, Phase, Verdict};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One structured finding lifted from a council report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub description: String,
    pub fix: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

/// A gate that did not pass at the end of a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateFailure {
    pub phase: Phase,
    /// Raw verdict text as reported.
    pub verdict: String,
    /// Report the verdict came from (path or command).
    pub report: String,
    pub findings: Vec<Finding>,
    /// Underlying error text, if the failure came from execution.
    pub error: Option<String>,
}

impl GateFailure {
    pub fn new(phase: Phase, verdict: impl Into<String>, report: impl Into<String>) -> Self {
        Self {
            phase,
            verdict: verdict.into(),
            report: report.into(),
            findings: Vec::new(),
            error: None,
        }
    }

    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.findings = findings;
        self
    }

    pub fn class(&self) -> FailureClass {
        classify(self.phase, &Verdict::normalize(&self.verdict))
    }
}

impl fmt::Display for GateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gate FAIL at phase {}: {} (report: {})",
            self.phase.number(),
            self.verdict,
            self.report
        )
    }
}

impl std::error::Error for GateFailure {}

/// Map a normalized verdict at a phase to its failure class.
pub fn classify(phase: Phase, verdict: &Verdict) -> FailureClass {
    match (phase, verdict) {
        (Phase::Discovery, Verdict::Fail) => FailureClass::PreMortemFail,
        (Phase::Implementation, Verdict::Blocked) => FailureClass::CrankBlocked,
        (Phase::Implementation, Verdict::Partial) => FailureClass::CrankPartial,
        (Phase::Validation, Verdict::Fail) => FailureClass::VibeFail,
        (_, Verdict::Timeout) => FailureClass::Timeout,
        (_, Verdict::Stall) => FailureClass::Stall,
        (_, Verdict::ExitError) => FailureClass::ExitError,
        (_, other) => FailureClass::Other(other.as_str().to_lowercase()),
    }
}

/// Convenience wrapper over raw verdict text.
pub fn classify_raw(phase: Phase, raw_verdict: &str) -> FailureClass {
    classify(phase, &Verdict::normalize(raw_verdict))
}

/// Retry while the attempt count is under the budget, else escalate.
pub fn decide(attempt: u32, max_retries: u32) -> GateAction {
    if attempt >= max_retries {
        GateAction::Escalate
    } else {
        GateAction::Retry
    }
}

/// Outcome of classifying one gate failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    pub class: FailureClass,
    pub action: GateAction,
    pub attempt: u32,
    pub max_retries: u32,
}

impl RetryDecision {
    pub fn evaluate(failure: &GateFailure, attempt: u32, max_retries: u32) -> Self {
        Self {
            class: failure.class(),
            action: decide(attempt, max_retries),
            attempt,
            max_retries,
        }
    }
}
