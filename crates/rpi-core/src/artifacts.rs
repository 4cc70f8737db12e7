//! Per-phase artifacts under `.agents/rpi/`.
//!
//! - `phase-<n>-result.json`: structured outcome written after each phase
//! - `phase-<n>-summary.md`: agent-written (or fallback) summary
//! - `phase-<n>-handoff.md`: written by the agent on context degradation

use crate::registry::{write_atomic, RegistryError, RunState, STATE_DIR};
use crate::types::Phase;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const RESULT_SCHEMA_VERSION: u32 = 1;

/// Each injected summary is capped to this many characters.
pub const SUMMARY_CAP: usize = 2000;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize phase result: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("prior phase {phase} result not found at {path}")]
    PriorMissing { phase: u32, path: PathBuf },
    #[error("prior phase {phase} result is malformed: {reason}")]
    PriorMalformed { phase: u32, reason: String },
    #[error("prior phase {phase} has status {status:?} (expected \"completed\")")]
    PriorIncomplete { phase: u32, status: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub schema_version: u32,
    pub run_id: String,
    pub phase: u32,
    pub phase_name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backend: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub verdicts: BTreeMap<String, String>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub completed_at: String,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub duration_seconds: f64,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(n: &u32) -> bool {
    *n == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero_f64(n: &f64) -> bool {
    *n == 0.0
}

/// Artifact paths rooted at an execution directory.
#[derive(Debug, Clone)]
pub struct PhaseArtifacts {
    dir: PathBuf,
}

impl PhaseArtifacts {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join(STATE_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn result_path(&self, phase: Phase) -> PathBuf {
        self.dir.join(format!("phase-{}-result.json", phase.number()))
    }

    pub fn summary_path(&self, phase: Phase) -> PathBuf {
        self.dir.join(format!("phase-{}-summary.md", phase.number()))
    }

    pub fn handoff_path(&self, phase: Phase) -> PathBuf {
        self.dir.join(format!("phase-{}-handoff.md", phase.number()))
    }

    pub fn write_result(&self, result: &PhaseResult) -> Result<PathBuf> {
        let phase = Phase::from_number(result.phase).map_err(RegistryError::from)?;
        let path = self.result_path(phase);
        let data = serde_json::to_vec_pretty(result)?;
        write_atomic(&path, &data)?;
        debug!(path = %path.display(), "phase result written");
        Ok(path)
    }

    /// Require the prior phase's result with status `completed`.
    pub fn validate_prior(&self, prior: Phase) -> Result<()> {
        let path = self.result_path(prior);
        let data = std::fs::read(&path).map_err(|_| ArtifactError::PriorMissing {
            phase: prior.number(),
            path: path.clone(),
        })?;
        let result: PhaseResult =
            serde_json::from_slice(&data).map_err(|e| ArtifactError::PriorMalformed {
                phase: prior.number(),
                reason: e.to_string(),
            })?;
        if result.status != "completed" {
            return Err(ArtifactError::PriorIncomplete {
                phase: prior.number(),
                status: result.status,
            });
        }
        Ok(())
    }

    pub fn handoff_detected(&self, phase: Phase) -> bool {
        self.handoff_path(phase).exists()
    }

    /// Remove summaries, handoffs and results left by an earlier run.
    pub fn clean(&self) {
        for phase in Phase::ALL {
            for path in [
                self.summary_path(phase),
                self.handoff_path(phase),
                self.result_path(phase),
            ] {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    /// Write the fallback summary unless the agent already wrote one.
    /// Returns true when a fallback was written.
    pub fn ensure_summary(&self, state: &RunState, phase: Phase) -> Result<bool> {
        let path = self.summary_path(phase);
        if path.exists() {
            return Ok(false);
        }
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(&path, fallback_summary(state, phase))?;
        Ok(true)
    }

    /// Summaries of phases before `current`, each capped and labelled.
    pub fn read_prior_summaries(&self, current: Phase) -> Option<String> {
        let sections: Vec<String> = Phase::ALL
            .into_iter()
            .take_while(|p| p.number() < current.number())
            .filter_map(|p| {
                let content = std::fs::read_to_string(self.summary_path(p)).ok()?;
                let content = content.trim();
                if content.is_empty() {
                    return None;
                }
                Some(format!(
                    "[Phase {}: {}]\n{}",
                    p.number(),
                    p.as_str(),
                    cap(content, SUMMARY_CAP)
                ))
            })
            .collect();
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }
}

fn cap(content: &str, max: usize) -> String {
    if content.chars().count() <= max {
        return content.to_string();
    }
    let head: String = content.chars().take(max).collect();
    format!("{head}...")
}

/// Mechanical summary used when the agent did not write one.
pub fn fallback_summary(state: &RunState, phase: Phase) -> String {
    let verdict = |key: &str| state.verdicts.get(key).filter(|v| !v.is_empty());
    match phase {
        Phase::Discovery => {
            let mut out = format!("Discovery completed for goal: {}\n", state.goal);
            out.push_str("Research: see .agents/research/ for findings.\n");
            if !state.epic_id.is_empty() {
                out.push_str(&format!("Plan: epic {}", state.epic_id));
                if state.fast_path {
                    out.push_str(" (micro-epic, fast path)");
                }
                out.push('\n');
            }
            if let Some(v) = verdict("pre_mortem") {
                out.push_str(&format!(
                    "Pre-mortem verdict: {v}\nSee .agents/council/*pre-mortem*.md for details."
                ));
            }
            out
        }
        Phase::Implementation => format!(
            "Crank completed for epic {epic}.\nCheck bd children {epic} for issue statuses.",
            epic = state.epic_id
        ),
        Phase::Validation => {
            let mut out = String::new();
            if let Some(v) = verdict("vibe") {
                out.push_str(&format!(
                    "Vibe verdict: {v}\nSee .agents/council/*vibe*.md for details.\n"
                ));
            }
            if let Some(v) = verdict("post_mortem") {
                out.push_str(&format!("Post-mortem verdict: {v}\n"));
            }
            out.push_str(
                "See .agents/council/*post-mortem*.md and .agents/learnings/ for extracted knowledge.",
            );
            out
        }
    }
}
