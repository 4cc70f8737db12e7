//! Append-only orchestration log.
//!
//! One line per event: `[<RFC3339>] [<run_id>] <phase>: <details>`. Writes
//! are best effort; a failed append is logged through `tracing` and never
//! interrupts the run.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const FAILURE_CONTEXT_HINT: &str =
    "action: check .agents/rpi/ for phase artifacts, review .agents/council/ for verdicts";

#[derive(Debug, Clone)]
pub struct OrchestrationLog {
    path: PathBuf,
    run_id: String,
}

impl OrchestrationLog {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            run_id: run_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn append(&self, phase: &str, details: &str) {
        let line = format_entry(Utc::now(), &self.run_id, phase, details);
        if let Err(e) = append_line(&self.path, &line) {
            warn!(path = %self.path.display(), error = %e, "could not write orchestration log");
        }
    }

    /// Record an actionable remediation entry for a failure.
    pub fn failure_context(&self, phase: &str, err: &dyn std::fmt::Display) {
        self.append(phase, &format!("FAILURE_CONTEXT: {err} | {FAILURE_CONTEXT_HINT}"));
    }
}

pub fn format_entry(at: DateTime<Utc>, run_id: &str, phase: &str, details: &str) -> String {
    let stamp = at.to_rfc3339_opts(SecondsFormat::Secs, true);
    if run_id.is_empty() {
        format!("[{stamp}] {phase}: {details}\n")
    } else {
        format!("[{stamp}] [{run_id}] {phase}: {details}\n")
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

/// A parsed log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: String,
    pub run_id: Option<String>,
    pub phase: String,
    pub details: String,
}

/// Parse one log line. Lines not in the log format yield `None`.
pub fn parse_entry(line: &str) -> Option<LogEntry> {
    let rest = line.strip_prefix('[')?;
    let (timestamp, rest) = rest.split_once("] ")?;
    let (run_id, rest) = match rest.strip_prefix('[') {
        Some(tagged) => {
            let (id, tail) = tagged.split_once("] ")?;
            (Some(id.to_string()), tail)
        }
        None => (None, rest),
    };
    let (phase, details) = rest.split_once(": ")?;
    Some(LogEntry {
        timestamp: timestamp.to_string(),
        run_id,
        phase: phase.to_string(),
        details: details.trim_end().to_string(),
    })
}

/// Read entries, optionally keeping only one run's lines.
pub fn read_entries(path: &Path, run_id: Option<&str>) -> std::io::Result<Vec<LogEntry>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(parse_entry)
        .filter(|e| run_id.is_none_or(|id| e.run_id.as_deref() == Some(id)))
        .collect())
}
