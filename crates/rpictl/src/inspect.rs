//! Read-only views over run registries.

use chrono::{DateTime, Utc};
use rpi_core::orchestration_log::{read_entries, LogEntry};
use rpi_core::registry::parse_rfc3339;
use rpi_core::{Phase, Registry, RunState, RunStatus};
use rpi_engine::{git, roots};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("no orchestration log at {0}\n  → start a run with: rpi run phased \"<goal>\"")]
    LogMissing(PathBuf),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One run as shown by `rpictl status`.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub run_id: String,
    pub goal: String,
    pub phase: String,
    pub status: RunStatus,
    pub retries: u32,
    pub verdicts: BTreeMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed: Option<Duration>,
    pub root: PathBuf,
    pub worktree: Option<PathBuf>,
    terminal: bool,
}

impl RunRow {
    fn from_state(registry: &Registry, state: &RunState, now: DateTime<Utc>) -> Self {
        let phase = Phase::from_number(state.phase)
            .map_or_else(|_| format!("phase {}", state.phase), |p| p.as_str().to_string());
        Self {
            run_id: state.run_id.clone(),
            goal: state.goal.clone(),
            phase,
            status: registry.derive_status(state, now),
            retries: retries(state),
            verdicts: state.verdicts.clone(),
            started_at: state.started_at(),
            elapsed: elapsed(state, now),
            root: registry.root().to_path_buf(),
            worktree: state.worktree().map(Path::to_path_buf),
            terminal: state.is_terminal(),
        }
    }
}

/// Gate attempts beyond the first, summed over phases.
fn retries(state: &RunState) -> u32 {
    state
        .attempts
        .values()
        .map(|n| n.saturating_sub(1))
        .sum()
}

/// Time from start to termination, or to `now` for runs still open.
fn elapsed(state: &RunState, now: DateTime<Utc>) -> Option<Duration> {
    let start = state.started_at()?;
    let end = parse_rfc3339(&state.terminated_at).unwrap_or(now);
    end.signed_duration_since(start).to_std().ok()
}

/// Every run found in the registries reachable from `cwd`, newest first.
///
/// Worktree runs have a copy of their state in the repository root and
/// in the worktree; the copy with a terminal status wins, else the first
/// one seen.
pub fn collect_runs(cwd: &Path, now: DateTime<Utc>) -> Vec<RunRow> {
    let mut by_id: BTreeMap<String, RunRow> = BTreeMap::new();
    for root in roots::search_roots(cwd) {
        let registry = Registry::new(&root);
        for entry in registry.list_runs() {
            let row = RunRow::from_state(&registry, &entry.state, now);
            match by_id.get(&row.run_id) {
                Some(existing) if existing.terminal || !row.terminal => {}
                _ => {
                    by_id.insert(row.run_id.clone(), row);
                }
            }
        }
    }

    let mut rows: Vec<RunRow> = by_id.into_values().collect();
    rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.run_id.cmp(&b.run_id)));
    rows
}

/// Look up a single run by id.
pub fn find_run(cwd: &Path, run_id: &str, now: DateTime<Utc>) -> Result<RunRow, InspectError> {
    collect_runs(cwd, now)
        .into_iter()
        .find(|r| r.run_id == run_id)
        .ok_or_else(|| InspectError::RunNotFound(run_id.to_string()))
}

/// The orchestration log lives in the repository root so it outlives
/// removed worktrees.
pub fn log_path(cwd: &Path) -> PathBuf {
    let root = git::repo_root(cwd).unwrap_or_else(|_| cwd.to_path_buf());
    Registry::new(root).log_path()
}

pub fn log_entries(cwd: &Path, run_id: Option<&str>) -> Result<Vec<LogEntry>, InspectError> {
    let path = log_path(cwd);
    read_entries(&path, run_id).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            InspectError::LogMissing(path)
        } else {
            InspectError::Io { path, source }
        }
    })
}
