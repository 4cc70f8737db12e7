//! Stale-run cleanup.
//!
//! A run is stale when nothing is driving it any more: no terminal status,
//! no recent heartbeat, and not past the last phase. Stale runs are marked
//! `stale` in every copy of their state. Failed or interrupted runs whose
//! worktree survived are not re-marked, only cleaned.

use crate::git::{self, GitError};
use crate::roots::search_roots;
use crate::worktree::{run_id_from_path, WorktreeManager};
use chrono::{DateTime, Utc};
use rpi_core::registry::{parse_rfc3339, Registry, RegistryError};
use rpi_core::types::{Phase, TerminalStatus};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("specify --all or --run-id <id>")]
    NoSelector,
    #[error("git worktree prune: {0}")]
    Prune(#[from] GitError),
}

pub type Result<T> = std::result::Result<T, CleanupError>;

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub run_id: Option<String>,
    pub all: bool,
    pub prune: bool,
    pub dry_run: bool,
    /// Only consider runs at least this old; zero disables the filter.
    pub stale_after: Duration,
    /// Run ids never touched, e.g. the run being resumed.
    pub keep: Vec<String>,
}

/// A run selected for cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupCandidate {
    pub run_id: String,
    pub root: PathBuf,
    pub reason: String,
    pub worktree_path: Option<PathBuf>,
    /// Status the run already had; `Active` means it will be marked stale.
    pub terminal: TerminalStatus,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub candidates: Vec<CleanupCandidate>,
    pub marked: Vec<String>,
    pub removed: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

fn older_than(at: Option<DateTime<Utc>>, min_age: Duration, now: DateTime<Utc>) -> bool {
    if min_age.is_zero() {
        return true;
    }
    at.and_then(|t| now.signed_duration_since(t).to_std().ok())
        .is_some_and(|age| age >= min_age)
}

/// Scan one root's registry for cleanup candidates.
pub fn find_stale_runs(root: &Path, min_age: Duration, now: DateTime<Utc>) -> Vec<CleanupCandidate> {
    let registry = Registry::new(root);
    let mut out = Vec::new();
    for entry in registry.list_runs() {
        let state = entry.state;
        if state.run_id.is_empty() {
            continue;
        }
        let worktree = state.worktree().map(Path::to_path_buf);

        if state.is_terminal() {
            if state.terminal_status == TerminalStatus::Completed {
                continue;
            }
            if !worktree.as_deref().is_some_and(Path::exists) {
                continue;
            }
            let at = parse_rfc3339(&state.terminated_at).or_else(|| state.started_at());
            if !older_than(at, min_age, now) {
                continue;
            }
            let reason = if state.terminal_reason.is_empty() {
                format!("terminal status: {}", state.terminal_status.as_str())
            } else {
                state.terminal_reason.clone()
            };
            out.push(CleanupCandidate {
                run_id: state.run_id.clone(),
                root: root.to_path_buf(),
                reason,
                worktree_path: worktree,
                terminal: state.terminal_status,
            });
            continue;
        }

        if registry.is_live(&state, now) || state.phase >= Phase::LAST.number() {
            continue;
        }
        if !older_than(state.started_at(), min_age, now) {
            continue;
        }
        let reason = if state.worktree_present() {
            "no heartbeat"
        } else {
            "worktree missing"
        };
        out.push(CleanupCandidate {
            run_id: state.run_id.clone(),
            root: root.to_path_buf(),
            reason: reason.to_string(),
            worktree_path: worktree,
            terminal: TerminalStatus::Active,
        });
    }
    out
}

/// The search root that owns `target` as a sibling worktree.
fn owning_repo_root(cwd: &Path, roots: &[PathBuf], target: &Path) -> PathBuf {
    roots
        .iter()
        .filter(|r| r.as_path() != target)
        .find(|r| r.parent() == target.parent() && run_id_from_path(r, target).is_some())
        .cloned()
        .unwrap_or_else(|| git::repo_root(cwd).unwrap_or_else(|_| cwd.to_path_buf()))
}

/// Mark stale runs and remove worktrees left behind.
pub fn run_cleanup(cwd: &Path, opts: &CleanupOptions) -> Result<CleanupReport> {
    let run_id = opts.run_id.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if !opts.all && run_id.is_none() {
        return Err(CleanupError::NoSelector);
    }

    let roots = search_roots(cwd);
    let now = Utc::now();
    let mut seen = HashSet::new();
    let mut report = CleanupReport::default();
    for root in &roots {
        for candidate in find_stale_runs(root, opts.stale_after, now) {
            if run_id.is_some_and(|id| id != candidate.run_id) || opts.keep.contains(&candidate.run_id) {
                continue;
            }
            if seen.insert(candidate.run_id.clone()) {
                report.candidates.push(candidate);
            }
        }
    }

    if report.candidates.is_empty() {
        println!("No stale runs found.");
    }

    for candidate in report.candidates.clone() {
        let live_worktree = candidate.worktree_path.as_deref().filter(|p| p.exists());
        if opts.dry_run {
            if candidate.terminal.is_terminal() {
                println!(
                    "[dry-run] Would clean terminal run {} ({})",
                    candidate.run_id, candidate.reason
                );
            } else {
                println!(
                    "[dry-run] Would mark run {} as stale (reason: {})",
                    candidate.run_id, candidate.reason
                );
            }
            if let Some(path) = live_worktree {
                println!("[dry-run] Would remove worktree: {}", path.display());
            }
            continue;
        }

        if candidate.terminal.is_terminal() {
            println!("Cleaning terminal run {} ({})", candidate.run_id, candidate.reason);
        } else {
            if let Err(e) = mark_stale(&roots, &candidate) {
                let msg = format!("failed to mark run {} as stale: {e}", candidate.run_id);
                warn!("{msg}");
                report.warnings.push(msg);
                continue;
            }
            println!(
                "Marked run {} as stale (reason: {})",
                candidate.run_id, candidate.reason
            );
            report.marked.push(candidate.run_id.clone());
        }

        if let Some(path) = live_worktree {
            let repo_root = owning_repo_root(cwd, &roots, path);
            match WorktreeManager::new(&repo_root).remove(path, &candidate.run_id) {
                Ok(()) => {
                    println!("Removed worktree: {}", path.display());
                    report.removed.push(path.to_path_buf());
                }
                Err(e) => {
                    let msg = format!("could not remove worktree {}: {e}", path.display());
                    warn!("{msg}");
                    report.warnings.push(msg);
                }
            }
        }
    }

    if opts.prune && !opts.dry_run {
        println!("Running: git worktree prune");
        git::prune_worktrees(cwd)?;
    }
    info!(
        candidates = report.candidates.len(),
        marked = report.marked.len(),
        removed = report.removed.len(),
        "cleanup finished"
    );
    Ok(report)
}

/// Mark the run stale in every root that has a copy of it.
fn mark_stale(roots: &[PathBuf], candidate: &CleanupCandidate) -> std::result::Result<(), RegistryError> {
    let mut marked = false;
    let mut last_err = None;
    for root in roots {
        match Registry::new(root).mark_terminal(&candidate.run_id, TerminalStatus::Stale, &candidate.reason) {
            Ok(_) => marked = true,
            Err(RegistryError::NotFound(_)) => {}
            Err(e) => last_err = Some(e),
        }
    }
    match (marked, last_err) {
        (true, _) => Ok(()),
        (false, Some(e)) => Err(e),
        (false, None) => Err(RegistryError::NotFound(
            Registry::new(&candidate.root).run_state_path(&candidate.run_id),
        )),
    }
}
