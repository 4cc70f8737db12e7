//! Run discovery and cancellation.
//!
//! Cancellation never talks to the orchestrator directly. It finds every
//! process belonging to a run, signals them, and writes `interrupted` into
//! every persisted copy of the run's state so any later reader (including
//! the orchestrator itself) sees the same outcome.

use crate::lease::read_metadata;
use crate::process::{self, CancelSignal, ProcessError, ProcessLister};
use crate::roots::search_roots;
use chrono::{DateTime, Utc};
use rpi_core::registry::{Registry, RegistryError};
use rpi_core::types::{ProcessInfo, TerminalStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const CANCEL_REASON: &str = "cancelled by rpi cancel";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("specify --all or --run-id <id>")]
    NoSelector,
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("cancel completed with errors: {0}")]
    Partial(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TargetKind {
    /// Found through a registry entry.
    Phased,
    /// Found through an unexpired supervisor lease.
    Supervisor,
    /// Found by matching process command lines.
    LiveScan,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Phased => "phased",
            Self::Supervisor => "supervisor",
            Self::LiveScan => "live-scan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelTarget {
    pub kind: TargetKind,
    pub run_id: String,
    pub root: PathBuf,
    pub state_path: Option<PathBuf>,
    pub lease_path: Option<PathBuf>,
    pub worktree_path: Option<PathBuf>,
    pub pids: Vec<i32>,
}

/// Marker embedded in the names of a run's worktree and sessions.
pub fn run_marker(run_id: &str) -> String {
    format!("rpi-{run_id}")
}

/// Orchestrator pid plus any process mentioning the run's worktree or
/// marker, each with its descendants.
pub fn run_pids(
    orchestrator_pid: i32,
    run_id: &str,
    worktree: Option<&Path>,
    procs: &[ProcessInfo],
) -> Vec<i32> {
    let mut set: BTreeSet<i32> = process::with_descendants(orchestrator_pid, procs)
        .into_iter()
        .collect();
    let marker = run_marker(run_id);
    let worktree = worktree.map(|p| p.display().to_string());
    for p in procs {
        let mentions_worktree = worktree
            .as_deref()
            .is_some_and(|w| !w.is_empty() && p.command.contains(w));
        if p.command.contains(&marker) || mentions_worktree {
            set.extend(process::with_descendants(p.pid, procs));
        }
    }
    set.into_iter().collect()
}

fn registry_targets(
    root: &Path,
    run_id: Option<&str>,
    procs: &[ProcessInfo],
    now: DateTime<Utc>,
) -> Vec<CancelTarget> {
    let registry = Registry::new(root);
    registry
        .list_runs()
        .into_iter()
        .filter(|e| !e.state.run_id.is_empty())
        .filter(|e| !run_id.is_some_and(|id| id != e.state.run_id))
        .filter(|e| !e.state.is_terminal() && registry.is_live(&e.state, now))
        .map(|e| {
            let pids = run_pids(
                e.state.orchestrator_pid,
                &e.state.run_id,
                e.state.worktree(),
                procs,
            );
            CancelTarget {
                kind: TargetKind::Phased,
                run_id: e.state.run_id.clone(),
                root: root.to_path_buf(),
                state_path: Some(e.state_path),
                lease_path: None,
                worktree_path: e.state.worktree().map(Path::to_path_buf),
                pids,
            }
        })
        .collect()
}

fn lease_target(
    root: &Path,
    run_id: Option<&str>,
    procs: &[ProcessInfo],
    now: DateTime<Utc>,
) -> Option<CancelTarget> {
    let path = Registry::new(root).lease_path();
    let meta = read_metadata(&path)?;
    if meta.run_id.is_empty() || meta.pid <= 0 {
        return None;
    }
    if run_id.is_some_and(|id| id != meta.run_id) {
        return None;
    }
    if meta.is_expired(now) {
        debug!(run_id = %meta.run_id, "ignoring expired supervisor lease");
        return None;
    }
    if !process::exists_in(meta.pid, procs) {
        return None;
    }
    Some(CancelTarget {
        kind: TargetKind::Supervisor,
        run_id: meta.run_id,
        root: root.to_path_buf(),
        state_path: None,
        lease_path: Some(path),
        worktree_path: None,
        pids: process::with_descendants(meta.pid, procs),
    })
}

fn live_scan_target(root: &Path, run_id: &str, procs: &[ProcessInfo]) -> Option<CancelTarget> {
    let marker = run_marker(run_id);
    let pids: BTreeSet<i32> = procs
        .iter()
        .filter(|p| p.command.contains(&marker))
        .flat_map(|p| process::with_descendants(p.pid, procs))
        .collect();
    if pids.is_empty() {
        return None;
    }
    Some(CancelTarget {
        kind: TargetKind::LiveScan,
        run_id: run_id.to_string(),
        root: root.to_path_buf(),
        state_path: None,
        lease_path: None,
        worktree_path: None,
        pids: pids.into_iter().collect(),
    })
}

fn merge_target(by_run: &mut BTreeMap<String, CancelTarget>, target: CancelTarget) {
    match by_run.get_mut(&target.run_id) {
        Some(existing) => {
            let pids: BTreeSet<i32> = existing.pids.iter().chain(&target.pids).copied().collect();
            existing.pids = pids.into_iter().collect();
            existing.state_path = existing.state_path.take().or(target.state_path);
            existing.lease_path = existing.lease_path.take().or(target.lease_path);
            existing.worktree_path = existing.worktree_path.take().or(target.worktree_path);
        }
        None => {
            by_run.insert(target.run_id.clone(), target);
        }
    }
}

/// Union of registry, lease and (for a requested id with no other match)
/// live-scan targets, one per run id.
pub fn discover_targets(
    roots: &[PathBuf],
    run_id: Option<&str>,
    procs: &[ProcessInfo],
    now: DateTime<Utc>,
) -> Vec<CancelTarget> {
    let mut by_run: BTreeMap<String, CancelTarget> = BTreeMap::new();
    for root in roots {
        for target in registry_targets(root, run_id, procs, now) {
            merge_target(&mut by_run, target);
        }
        if let Some(target) = lease_target(root, run_id, procs, now) {
            merge_target(&mut by_run, target);
        }
    }

    if let (Some(id), Some(root)) = (run_id, roots.first()) {
        if !by_run.contains_key(id) {
            if let Some(target) = live_scan_target(root, id, procs) {
                merge_target(&mut by_run, target);
            }
        }
    }

    let mut targets: Vec<CancelTarget> = by_run.into_values().collect();
    targets.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.run_id.cmp(&b.run_id)));
    targets
}

/// Write `interrupted` into every copy of the run's state under `roots`.
/// Returns the files that changed.
pub fn mark_interrupted(roots: &[PathBuf], run_id: &str) -> std::result::Result<Vec<PathBuf>, RegistryError> {
    let mut updated = Vec::new();
    for root in roots {
        match Registry::new(root).mark_terminal(run_id, TerminalStatus::Interrupted, CANCEL_REASON) {
            Ok(paths) => updated.extend(paths),
            Err(RegistryError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(updated)
}

#[derive(Debug, Clone)]
pub struct CancelOptions {
    pub run_id: Option<String>,
    pub all: bool,
    pub signal: CancelSignal,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CancelReport {
    pub targets: Vec<CancelTarget>,
    pub marked: Vec<PathBuf>,
}

/// Discover, signal and mark. Signal failures other than "no such process"
/// and state-write failures are collected and reported together.
pub fn cancel_runs(
    cwd: &Path,
    opts: &CancelOptions,
    lister: &dyn ProcessLister,
) -> Result<CancelReport> {
    let run_id = opts.run_id.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if !opts.all && run_id.is_none() {
        return Err(SupervisorError::NoSelector);
    }

    let procs = lister.list()?;
    let roots = search_roots(cwd);
    let targets = discover_targets(&roots, run_id, &procs, Utc::now());
    if targets.is_empty() {
        println!("No active runs matched cancel criteria.");
        return Ok(CancelReport::default());
    }

    let self_pid = std::process::id() as i32;
    let mut failures = Vec::new();
    let mut marked = Vec::new();
    for target in &targets {
        let pids = process::killable(&target.pids, self_pid);
        println!(
            "Cancel target: kind={} run={} signal={} pids={pids:?}",
            target.kind.as_str(),
            target.run_id,
            opts.signal.as_str()
        );
        if opts.dry_run {
            continue;
        }
        for pid in pids {
            if let Err(e) = process::send_signal(pid, opts.signal) {
                failures.push(e.to_string());
            }
        }
        match mark_interrupted(&roots, &target.run_id) {
            Ok(paths) => marked.extend(paths),
            Err(e) => failures.push(format!("run {} state update: {e}", target.run_id)),
        }
        info!(run_id = %target.run_id, kind = target.kind.as_str(), "run cancelled");
    }

    if !failures.is_empty() {
        return Err(SupervisorError::Partial(failures.join("; ")));
    }
    Ok(CancelReport { targets, marked })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseMetadata;
    use crate::process::StaticLister;
    use rpi_core::registry::RunState;
    use rpi_core::RunOptions;
    use tempfile::TempDir;

    fn proc(pid: i32, ppid: i32, command: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            ppid,
            command: command.to_string(),
        }
    }

    fn live_run(root: &Path, run_id: &str, pid: i32) -> Registry {
        let reg = Registry::new(root);
        let state = RunState {
            run_id: run_id.into(),
            orchestrator_pid: pid,
            ..RunState::new("goal", &RunOptions::default())
        };
        reg.save(&state).unwrap();
        reg.touch_heartbeat(run_id).unwrap();
        reg
    }

    fn write_lease(root: &Path, meta: &LeaseMetadata) {
        let path = Registry::new(root).lease_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_vec(meta).unwrap()).unwrap();
    }

    #[test]
    fn run_pids_follow_markers_and_worktree() {
        let procs = vec![
            proc(100, 1, "rpi run phased goal"),
            proc(101, 100, "claude -p x"),
            proc(102, 101, "node"),
            proc(200, 1, "tmux new -s proj-rpi-r1-p2"),
            proc(201, 200, "sh"),
            proc(300, 1, "vim /tmp/wt/file.rs"),
            proc(400, 1, "unrelated"),
        ];
        let pids = run_pids(100, "r1", Some(Path::new("/tmp/wt")), &procs);
        assert_eq!(pids, vec![100, 101, 102, 200, 201, 300]);
        assert_eq!(run_pids(999, "zz", None, &procs), Vec::<i32>::new());
    }

    #[test]
    fn registry_targets_require_liveness() {
        let dir = TempDir::new().unwrap();
        let procs = vec![proc(50, 1, "rpi"), proc(51, 50, "claude")];
        live_run(dir.path(), "alive", 50);

        let stale = Registry::new(dir.path());
        stale
            .save(&RunState {
                run_id: "quiet".into(),
                orchestrator_pid: 60,
                ..RunState::default()
            })
            .unwrap();

        let targets = discover_targets(&[dir.path().to_path_buf()], None, &procs, Utc::now());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].run_id, "alive");
        assert_eq!(targets[0].kind, TargetKind::Phased);
        assert_eq!(targets[0].pids, vec![50, 51]);
    }

    #[test]
    fn expired_lease_is_never_a_target() {
        let dir = TempDir::new().unwrap();
        let procs = vec![proc(70, 1, "rpi"), proc(71, 70, "claude")];
        let mut meta = LeaseMetadata {
            run_id: "leased".into(),
            pid: 70,
            expires_at: "2000-01-01T00:00:00Z".into(),
            ..LeaseMetadata::default()
        };
        write_lease(dir.path(), &meta);
        let roots = [dir.path().to_path_buf()];
        assert!(discover_targets(&roots, None, &procs, Utc::now()).is_empty());

        meta.expires_at = (Utc::now() + chrono::Duration::minutes(2)).to_rfc3339();
        write_lease(dir.path(), &meta);
        let targets = discover_targets(&roots, None, &procs, Utc::now());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].kind, TargetKind::Supervisor);
        assert_eq!(targets[0].pids, vec![70, 71]);
    }

    #[test]
    fn lease_and_registry_merge_by_run_id() {
        let dir = TempDir::new().unwrap();
        let procs = vec![proc(80, 1, "rpi"), proc(90, 1, "other-supervisor")];
        live_run(dir.path(), "same", 80);
        write_lease(
            dir.path(),
            &LeaseMetadata {
                run_id: "same".into(),
                pid: 90,
                ..LeaseMetadata::default()
            },
        );
        let targets = discover_targets(&[dir.path().to_path_buf()], None, &procs, Utc::now());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].pids, vec![80, 90]);
        assert!(targets[0].state_path.is_some());
        assert!(targets[0].lease_path.is_some());
    }

    #[test]
    fn live_scan_only_for_requested_unknown_run() {
        let dir = TempDir::new().unwrap();
        let procs = vec![proc(10, 1, "claude --cwd /x/proj-rpi-ghost")];
        let roots = [dir.path().to_path_buf()];
        let targets = discover_targets(&roots, Some("ghost"), &procs, Utc::now());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].kind, TargetKind::LiveScan);
        assert!(discover_targets(&roots, None, &procs, Utc::now()).is_empty());
    }

    #[test]
    fn registry_match_suppresses_live_scan() {
        let dir = TempDir::new().unwrap();
        let procs = vec![
            proc(20, 1, "rpi"),
            proc(30, 1, "claude --cwd /x/proj-rpi-known"),
        ];
        live_run(dir.path(), "known", 20);
        let roots = [dir.path().to_path_buf()];
        let targets = discover_targets(&roots, Some("known"), &procs, Utc::now());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].kind, TargetKind::Phased);
        // The marker process still joins through the registry target.
        assert_eq!(targets[0].pids, vec![20, 30]);
    }

    #[test]
    fn cancel_marks_both_copies() {
        let dir = TempDir::new().unwrap();
        let reg = live_run(dir.path(), "victim", 0);
        // Unknown fields written by other tools survive the update.
        let flat = reg.flat_state_path();
        let mut raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&flat).unwrap()).unwrap();
        raw["custom_field"] = "keep".into();
        std::fs::write(&flat, serde_json::to_vec(&raw).unwrap()).unwrap();

        let report = cancel_runs(
            dir.path(),
            &CancelOptions {
                run_id: Some("victim".into()),
                all: false,
                signal: CancelSignal::Term,
                dry_run: false,
            },
            &StaticLister(Vec::new()),
        )
        .unwrap();
        assert_eq!(report.targets.len(), 1);
        assert_eq!(report.marked.len(), 2);

        for path in [reg.run_state_path("victim"), flat] {
            let raw: serde_json::Value =
                serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
            assert_eq!(raw["terminal_status"], "interrupted");
            assert_eq!(raw["terminal_reason"], CANCEL_REASON);
            assert!(!raw["terminated_at"].as_str().unwrap().is_empty());
        }
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(reg.flat_state_path()).unwrap()).unwrap();
        assert_eq!(raw["custom_field"], "keep");
    }

    #[test]
    fn dry_run_and_selector_rules() {
        let dir = TempDir::new().unwrap();
        let reg = live_run(dir.path(), "keep", 0);
        let opts = CancelOptions {
            run_id: None,
            all: true,
            signal: CancelSignal::Kill,
            dry_run: true,
        };
        let report = cancel_runs(dir.path(), &opts, &StaticLister(Vec::new())).unwrap();
        assert_eq!(report.targets.len(), 1);
        assert!(report.marked.is_empty());
        assert!(!reg.load_run("keep").unwrap().is_terminal());

        let err = cancel_runs(
            dir.path(),
            &CancelOptions {
                all: false,
                ..opts
            },
            &StaticLister(Vec::new()),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "specify --all or --run-id <id>");
    }
}
