//! File-based run registry and heartbeat store.
//!
//! Layout under an execution root:
//!
//! ```text
//! .agents/rpi/phased-state.json            flat "current run" copy
//! .agents/rpi/runs/<run_id>/phased-state.json
//! .agents/rpi/runs/<run_id>/heartbeat.txt
//! ```
//!
//! Every write goes through a temp file plus rename. Readers tolerate
//! missing and half-written entries from runs that are still starting.
//! Writers that must not lose a terminal status hold `.agents/rpi/state.lock`
//! across their read-modify-write.

use crate::config::RunOptions;
use crate::types::{Phase, RunStatus, TerminalStatus, TypeError};
use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};

pub const STATE_DIR: &str = ".agents/rpi";
pub const STATE_FILE: &str = "phased-state.json";
pub const RUNS_DIR: &str = "runs";
pub const HEARTBEAT_FILE: &str = "heartbeat.txt";
pub const LOG_FILE: &str = "phased-orchestration.log";
pub const LIVE_STATUS_FILE: &str = "live-status.md";
pub const LEASE_FILE: &str = "supervisor.lock";
pub const STATE_LOCK_FILE: &str = "state.lock";

pub const SCHEMA_VERSION: u32 = 1;

/// A heartbeat younger than this marks the run as live.
pub const HEARTBEAT_LIVE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid state file {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no run state found under {0}")]
    NotFound(PathBuf),
    #[error(transparent)]
    Type(#[from] TypeError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Exclusive advisory lock over one registry's state files, released on
/// drop.
#[derive(Debug)]
pub struct StateLock {
    file: std::fs::File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(error = %e, "state lock release failed");
        }
    }
}

/// Persisted state of one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    pub schema_version: u32,
    pub goal: String,
    pub epic_id: String,
    pub phase: u32,
    pub start_phase: u32,
    pub cycle: u32,
    pub parent_epic: String,
    pub fast_path: bool,
    pub test_first: bool,
    pub swarm_first: bool,
    pub verdicts: BTreeMap<String, String>,
    pub attempts: BTreeMap<String, u32>,
    pub started_at: String,
    pub worktree_path: String,
    pub run_id: String,
    pub orchestrator_pid: i32,
    pub backend: String,
    pub terminal_status: TerminalStatus,
    pub terminal_reason: String,
    pub terminated_at: String,
    pub opts: RunOptions,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            goal: String::new(),
            epic_id: String::new(),
            phase: 1,
            start_phase: 1,
            cycle: 1,
            parent_epic: String::new(),
            fast_path: false,
            test_first: false,
            swarm_first: true,
            verdicts: BTreeMap::new(),
            attempts: BTreeMap::new(),
            started_at: String::new(),
            worktree_path: String::new(),
            run_id: String::new(),
            orchestrator_pid: 0,
            backend: String::new(),
            terminal_status: TerminalStatus::Active,
            terminal_reason: String::new(),
            terminated_at: String::new(),
            opts: RunOptions::default(),
        }
    }
}

impl RunState {
    /// Fresh state for a run starting now.
    pub fn new(goal: &str, opts: &RunOptions) -> Self {
        Self {
            goal: goal.to_string(),
            phase: opts.from.number(),
            start_phase: opts.from.number(),
            fast_path: opts.fast_path,
            test_first: opts.test_first,
            swarm_first: opts.swarm_first,
            started_at: now_rfc3339(),
            opts: opts.clone(),
            ..Self::default()
        }
    }

    pub fn current_phase(&self) -> Result<Phase> {
        Ok(Phase::from_number(self.phase)?)
    }

    pub fn attempts_for(&self, phase: Phase) -> u32 {
        self.attempts.get(&phase.attempt_key()).copied().unwrap_or(0)
    }

    /// Increment and return the attempt count for a phase.
    pub fn bump_attempt(&mut self, phase: Phase) -> u32 {
        let entry = self.attempts.entry(phase.attempt_key()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_status.is_terminal()
    }

    /// Set terminal metadata once. Returns false if already terminal.
    pub fn terminate(&mut self, status: TerminalStatus, reason: &str) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.terminal_status = status;
        self.terminal_reason = reason.to_string();
        self.terminated_at = now_rfc3339();
        true
    }

    pub fn worktree(&self) -> Option<&Path> {
        if self.worktree_path.is_empty() {
            None
        } else {
            Some(Path::new(&self.worktree_path))
        }
    }

    /// Recorded worktree path exists, or none was recorded.
    pub fn worktree_present(&self) -> bool {
        self.worktree().is_none_or(Path::exists)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        parse_rfc3339(&self.started_at)
    }
}

/// One registry directory entry.
#[derive(Debug, Clone)]
pub struct RunEntry {
    pub run_id: String,
    pub state_path: PathBuf,
    pub state: RunState,
}

/// Run registry rooted at one execution root (repository or worktree).
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir().join(RUNS_DIR)
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    pub fn flat_state_path(&self) -> PathBuf {
        self.state_dir().join(STATE_FILE)
    }

    pub fn run_state_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(STATE_FILE)
    }

    pub fn heartbeat_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(HEARTBEAT_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir().join(LOG_FILE)
    }

    pub fn live_status_path(&self) -> PathBuf {
        self.state_dir().join(LIVE_STATUS_FILE)
    }

    pub fn lease_path(&self) -> PathBuf {
        self.state_dir().join(LEASE_FILE)
    }

    /// Block until this registry's state lock is held.
    pub fn lock_state(&self) -> Result<StateLock> {
        let dir = self.state_dir();
        std::fs::create_dir_all(&dir)?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(STATE_LOCK_FILE))?;
        file.lock_exclusive()?;
        Ok(StateLock { file })
    }

    /// Write state to both the flat path and the per-run path.
    pub fn save(&self, state: &RunState) -> Result<()> {
        let mut data = serde_json::to_vec_pretty(state)?;
        data.push(b'\n');
        if !state.run_id.is_empty() {
            write_atomic(&self.run_state_path(&state.run_id), &data)?;
        }
        write_atomic(&self.flat_state_path(), &data)?;
        debug!(run_id = %state.run_id, phase = state.phase, "saved run state");
        Ok(())
    }

    /// Load the most relevant state: the newest registry entry unless the
    /// flat copy is strictly newer.
    pub fn load_current(&self) -> Result<RunState> {
        let flat = self.flat_state_path();
        if let Some((path, state)) = self.newest_registry_state() {
            match (modified(&flat), modified(&path)) {
                (None, _) => return Ok(state),
                (Some(flat_m), Some(reg_m)) if reg_m >= flat_m => return Ok(state),
                _ => {}
            }
        }
        if !flat.exists() {
            return Err(RegistryError::NotFound(self.root.clone()));
        }
        read_state(&flat)
    }

    /// Load the state for one run from its registry directory.
    pub fn load_run(&self, run_id: &str) -> Result<RunState> {
        let path = self.run_state_path(run_id);
        if !path.exists() {
            return Err(RegistryError::NotFound(path));
        }
        read_state(&path)
    }

    fn newest_registry_state(&self) -> Option<(PathBuf, RunState)> {
        let mut newest: Option<(SystemTime, PathBuf, RunState)> = None;
        for entry in self.list_runs() {
            let Some(mtime) = modified(&entry.state_path) else {
                continue;
            };
            if newest.as_ref().is_none_or(|(t, _, _)| mtime > *t) {
                newest = Some((mtime, entry.state_path, entry.state));
            }
        }
        newest.map(|(_, path, state)| (path, state))
    }

    /// All readable registry entries, sorted by run id. Malformed or
    /// missing state files are skipped.
    pub fn list_runs(&self) -> Vec<RunEntry> {
        let Ok(entries) = std::fs::read_dir(self.runs_dir()) else {
            return Vec::new();
        };
        let mut runs = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().to_string();
            let state_path = entry.path().join(STATE_FILE);
            match read_state(&state_path) {
                Ok(state) if !state.run_id.is_empty() => runs.push(RunEntry {
                    run_id,
                    state_path,
                    state,
                }),
                Ok(_) => debug!(run_id = %run_id, "skipping registry entry without run_id"),
                Err(RegistryError::Io(_)) => {}
                Err(e) => warn!(run_id = %run_id, error = %e, "skipping unreadable run state"),
            }
        }
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        runs
    }

    /// Refresh the run's heartbeat with the current UTC time.
    pub fn touch_heartbeat(&self, run_id: &str) -> Result<()> {
        if run_id.is_empty() {
            return Ok(());
        }
        let stamp = format!(
            "{}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
        );
        write_atomic(&self.heartbeat_path(run_id), stamp.as_bytes())
    }

    pub fn read_heartbeat(&self, run_id: &str) -> Option<DateTime<Utc>> {
        if run_id.is_empty() {
            return None;
        }
        let raw = std::fs::read_to_string(self.heartbeat_path(run_id)).ok()?;
        parse_rfc3339(raw.trim())
    }

    /// A run is live when its worktree (if any) exists and its heartbeat is
    /// recent.
    pub fn is_live(&self, state: &RunState, now: DateTime<Utc>) -> bool {
        if !state.worktree_present() {
            return false;
        }
        self.read_heartbeat(&state.run_id).is_some_and(|hb| {
            now.signed_duration_since(hb)
                .to_std()
                .map_or(true, |age| age < HEARTBEAT_LIVE_THRESHOLD)
        })
    }

    /// Operator-facing status for a run.
    pub fn derive_status(&self, state: &RunState, now: DateTime<Utc>) -> RunStatus {
        match state.terminal_status {
            TerminalStatus::Completed => return RunStatus::Completed,
            TerminalStatus::Failed => return RunStatus::Failed,
            TerminalStatus::Interrupted => return RunStatus::Interrupted,
            TerminalStatus::Stale => return RunStatus::Stale,
            TerminalStatus::Active => {}
        }
        if self.is_live(state, now) {
            RunStatus::Running
        } else if state.phase >= Phase::LAST.number() {
            RunStatus::Completed
        } else if !state.worktree_present() {
            RunStatus::Stale
        } else {
            RunStatus::Unknown
        }
    }

    /// Write terminal metadata into every copy of a run's state.
    ///
    /// Works on raw JSON so fields written by other tools survive. The flat
    /// copy is only touched when it belongs to the same run. Returns the
    /// paths that were updated.
    pub fn mark_terminal(
        &self,
        run_id: &str,
        status: TerminalStatus,
        reason: &str,
    ) -> Result<Vec<PathBuf>> {
        let _lock = self.lock_state()?;
        let terminated_at = now_rfc3339();
        let mut updated = Vec::new();

        let run_path = self.run_state_path(run_id);
        if run_path.exists() {
            patch_terminal(&run_path, status, reason, &terminated_at)?;
            updated.push(run_path);
        }

        let flat = self.flat_state_path();
        if let Ok(raw) = read_raw(&flat) {
            if raw.get("run_id").and_then(|v| v.as_str()) == Some(run_id) {
                patch_terminal(&flat, status, reason, &terminated_at)?;
                updated.push(flat);
            }
        }

        if updated.is_empty() {
            return Err(RegistryError::NotFound(self.run_state_path(run_id)));
        }
        Ok(updated)
    }
}

fn read_raw(path: &Path) -> Result<serde_json::Map<String, serde_json::Value>> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(|source| RegistryError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

fn patch_terminal(
    path: &Path,
    status: TerminalStatus,
    reason: &str,
    terminated_at: &str,
) -> Result<()> {
    let mut raw = read_raw(path)?;
    raw.insert("terminal_status".into(), status.as_str().into());
    raw.insert("terminal_reason".into(), reason.into());
    raw.insert("terminated_at".into(), terminated_at.into());
    let mut data = serde_json::to_vec_pretty(&raw)?;
    data.push(b'\n');
    write_atomic(path, &data)
}

/// Parse a state file.
pub fn read_state(path: &Path) -> Result<RunState> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(|source| RegistryError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Write via a sibling temp file and rename so readers never see a torn file.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}.tmp-"))
        .tempfile_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| RegistryError::Io(e.error))?;
    Ok(())
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Fresh 12-character lowercase hex run id.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
