//! Process inventory and signalling.
//!
//! The inventory is a point-in-time `ps` snapshot. Supervisor code only
//! depends on [`ProcessLister`] so tests can supply a fixed table.

use rpi_core::types::ProcessInfo;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("list processes: {0}")]
    List(String),
    #[error("failed to execute ps: {0}")]
    Execution(#[from] std::io::Error),
    #[error("unsupported signal {0:?} (valid: TERM|KILL|INT)")]
    UnsupportedSignal(String),
    #[error("pid {pid}: {source}")]
    Signal {
        pid: i32,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ProcessError>;

pub trait ProcessLister: Send + Sync {
    fn list(&self) -> Result<Vec<ProcessInfo>>;
}

/// Lists processes with `ps -axo pid=,ppid=,command=`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PsLister;

impl ProcessLister for PsLister {
    fn list(&self) -> Result<Vec<ProcessInfo>> {
        let output = Command::new("ps")
            .args(["-axo", "pid=,ppid=,command="])
            .output()?;
        if !output.status.success() {
            return Err(ProcessError::List(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// A fixed process table.
#[derive(Debug, Default, Clone)]
pub struct StaticLister(pub Vec<ProcessInfo>);

impl ProcessLister for StaticLister {
    fn list(&self) -> Result<Vec<ProcessInfo>> {
        Ok(self.0.clone())
    }
}

/// Parse `pid ppid command...` rows; malformed rows are skipped.
pub fn parse_ps_output(stdout: &str) -> Vec<ProcessInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            let command = fields.collect::<Vec<_>>().join(" ");
            if command.is_empty() {
                return None;
            }
            Some(ProcessInfo { pid, ppid, command })
        })
        .collect()
}

pub fn exists_in(pid: i32, procs: &[ProcessInfo]) -> bool {
    procs.iter().any(|p| p.pid == pid)
}

/// All transitive children of `parent`, sorted.
pub fn descendants(parent: i32, procs: &[ProcessInfo]) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for p in procs {
        children.entry(p.ppid).or_default().push(p.pid);
    }

    let mut seen = BTreeSet::from([parent]);
    let mut out = BTreeSet::new();
    let mut queue = VecDeque::from([parent]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).map(Vec::as_slice).unwrap_or_default() {
            if seen.insert(child) {
                out.insert(child);
                queue.push_back(child);
            }
        }
    }
    out.into_iter().collect()
}

/// `pid` plus its descendants, when `pid` is a real process in the table.
pub fn with_descendants(pid: i32, procs: &[ProcessInfo]) -> Vec<i32> {
    if pid <= 1 || !exists_in(pid, procs) {
        return Vec::new();
    }
    let mut out = vec![pid];
    out.extend(descendants(pid, procs));
    out.sort_unstable();
    out.dedup();
    out
}

/// Drop init, invalid pids, and the calling process.
pub fn killable(pids: &[i32], self_pid: i32) -> Vec<i32> {
    let set: BTreeSet<i32> = pids
        .iter()
        .copied()
        .filter(|&pid| pid > 1 && pid != self_pid)
        .collect();
    set.into_iter().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSignal {
    Term,
    Kill,
    Int,
}

impl CancelSignal {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "" | "TERM" | "SIGTERM" => Ok(Self::Term),
            "KILL" | "SIGKILL" => Ok(Self::Kill),
            "INT" | "SIGINT" => Ok(Self::Int),
            _ => Err(ProcessError::UnsupportedSignal(raw.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Term => "terminated",
            Self::Kill => "killed",
            Self::Int => "interrupt",
        }
    }

    fn raw(self) -> libc::c_int {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Int => libc::SIGINT,
        }
    }
}

/// Send a signal. A process that already exited is not an error.
pub fn send_signal(pid: i32, signal: CancelSignal) -> Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal.raw()) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(ProcessError::Signal { pid, source: err })
}
