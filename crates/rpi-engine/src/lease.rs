//! Single-flight supervisor lease.
//!
//! An exclusive advisory lock on `.agents/rpi/supervisor.lock` plus JSON
//! metadata naming the holder. The metadata is rewritten on every renewal
//! so out-of-process readers (cancel, status) can tell a live holder from
//! an abandoned file.

use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_TTL: Duration = Duration::from_secs(120);
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("single-flight lease already held: {0}")]
    Held(String),
    #[error("lease io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("marshal lease metadata: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LeaseError>;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseMetadata {
    pub run_id: String,
    pub pid: i32,
    pub host: String,
    pub cwd: String,
    pub acquired_at: String,
    pub renewed_at: String,
    pub expires_at: String,
}

impl LeaseMetadata {
    /// Missing expiry counts as unexpired; an unparseable one as expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let raw = self.expires_at.trim();
        if raw.is_empty() {
            return false;
        }
        match DateTime::parse_from_rfc3339(raw) {
            Ok(expiry) => now > expiry.with_timezone(&Utc),
            Err(_) => true,
        }
    }

    fn holder_hint(&self) -> String {
        format!(
            "run={} pid={} host={} renewed_at={}",
            self.run_id, self.pid, self.host, self.renewed_at
        )
    }
}

/// Read lease metadata without locking. Missing or corrupt files yield `None`.
pub fn read_metadata(path: &Path) -> Option<LeaseMetadata> {
    let data = std::fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

fn holder_hint(path: &Path) -> String {
    match read_metadata(path) {
        Some(meta) if !meta.run_id.is_empty() => meta.holder_hint(),
        _ => format!("lock={}", path.display()),
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .unwrap_or_default()
}

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn renew_interval(ttl: Duration) -> Duration {
    (ttl / 2).max(MIN_RENEW_INTERVAL)
}

#[derive(Debug)]
struct LeaseState {
    file: File,
    meta: LeaseMetadata,
    ttl: Duration,
}

impl LeaseState {
    fn write(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.meta.renewed_at = stamp(now);
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.meta.expires_at = stamp(now + ttl);
        let mut data = serde_json::to_vec_pretty(&self.meta)?;
        data.push(b'\n');
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&data)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// A held lease. Renewal runs on a background task until [`Lease::release`]
/// or drop.
#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    state: Arc<Mutex<LeaseState>>,
    cancel: CancellationToken,
    renewer: Option<JoinHandle<()>>,
}

impl Lease {
    /// Take the lock without blocking and write fresh metadata.
    pub fn acquire(path: &Path, run_id: &str, cwd: &Path, ttl: Duration) -> Result<Self> {
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(LeaseError::Held(holder_hint(path)));
            }
            return Err(e.into());
        }

        let now = Utc::now();
        let mut state = LeaseState {
            file,
            meta: LeaseMetadata {
                run_id: run_id.to_string(),
                pid: std::process::id() as i32,
                host: hostname(),
                cwd: cwd.display().to_string(),
                acquired_at: stamp(now),
                ..LeaseMetadata::default()
            },
            ttl,
        };
        if let Err(e) = state.write(now) {
            let _ = FileExt::unlock(&state.file);
            return Err(e);
        }
        debug!(run_id = %run_id, path = %path.display(), "supervisor lease acquired");

        Ok(Self {
            path: path.to_path_buf(),
            state: Arc::new(Mutex::new(state)),
            cancel: CancellationToken::new(),
            renewer: None,
        })
    }

    /// Spawn the renewal task on the current tokio runtime.
    pub fn start_renewal(&mut self) {
        if self.renewer.is_some() {
            return;
        }
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        let interval = {
            let guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            renew_interval(guard.ttl)
        };
        self.renewer = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(interval) => {
                        let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                        if let Err(e) = guard.write(Utc::now()) {
                            warn!(error = %e, "lease renewal failed");
                        }
                    }
                }
            }
        }));
    }

    /// Rewrite the metadata now, outside the renewal schedule.
    pub fn renew(&self) -> Result<()> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(Utc::now())
    }

    /// Stop renewal and drop the lock.
    pub async fn release(mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.renewer.take() {
            let _ = handle.await;
        }
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        FileExt::unlock(&guard.file)?;
        debug!(path = %self.path.display(), "supervisor lease released");
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.renewer.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn second_acquire_conflicts_with_holder_hint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".agents/rpi/supervisor.lock");
        let lease = Lease::acquire(&path, "run-a", dir.path(), Duration::from_secs(60)).unwrap();

        let err = Lease::acquire(&path, "run-b", dir.path(), Duration::from_secs(60)).unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("single-flight lease already held: run=run-a pid="));
        assert!(text.contains("renewed_at="));

        lease.release().await.unwrap();
        let again = Lease::acquire(&path, "run-b", dir.path(), Duration::from_secs(60)).unwrap();
        assert_eq!(read_metadata(&path).unwrap().run_id, "run-b");
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn metadata_is_written_and_renewed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("supervisor.lock");
        let lease = Lease::acquire(&path, "r1", dir.path(), Duration::from_secs(30)).unwrap();

        let meta = read_metadata(&path).unwrap();
        assert_eq!(meta.run_id, "r1");
        assert_eq!(meta.pid, std::process::id() as i32);
        assert!(!meta.is_expired(Utc::now()));
        assert!(meta.is_expired(Utc::now() + chrono::Duration::minutes(5)));

        lease.renew().unwrap();
        assert_eq!(read_metadata(&path).unwrap().acquired_at, meta.acquired_at);
        lease.release().await.unwrap();
    }

    #[test]
    fn expiry_rules() {
        let now = Utc::now();
        let mut meta = LeaseMetadata::default();
        assert!(!meta.is_expired(now));
        meta.expires_at = "not a time".into();
        assert!(meta.is_expired(now));
        meta.expires_at = stamp(now - chrono::Duration::seconds(1));
        assert!(meta.is_expired(now));
    }

    #[test]
    fn renew_interval_has_floor() {
        assert_eq!(renew_interval(Duration::from_secs(10)), MIN_RENEW_INTERVAL);
        assert_eq!(renew_interval(Duration::from_secs(120)), Duration::from_secs(60));
    }
}
