//! Worktree lifecycle for isolated runs.
//!
//! Each run gets a sibling checkout `<parent>/<repo>-rpi-<run_id>` on a fresh
//! `rpi/<run_id>` branch. On success the run's commits are merged back into
//! the branch checked out at the repository root, then the worktree and
//! branch are removed.

use crate::git::{self, GitError};
use rpi_core::orchestration_log::OrchestrationLog;
use rpi_core::registry::{new_run_id, STATE_DIR};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const CREATE_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("repository {0} has uncommitted changes; commit or stash them, or run with --no-worktree")]
    DirtyRepository(String),
    #[error("worktree path collision after {0} attempts")]
    Collision(u32),
    #[error(
        "repository {root} still has uncommitted changes after {attempts} attempts; commit or stash them, then merge rpi/{run_id} manually"
    )]
    RepositoryUnclean {
        root: String,
        attempts: u32,
        run_id: String,
    },
    #[error("merge source unavailable: no worktree path or run id")]
    MergeSourceUnavailable,
    #[error("invalid run id for worktree path {0}")]
    InvalidRunId(String),
    #[error("refusing to remove {path}: expected {expected} (path validation failed)")]
    PathValidation { path: String, expected: String },
    #[error("remove worktree {path}: {reason}")]
    RemoveFailed { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

/// A created worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    pub path: PathBuf,
    pub run_id: String,
    pub branch: String,
}

pub fn branch_for(run_id: &str) -> String {
    format!("rpi/{run_id}")
}

/// Expected sibling path for a run under `repo_root`.
pub fn sibling_path(repo_root: &Path, run_id: &str) -> PathBuf {
    let parent = repo_root.parent().unwrap_or(repo_root);
    parent.join(format!("{}-rpi-{run_id}", repo_name(repo_root)))
}

fn repo_name(repo_root: &Path) -> String {
    repo_root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repo")
        .to_string()
}

/// Run id encoded in a sibling worktree directory name.
pub fn run_id_from_path(repo_root: &Path, path: &Path) -> Option<String> {
    let base = path.file_name()?.to_str()?;
    let id = base.strip_prefix(&format!("{}-rpi-", repo_name(repo_root)))?;
    (!id.is_empty()).then(|| id.to_string())
}

fn resolve(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

/// Resolve and validate a removal target. The path must be exactly the
/// expected sibling for its run id and never the repository root.
pub fn validate_sibling(repo_root: &Path, path: &Path, run_id: &str) -> Result<(PathBuf, String)> {
    let abs = resolve(path);
    let root = resolve(repo_root);
    let run_id = if run_id.trim().is_empty() {
        run_id_from_path(&root, &abs)
            .ok_or_else(|| WorktreeError::InvalidRunId(abs.display().to_string()))?
    } else {
        run_id.to_string()
    };
    let expected = sibling_path(&root, &run_id);
    if abs != expected || abs == root {
        return Err(WorktreeError::PathValidation {
            path: abs.display().to_string(),
            expected: expected.display().to_string(),
        });
    }
    Ok((abs, run_id))
}

#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    dirty_retries: u32,
    dirty_backoff: Duration,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            dirty_retries: 5,
            dirty_backoff: Duration::from_secs(2),
        }
    }

    /// Override the pre-merge dirty-check policy.
    pub fn with_merge_policy(mut self, retries: u32, backoff: Duration) -> Self {
        self.dirty_retries = retries.max(1);
        self.dirty_backoff = backoff;
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Create a sibling worktree on a fresh run branch from the current HEAD.
    pub fn create(&self, require_clean: bool) -> Result<Worktree> {
        if require_clean && !git::is_working_tree_clean(&self.repo_root)? {
            return Err(WorktreeError::DirtyRepository(
                self.repo_root.display().to_string(),
            ));
        }
        if let Ok(branch) = git::current_branch(&self.repo_root) {
            debug!(branch = %branch, "creating worktree from current branch");
        }
        let head = git::head_commit(&self.repo_root)?;

        for attempt in 1..=CREATE_ATTEMPTS {
            let run_id = new_run_id();
            let path = sibling_path(&self.repo_root, &run_id);
            let branch = branch_for(&run_id);
            if path.exists() || git::branch_exists(&self.repo_root, &branch)? {
                warn!(path = %path.display(), attempt, "worktree path collision, retrying");
                continue;
            }
            match git::add_worktree(&self.repo_root, &path, &branch, &head) {
                Ok(()) => {
                    if let Err(e) = std::fs::create_dir_all(path.join(STATE_DIR)) {
                        warn!(error = %e, "could not create state dir in worktree");
                    }
                    info!(run_id = %run_id, path = %path.display(), "worktree created");
                    return Ok(Worktree {
                        path,
                        run_id,
                        branch,
                    });
                }
                Err(GitError::CommandFailed(msg)) if msg.contains("already exists") => {
                    warn!(path = %path.display(), attempt, "worktree path collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(WorktreeError::Collision(CREATE_ATTEMPTS))
    }

    /// Wait until the repository root has no tracked changes, retrying with
    /// a fixed backoff. Another run may be mid-merge.
    fn wait_for_clean(&self, run_id: &str) -> Result<()> {
        for attempt in 1..=self.dirty_retries {
            if !git::has_tracked_changes(&self.repo_root)? {
                return Ok(());
            }
            if attempt < self.dirty_retries {
                info!(
                    attempt,
                    max = self.dirty_retries,
                    "repository dirty (another merge in progress?), retrying"
                );
                std::thread::sleep(self.dirty_backoff);
            }
        }
        Err(WorktreeError::RepositoryUnclean {
            root: self.repo_root.display().to_string(),
            attempts: self.dirty_retries,
            run_id: run_id.to_string(),
        })
    }

    /// Merge the worktree's HEAD into the branch checked out at the root.
    pub fn merge(&self, worktree_path: &Path, run_id: &str) -> Result<()> {
        self.wait_for_clean(run_id)?;

        let path = if worktree_path.as_os_str().is_empty() {
            if run_id.trim().is_empty() {
                return Err(WorktreeError::MergeSourceUnavailable);
            }
            sibling_path(&self.repo_root, run_id)
        } else {
            worktree_path.to_path_buf()
        };

        let source = git::head_commit(&path)?;
        let message = if run_id.is_empty() {
            "Merge rpi worktree".to_string()
        } else {
            format!("Merge {run_id} (rpi worktree)")
        };
        git::merge_no_ff(&self.repo_root, &source, &message)?;
        info!(run_id = %run_id, source = %source, "worktree merged");
        Ok(())
    }

    /// Remove a validated sibling worktree and its run branch.
    pub fn remove(&self, worktree_path: &Path, run_id: &str) -> Result<()> {
        let (abs, run_id) = validate_sibling(&self.repo_root, worktree_path, run_id)?;

        if let Err(git_err) = git::remove_worktree_force(&self.repo_root, &abs) {
            debug!(error = %git_err, "git worktree remove failed, removing directory");
            if abs.exists() {
                std::fs::remove_dir_all(&abs).map_err(|e| WorktreeError::RemoveFailed {
                    path: abs.display().to_string(),
                    reason: format!("{git_err}; {e}"),
                })?;
            }
            if let Err(e) = git::prune_worktrees(&self.repo_root) {
                warn!(error = %e, "git worktree prune failed");
            }
        }

        let branch = branch_for(&run_id);
        if git::branch_exists(&self.repo_root, &branch).unwrap_or(false) {
            if let Err(e) = git::delete_branch(&self.repo_root, &branch) {
                warn!(branch = %branch, error = %e, "could not delete run branch");
            }
        }
        info!(run_id = %run_id, path = %abs.display(), "worktree removed");
        Ok(())
    }

    /// `remove`, recording a `FAILURE_CONTEXT` entry under stage `cleanup` on error.
    pub fn remove_logged(
        &self,
        worktree_path: &Path,
        run_id: &str,
        log: &OrchestrationLog,
    ) -> Result<()> {
        self.remove(worktree_path, run_id).inspect_err(|e| {
            log.failure_context("cleanup", e);
        })
    }
}
