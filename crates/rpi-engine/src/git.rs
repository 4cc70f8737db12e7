//! Thin wrappers over the `git` CLI.
//!
//! Every call runs synchronously with `current_dir` set to the repository
//! (or worktree) it operates on. Non-zero exits become `CommandFailed` with
//! the git subcommand and its stderr.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("not a git repository: {0}")]
    NotARepo(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
    #[error("detached HEAD in {0}")]
    DetachedHead(String),
    #[error(
        "merge conflict in {short}.\nConflicting files:\n{files}\nResolve manually: cd {root} && git merge {branch}"
    )]
    MergeConflict {
        short: String,
        files: String,
        root: String,
        branch: String,
    },
}

pub type Result<T> = std::result::Result<T, GitError>;

fn git(dir: &Path, args: &[&str]) -> Result<Output> {
    Ok(Command::new("git").args(args).current_dir(dir).output()?)
}

fn stdout_trimmed(output: Output) -> Result<String> {
    Ok(String::from_utf8(output.stdout)
        .map_err(|_| GitError::InvalidUtf8)?
        .trim()
        .to_string())
}

fn check(output: Output, what: &str) -> Result<Output> {
    if output.status.success() {
        return Ok(output);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(GitError::CommandFailed(format!("{what}: {}", stderr.trim())))
}

/// Top-level directory of the repository containing `dir`.
pub fn repo_root(dir: &Path) -> Result<PathBuf> {
    let output = git(dir, &["rev-parse", "--show-toplevel"])?;
    if !output.status.success() {
        return Err(GitError::NotARepo(dir.display().to_string()));
    }
    Ok(PathBuf::from(stdout_trimmed(output)?))
}

/// Current branch name. Detached HEAD is an error.
pub fn current_branch(dir: &Path) -> Result<String> {
    let output = check(
        git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?,
        "git rev-parse --abbrev-ref HEAD",
    )?;
    let branch = stdout_trimmed(output)?;
    if branch == "HEAD" {
        return Err(GitError::DetachedHead(dir.display().to_string()));
    }
    Ok(branch)
}

pub fn head_commit(dir: &Path) -> Result<String> {
    let output = check(git(dir, &["rev-parse", "HEAD"])?, "git rev-parse HEAD")?;
    let commit = stdout_trimmed(output)?;
    if commit.is_empty() {
        return Err(GitError::CommandFailed(
            "git rev-parse HEAD: empty output".to_string(),
        ));
    }
    Ok(commit)
}

/// No tracked modifications (staged or unstaged). Untracked files are ignored.
pub fn is_working_tree_clean(dir: &Path) -> Result<bool> {
    let output = check(
        git(dir, &["status", "--porcelain", "--untracked-files=no"])?,
        "git status",
    )?;
    Ok(stdout_trimmed(output)?.is_empty())
}

/// Tracked files differ from HEAD.
pub fn has_tracked_changes(dir: &Path) -> Result<bool> {
    let output = git(dir, &["diff-index", "--quiet", "HEAD"])?;
    match output.status.code() {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        _ => Err(GitError::CommandFailed(format!(
            "git diff-index: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

/// Check if a branch exists locally.
pub fn branch_exists(dir: &Path, branch: &str) -> Result<bool> {
    let output = git(dir, &["rev-parse", "--verify", &format!("refs/heads/{branch}")])?;
    Ok(output.status.success())
}

pub fn delete_branch(dir: &Path, branch: &str) -> Result<()> {
    check(git(dir, &["branch", "-D", branch])?, &format!("git branch -D {branch}"))?;
    Ok(())
}

/// `git worktree add -b <branch> <path> <commit>`.
pub fn add_worktree(root: &Path, path: &Path, branch: &str, commit: &str) -> Result<()> {
    let path_str = path.to_string_lossy();
    check(
        git(root, &["worktree", "add", "-b", branch, path_str.as_ref(), commit])?,
        "git worktree add",
    )?;
    Ok(())
}

/// Force remove a git worktree (even with local changes).
pub fn remove_worktree_force(root: &Path, path: &Path) -> Result<()> {
    let path_str = path.to_string_lossy();
    check(
        git(root, &["worktree", "remove", "--force", path_str.as_ref()])?,
        "git worktree remove --force",
    )?;
    Ok(())
}

pub fn prune_worktrees(root: &Path) -> Result<()> {
    check(git(root, &["worktree", "prune"])?, "git worktree prune")?;
    Ok(())
}

/// Information about a git worktree.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: Option<String>,
    pub commit: String,
}

/// List all git worktrees for a repository.
pub fn list_worktrees(root: &Path) -> Result<Vec<WorktreeInfo>> {
    let output = check(
        git(root, &["worktree", "list", "--porcelain"])?,
        "git worktree list",
    )?;
    Ok(parse_worktree_list(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_worktree_list(stdout: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<String> = None;
    let mut current_commit: Option<String> = None;
    let mut current_branch: Option<String> = None;

    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let (Some(path), Some(commit)) = (current_path.take(), current_commit.take()) {
                worktrees.push(WorktreeInfo {
                    path,
                    commit,
                    branch: current_branch.take(),
                });
            }
            current_branch = None;
            current_path = Some(path.to_string());
        } else if let Some(commit) = line.strip_prefix("HEAD ") {
            current_commit = Some(commit.to_string());
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current_branch = Some(branch.to_string());
        }
    }

    if let (Some(path), Some(commit)) = (current_path, current_commit) {
        worktrees.push(WorktreeInfo {
            path,
            commit,
            branch: current_branch,
        });
    }
    worktrees
}

/// `git merge --no-ff -m <message> <source>` into the checked-out branch.
///
/// On conflict the merge is aborted and the conflicting files are reported.
pub fn merge_no_ff(root: &Path, source: &str, message: &str) -> Result<()> {
    let output = git(root, &["merge", "--no-ff", "-m", message, source])?;
    if output.status.success() {
        return Ok(());
    }

    let conflicts = git(root, &["diff", "--name-only", "--diff-filter=U"])
        .ok()
        .and_then(|o| stdout_trimmed(o).ok())
        .unwrap_or_default();
    match git(root, &["merge", "--abort"]) {
        Ok(out) if !out.status.success() => warn!(
            root = %root.display(),
            stderr = %String::from_utf8_lossy(&out.stderr).trim(),
            "git merge --abort failed"
        ),
        Err(e) => warn!(root = %root.display(), error = %e, "git merge --abort failed"),
        Ok(_) => {}
    }

    if conflicts.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git merge {source}: {}",
            stderr.trim()
        )));
    }
    Err(GitError::MergeConflict {
        short: source.chars().take(12).collect(),
        files: conflicts,
        root: root.display().to_string(),
        branch: source.to_string(),
    })
}
