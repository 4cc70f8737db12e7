//! Execution roots that may hold run registries.
//!
//! Runs keep state under whichever directory they executed in, so readers
//! look at the current repository, every git worktree of it, and the
//! `<repo>-rpi-*` siblings left by older runs.

use crate::git;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

fn push_unique(path: &Path, seen: &mut HashSet<PathBuf>, out: &mut Vec<PathBuf>) {
    let norm = normalize(path);
    if seen.insert(norm.clone()) {
        out.push(norm);
    }
}

/// `cwd`, then every `git worktree list` root, else `<parent>/*-rpi-*`.
pub fn search_roots(cwd: &Path) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut roots = Vec::new();
    push_unique(cwd, &mut seen, &mut roots);

    if let Ok(worktrees) = git::list_worktrees(cwd) {
        if !worktrees.is_empty() {
            for wt in worktrees {
                push_unique(Path::new(&wt.path), &mut seen, &mut roots);
            }
            return roots;
        }
    }

    for sibling in rpi_siblings(cwd) {
        push_unique(&sibling, &mut seen, &mut roots);
    }
    roots
}

/// Directories next to `cwd` whose name contains `-rpi-`, sorted.
pub fn rpi_siblings(cwd: &Path) -> Vec<PathBuf> {
    let abs = normalize(cwd);
    let Some(parent) = abs.parent() else {
        return Vec::new();
    };
    let Ok(entries) = std::fs::read_dir(parent) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter(|e| e.file_name().to_string_lossy().contains("-rpi-"))
        .map(|e| e.path())
        .collect();
    out.sort();
    out
}
