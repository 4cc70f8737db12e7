//! Markdown live-status board at `.agents/rpi/live-status.md`.

use chrono::Local;
use rpi_core::registry::write_atomic;
use rpi_core::stream::{summarize_action, PhaseProgress};
use rpi_core::types::Phase;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

#[derive(Debug)]
struct Board {
    phases: Vec<PhaseProgress>,
    current: usize,
}

#[derive(Debug)]
pub struct LiveStatus {
    path: PathBuf,
    board: Mutex<Board>,
}

impl LiveStatus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let phases = Phase::ALL
            .iter()
            .map(|p| PhaseProgress {
                current_action: "pending".to_string(),
                ..PhaseProgress::named(p.as_str())
            })
            .collect();
        Self {
            path: path.into(),
            board: Mutex::new(Board { phases, current: 0 }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace a phase's progress with the latest stream snapshot.
    pub fn update(&self, phase: Phase, progress: &PhaseProgress) {
        let mut board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = phase_index(phase);
        let retries = board.phases[idx].retry_count;
        board.phases[idx] = PhaseProgress {
            retry_count: retries.max(progress.retry_count),
            ..progress.clone()
        };
        board.current = idx;
        self.flush(&board);
    }

    /// Record an engine-side transition (started, retrying, failed).
    pub fn mark(&self, phase: Phase, action: &str, retries: u32, last_error: &str) {
        let mut board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = phase_index(phase);
        let entry = &mut board.phases[idx];
        if !action.is_empty() {
            entry.current_action = summarize_action(action);
        }
        entry.retry_count = retries;
        entry.last_error = summarize_action(last_error);
        entry.last_update = Some(chrono::Utc::now());
        board.current = idx;
        self.flush(&board);
    }

    pub fn render(&self) -> String {
        let board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
        render_board(&board)
    }

    fn flush(&self, board: &Board) {
        if let Err(e) = write_atomic(&self.path, render_board(board).as_bytes()) {
            debug!(error = %e, "could not write live status");
        }
    }
}

fn phase_index(phase: Phase) -> usize {
    (phase.number() - 1) as usize
}

fn field(raw: &str) -> String {
    let v = raw.replace('|', "/");
    let v = v.trim();
    if v.is_empty() {
        "-".to_string()
    } else {
        summarize_action(v)
    }
}

fn render_board(board: &Board) -> String {
    let mut out = String::from("# Live Status\n\n");
    out.push_str("| Phase | Status | Elapsed | Tools | Turns | Cost | Action | Retries | Last Error | Updated |\n");
    out.push_str("|-------|--------|---------|-------|-------|------|--------|---------|------------|---------|\n");
    for (i, p) in board.phases.iter().enumerate() {
        let status = match i.cmp(&board.current) {
            std::cmp::Ordering::Less => "done",
            std::cmp::Ordering::Equal => "running",
            std::cmp::Ordering::Greater => "pending",
        };
        let updated = p
            .last_update
            .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "| {} | {status} | {}s | {} | {} | ${:.4} | {} | {} | {} | {updated} |",
            p.name,
            p.elapsed.as_secs(),
            p.tool_count,
            p.turn_count,
            p.cost_usd,
            field(&p.current_action),
            p.retry_count,
            field(&p.last_error),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn renders_table_with_phase_states() {
        let dir = TempDir::new().unwrap();
        let status = LiveStatus::new(dir.path().join("live-status.md"));
        let progress = PhaseProgress {
            tool_count: 3,
            current_action: "tool: Edit | Write".into(),
            cost_usd: 0.5,
            ..PhaseProgress::named("implementation")
        };
        status.update(Phase::Implementation, &progress);

        let text = std::fs::read_to_string(status.path()).unwrap();
        assert!(text.starts_with("# Live Status\n\n| Phase | Status |"));
        assert!(text.contains("| discovery | done |"));
        assert!(text.contains("| implementation | running | 0s | 3 | 0 | $0.5000 | tool: Edit / Write |"));
        assert!(text.contains("| validation | pending |"));
    }

    #[test]
    fn mark_keeps_retry_count_across_updates() {
        let dir = TempDir::new().unwrap();
        let status = LiveStatus::new(dir.path().join("live-status.md"));
        status.mark(Phase::Validation, "retrying", 2, "gate FAIL");
        status.update(Phase::Validation, &PhaseProgress::named("validation"));
        let text = status.render();
        assert!(text.contains("| validation | running |"));
        assert!(text.contains("| 2 | - |"));
    }
}
