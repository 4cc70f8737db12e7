//! Output rendering for rpictl.
//!
//! Formats runs and orchestration log entries for terminal display.

use crate::inspect::RunRow;
use rpi_core::config::format_duration;
use rpi_core::orchestration_log::LogEntry;
use rpi_core::RunStatus;
use std::collections::BTreeMap;

/// Print runs in tabular format.
pub fn print_run_list(rows: &[RunRow]) {
    if rows.is_empty() {
        println!("No runs found.");
        return;
    }

    println!(
        "{:<14}  {:<14}  {:<11}  {:>7}  {:<28}  {:>9}",
        "RUN", "PHASE", "STATUS", "RETRIES", "VERDICTS", "ELAPSED"
    );
    println!("{}", "-".repeat(94));

    for row in rows {
        println!(
            "{:<14}  {:<14}  {:<11}  {:>7}  {:<28}  {:>9}",
            truncate(&row.run_id, 14),
            row.phase,
            format_status(row.status),
            row.retries,
            truncate(&format_verdicts(&row.verdicts), 28),
            format_elapsed(row),
        );
    }

    println!();
    println!("{} run(s)", rows.len());
}

/// Print everything known about one run.
pub fn print_run_details(row: &RunRow) {
    println!("Run: {}", row.run_id);
    println!();
    println!("  Goal:      {}", row.goal);
    println!("  Phase:     {}", row.phase);
    println!("  Status:    {}", format_status(row.status));
    println!("  Retries:   {}", row.retries);
    println!("  Elapsed:   {}", format_elapsed(row));
    println!("  State:     {}", row.root.display());
    if let Some(wt) = &row.worktree {
        println!("  Worktree:  {}", wt.display());
    }
    if !row.verdicts.is_empty() {
        println!();
        println!("  Verdicts:");
        for (gate, verdict) in &row.verdicts {
            println!("    {gate:<12} {verdict}");
        }
    }
}

pub fn print_runs_json(rows: &[RunRow]) -> serde_json::Result<()> {
    let out: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            serde_json::json!({
                "run_id": row.run_id,
                "goal": row.goal,
                "phase": row.phase,
                "status": row.status,
                "retries": row.retries,
                "verdicts": row.verdicts,
                "elapsed_seconds": row.elapsed.map(|d| d.as_secs()),
                "root": row.root,
                "worktree": row.worktree,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

pub fn print_log(entries: &[LogEntry]) {
    if entries.is_empty() {
        println!("No log entries found.");
        return;
    }
    for entry in entries {
        match &entry.run_id {
            Some(id) => println!(
                "{}  {:<12}  {:<16} {}",
                entry.timestamp, id, entry.phase, entry.details
            ),
            None => println!(
                "{}  {:<12}  {:<16} {}",
                entry.timestamp, "-", entry.phase, entry.details
            ),
        }
    }
}

fn format_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Failed => "FAILED",
        RunStatus::Interrupted => "INTERRUPTED",
        RunStatus::Stale => "STALE",
        RunStatus::Unknown => "UNKNOWN",
    }
}

fn format_verdicts(verdicts: &BTreeMap<String, String>) -> String {
    if verdicts.is_empty() {
        return "-".to_string();
    }
    verdicts
        .iter()
        .map(|(gate, verdict)| format!("{gate}={verdict}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_elapsed(row: &RunRow) -> String {
    row.elapsed.map_or_else(|| "-".to_string(), format_duration)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    }
}
