//! rpictl - inspect phased runs
//!
//! Read-only views over the run registries and orchestration log that
//! `rpi run phased` leaves on disk.

mod inspect;
mod render;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use rpi_core::RunStatus;

/// Inspect phased orchestration runs.
#[derive(Parser)]
#[command(name = "rpictl")]
#[command(about = "Inspect rpi phased orchestration runs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show runs found from the current directory
    Status {
        /// Show a single run in detail
        #[arg(long)]
        run_id: Option<String>,

        /// Only runs with this status: running, completed, failed,
        /// interrupted, stale or unknown
        #[arg(long, value_parser = parse_run_status)]
        status: Option<RunStatus>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the orchestration log
    Log {
        /// Only entries for this run
        #[arg(long)]
        run_id: Option<String>,

        /// Only the last N entries
        #[arg(long)]
        tail: Option<usize>,
    },
}

fn parse_run_status(s: &str) -> Result<RunStatus, String> {
    match s.to_lowercase().as_str() {
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "interrupted" => Ok(RunStatus::Interrupted),
        "stale" => Ok(RunStatus::Stale),
        "unknown" => Ok(RunStatus::Unknown),
        _ => Err(format!(
            "invalid status '{s}', expected: running, completed, failed, interrupted, stale, unknown"
        )),
    }
}

fn main() {
    let cli = Cli::parse();

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Status {
            run_id,
            status,
            json,
        } => run_status(&cwd, run_id.as_deref(), status, json),
        Command::Log { run_id, tail } => run_log(&cwd, run_id.as_deref(), tail),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run_status(
    cwd: &std::path::Path,
    run_id: Option<&str>,
    status: Option<RunStatus>,
    json: bool,
) -> eyre::Result<()> {
    let now = chrono::Utc::now();
    if let Some(id) = run_id {
        let row = inspect::find_run(cwd, id, now)?;
        if json {
            render::print_runs_json(std::slice::from_ref(&row))?;
        } else {
            render::print_run_details(&row);
        }
        return Ok(());
    }

    let mut rows = inspect::collect_runs(cwd, now);
    if let Some(status) = status {
        rows.retain(|r| r.status == status);
    }
    if json {
        render::print_runs_json(&rows)?;
    } else {
        render::print_run_list(&rows);
    }
    Ok(())
}

fn run_log(
    cwd: &std::path::Path,
    run_id: Option<&str>,
    tail: Option<usize>,
) -> eyre::Result<()> {
    let mut entries = inspect::log_entries(cwd, run_id)?;
    if let Some(n) = tail {
        let skip = entries.len().saturating_sub(n);
        entries.drain(..skip);
    }
    render::print_log(&entries);
    Ok(())
}
