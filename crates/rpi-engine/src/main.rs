//! rpi - phased orchestration CLI
//!
//! `run phased` drives a goal through discovery, implementation and
//! validation; `cancel` and `cleanup` act on runs found on disk.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Args, Parser, Subcommand};
use rpi_core::config::parse_duration;
use rpi_core::types::{Phase, RuntimeMode};
use rpi_core::RunOptions;
use rpi_engine::cleanup::{run_cleanup, CleanupOptions};
use rpi_engine::process::{CancelSignal, PsLister};
use rpi_engine::supervisor::{cancel_runs, CancelOptions};
use rpi_engine::{git, PhasedEngine};
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Research, implement and validate a goal in isolated agent sessions.
#[derive(Parser)]
#[command(name = "rpi", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start or resume a run
    Run {
        #[command(subcommand)]
        mode: RunMode,
    },

    /// Signal a run's processes and mark it interrupted
    Cancel {
        /// Run ID to cancel
        run_id: Option<String>,

        /// Run ID to cancel (alternative to the positional form)
        #[arg(long = "run-id", conflicts_with = "run_id")]
        run_id_flag: Option<String>,

        /// Cancel every active run
        #[arg(long)]
        all: bool,

        /// Signal to send: TERM, KILL or INT
        #[arg(long, default_value = "TERM", value_parser = parse_signal)]
        signal: CancelSignal,

        /// List targets without signalling
        #[arg(long)]
        dry_run: bool,
    },

    /// Mark abandoned runs stale and remove leftover worktrees
    Cleanup {
        /// Clean a single run
        #[arg(long)]
        run_id: Option<String>,

        /// Clean every stale run
        #[arg(long)]
        all: bool,

        /// Run `git worktree prune` afterwards
        #[arg(long)]
        prune: bool,

        /// Report without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Only clean runs older than this (e.g. 24h)
        #[arg(long, value_parser = parse_duration_arg)]
        stale_after: Option<Duration>,
    },
}

#[derive(Subcommand)]
enum RunMode {
    /// Run each phase as a fresh agent session
    Phased(PhasedArgs),
}

#[derive(Args)]
struct PhasedArgs {
    /// What to build
    #[arg(default_value = "")]
    goal: String,

    /// Phase to start from: discovery, implementation or validation
    #[arg(long, value_parser = parse_phase)]
    from: Option<Phase>,

    /// Gate attempts per phase before escalating
    #[arg(long)]
    max_retries: Option<u32>,

    /// Maximum wall time per phase session (e.g. 90m)
    #[arg(long, value_parser = parse_duration_arg)]
    phase_timeout: Option<Duration>,

    /// Fail a streaming session after this long without events
    #[arg(long, value_parser = parse_duration_arg)]
    stall_timeout: Option<Duration>,

    /// Fall back to direct execution if no stream event arrives in time
    #[arg(long, value_parser = parse_duration_arg)]
    stream_startup_timeout: Option<Duration>,

    /// Run in the current checkout instead of a sibling worktree
    #[arg(long)]
    no_worktree: bool,

    /// Refuse to start when the repository has uncommitted changes
    #[arg(long)]
    require_clean: bool,

    /// Skip validation for small goals
    #[arg(long)]
    fast_path: bool,

    /// Ask implementation to write tests first
    #[arg(long)]
    test_first: bool,

    /// Do not rewrite .agents/rpi/live-status.md
    #[arg(long)]
    no_live_status: bool,

    /// Executor backend: auto, direct or stream
    #[arg(long, value_parser = parse_runtime)]
    runtime: Option<RuntimeMode>,

    /// Agent command to spawn
    #[arg(long = "runtime-cmd")]
    runtime_cmd: Option<String>,

    /// Work tracker command
    #[arg(long = "tracker-cmd")]
    tracker_cmd: Option<String>,

    /// Clean stale runs before starting
    #[arg(long)]
    auto_clean_stale: bool,

    /// Age threshold for --auto-clean-stale (implies it)
    #[arg(long, value_parser = parse_duration_arg)]
    auto_clean_stale_after: Option<Duration>,
}

impl PhasedArgs {
    /// Flags over environment over `.agents/rpi/config` over defaults.
    fn options(&self, repo_root: &Path) -> eyre::Result<RunOptions> {
        let mut opts = RunOptions::for_repo(repo_root)?;
        opts.apply_env(|key| std::env::var(key).ok())?;

        if let Some(from) = self.from {
            opts.from = from;
        }
        if let Some(n) = self.max_retries {
            opts.max_retries = n;
        }
        if let Some(d) = self.phase_timeout {
            opts.phase_timeout = d;
        }
        if let Some(d) = self.stall_timeout {
            opts.stall_timeout = d;
        }
        if let Some(d) = self.stream_startup_timeout {
            opts.stream_startup_timeout = d;
        }
        if let Some(mode) = self.runtime {
            opts.runtime_mode = mode;
        }
        if let Some(cmd) = &self.runtime_cmd {
            opts.runtime_command.clone_from(cmd);
        }
        if let Some(cmd) = &self.tracker_cmd {
            opts.tracker_command.clone_from(cmd);
        }
        if let Some(d) = self.auto_clean_stale_after {
            opts.auto_clean_stale = true;
            opts.auto_clean_stale_after = d;
        }
        opts.no_worktree |= self.no_worktree;
        opts.require_clean |= self.require_clean;
        opts.fast_path |= self.fast_path;
        opts.test_first |= self.test_first;
        opts.auto_clean_stale |= self.auto_clean_stale;
        if self.no_live_status {
            opts.live_status = false;
        }
        Ok(opts)
    }
}

fn parse_phase(s: &str) -> Result<Phase, String> {
    Phase::parse(s).map_err(|e| e.to_string())
}

fn parse_runtime(s: &str) -> Result<RuntimeMode, String> {
    RuntimeMode::parse(s).map_err(|e| e.to_string())
}

fn parse_signal(s: &str) -> Result<CancelSignal, String> {
    CancelSignal::parse(s).map_err(|e| e.to_string())
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).ok_or_else(|| format!("invalid duration '{s}', expected e.g. 90m, 45s, 2h"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> eyre::Result<ExitCode> {
    let cwd = std::env::current_dir()?;
    match cli.command {
        Command::Run {
            mode: RunMode::Phased(args),
        } => run_phased(&cwd, &args),
        Command::Cancel {
            run_id,
            run_id_flag,
            all,
            signal,
            dry_run,
        } => cancel(
            &cwd,
            CancelOptions {
                run_id: run_id.or(run_id_flag),
                all,
                signal,
                dry_run,
            },
        ),
        Command::Cleanup {
            run_id,
            all,
            prune,
            dry_run,
            stale_after,
        } => cleanup(
            &cwd,
            &CleanupOptions {
                run_id,
                all,
                prune,
                dry_run,
                stale_after: stale_after.unwrap_or_default(),
                keep: Vec::new(),
            },
        ),
    }
}

fn run_phased(cwd: &Path, args: &PhasedArgs) -> eyre::Result<ExitCode> {
    let repo_root = git::repo_root(cwd).unwrap_or_else(|_| cwd.to_path_buf());
    let opts = args.options(&repo_root)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let cancel = CancellationToken::new();
        spawn_signal_handler(cancel.clone());

        let engine = PhasedEngine::new(opts).with_cancel(cancel);
        match engine.run(cwd, &args.goal).await {
            Ok(summary) => {
                info!(run_id = %summary.run_id, "run completed");
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                eprintln!("error: {e}");
                Ok(ExitCode::FAILURE)
            }
        }
    })
}

/// Cancel the run token on SIGINT or SIGTERM so the active phase is killed
/// and the run is recorded as interrupted.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(error = %e, "could not register signal handlers");
                        return;
                    }
                };
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, interrupting run"),
                _ = sigterm.recv() => info!("received SIGTERM, interrupting run"),
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("received interrupt, interrupting run");
        }

        cancel.cancel();
    });
}

fn cancel(cwd: &Path, opts: CancelOptions) -> eyre::Result<ExitCode> {
    let report = cancel_runs(cwd, &opts, &PsLister)?;
    if report.targets.is_empty() {
        if let Some(id) = &opts.run_id {
            eprintln!("error: no active run matched {id}");
            return Ok(ExitCode::FAILURE);
        }
        return Ok(ExitCode::SUCCESS);
    }
    if opts.dry_run {
        println!("{} target(s) would be cancelled.", report.targets.len());
    } else {
        println!(
            "Cancelled {} run(s); updated {} state file(s).",
            report.targets.len(),
            report.marked.len()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cleanup(cwd: &Path, opts: &CleanupOptions) -> eyre::Result<ExitCode> {
    let report = run_cleanup(cwd, opts)?;
    if !opts.dry_run && !report.candidates.is_empty() {
        println!(
            "Cleanup: {} marked stale, {} worktree(s) removed.",
            report.marked.len(),
            report.removed.len()
        );
    }
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(ExitCode::SUCCESS)
}
