//! The phase state machine.
//!
//! One run drives discovery, implementation and validation in order, each
//! as a fresh agent session. After every phase the gate decides whether the
//! run advances, retries the phase with failure context, or escalates.
//! State is persisted before every externally visible step so a crash
//! between phases leaves a resumable run.

use crate::cleanup::{self, CleanupOptions};
use crate::executor::{
    command_available, select_executor, ExecutorConfig, ExecutorError, PhaseExecutor,
};
use crate::gate::{CliTracker, CouncilGate, GateError, PhaseGate};
use crate::git;
use crate::lease::{Lease, LeaseError};
use crate::live_status::LiveStatus;
use crate::worktree::{branch_for, WorktreeError, WorktreeManager};
use rpi_core::artifacts::{ArtifactError, PhaseArtifacts, PhaseResult, RESULT_SCHEMA_VERSION};
use rpi_core::complexity::{classify_complexity, Complexity};
use rpi_core::config::{format_duration, ConfigError};
use rpi_core::orchestration_log::OrchestrationLog;
use rpi_core::prompt::{build_phase_prompt, build_retry_prompt, RetryContext};
use rpi_core::registry::{new_run_id, now_rfc3339, Registry, RegistryError, RunState, StateLock};
use rpi_core::types::{FailureClass, GateAction, Phase, TerminalStatus};
use rpi_core::{GateFailure, RetryDecision, RunOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Background heartbeat refresh while a phase is running.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

pub const COMPLETED_REASON: &str = "all phases completed";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("runtime command \"{0}\" not found on PATH (required for spawning phase sessions)")]
    RuntimeMissing(String),
    #[error("worktree {0} from previous run no longer exists (was it removed?)")]
    PriorWorktreeMissing(String),
    #[error("create worktree: {0}")]
    CreateWorktree(#[source] WorktreeError),
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error("run state: {0}")]
    Registry(#[from] RegistryError),
    #[error("phase artifacts: {0}")]
    Artifact(#[from] ArtifactError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("phase {phase} ({name}) failed: {source}")]
    PhaseFailed {
        phase: u32,
        name: &'static str,
        source: ExecutorError,
    },
    #[error("phase {phase} ({name}) retry session failed: {source}")]
    RetryFailed {
        phase: u32,
        name: &'static str,
        source: ExecutorError,
    },
    #[error("phase {phase} ({name}) failed on re-run: {source}")]
    RerunFailed {
        phase: u32,
        name: &'static str,
        source: ExecutorError,
    },
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("{failure}; retries exhausted ({class})")]
    Escalated {
        class: FailureClass,
        failure: GateFailure,
    },
    #[error("run interrupted")]
    Interrupted,
    #[error("worktree merge failed: {0}")]
    Merge(#[source] WorktreeError),
    #[error("worktree cleanup failed: {0}")]
    Cleanup(#[source] WorktreeError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    fn phase_failed(phase: Phase, source: ExecutorError) -> Self {
        Self::PhaseFailed {
            phase: phase.number(),
            name: phase.as_str(),
            source,
        }
    }

    fn is_cancellation(&self) -> bool {
        match self {
            Self::Interrupted => true,
            Self::PhaseFailed { source, .. }
            | Self::RetryFailed { source, .. }
            | Self::RerunFailed { source, .. } => matches!(source, ExecutorError::Cancelled(_)),
            _ => false,
        }
    }
}

/// Outcome of a run that reached `completed`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: TerminalStatus,
    pub reason: String,
    pub backend: String,
    pub epic_id: String,
    pub verdicts: BTreeMap<String, String>,
    pub worktree_path: Option<PathBuf>,
    pub elapsed: Duration,
}

/// Run state written to the execution root and, for worktree runs, mirrored
/// to the repository root so readers still find it once the worktree is
/// gone.
#[derive(Debug, Clone)]
struct StateStore {
    primary: Registry,
    mirror: Option<Registry>,
}

impl StateStore {
    fn registries(&self) -> impl Iterator<Item = &Registry> {
        std::iter::once(&self.primary).chain(self.mirror.as_ref())
    }

    fn write(&self, state: &RunState) -> std::result::Result<(), RegistryError> {
        for registry in self.registries() {
            registry.save(state)?;
        }
        Ok(())
    }

    /// A terminal copy of the run written by someone else, e.g. `rpi cancel`.
    fn persisted_terminal(&self, run_id: &str) -> Option<RunState> {
        self.registries()
            .filter_map(|r| r.load_run(run_id).ok())
            .find(RunState::is_terminal)
    }

    /// Held from the terminal re-check through the write, so a concurrent
    /// `mark_terminal` either lands first and is adopted or lands after.
    fn lock_all(&self) -> std::result::Result<Vec<StateLock>, RegistryError> {
        self.registries().map(Registry::lock_state).collect()
    }

    /// Save without ever clearing a terminal status already on disk.
    fn save(&self, state: &mut RunState) -> std::result::Result<(), RegistryError> {
        let _locks = self.lock_all()?;
        if !state.is_terminal() {
            if let Some(persisted) = self.persisted_terminal(&state.run_id) {
                adopt_terminal(state, &persisted);
            }
        }
        self.write(state)
    }

    /// Record the run's outcome unless another writer already terminated
    /// it. Returns true when an existing terminal status was adopted.
    fn terminate(
        &self,
        state: &mut RunState,
        status: TerminalStatus,
        reason: &str,
    ) -> std::result::Result<bool, RegistryError> {
        let _locks = self.lock_all()?;
        let adopted = match self.persisted_terminal(&state.run_id) {
            Some(persisted) => {
                adopt_terminal(state, &persisted);
                true
            }
            None => {
                state.terminate(status, reason);
                false
            }
        };
        self.write(state)?;
        Ok(adopted)
    }

    fn heartbeat(&self, run_id: &str) {
        for registry in self.registries() {
            if let Err(e) = registry.touch_heartbeat(run_id) {
                warn!(run_id = %run_id, error = %e, "heartbeat update failed");
            }
        }
    }
}

fn adopt_terminal(state: &mut RunState, persisted: &RunState) {
    state.terminal_status = persisted.terminal_status;
    state.terminal_reason.clone_from(&persisted.terminal_reason);
    state.terminated_at.clone_from(&persisted.terminated_at);
}

/// Everything a prepared run holds until it finishes.
struct ActiveRun {
    root: PathBuf,
    worktree: Option<PathBuf>,
    manager: WorktreeManager,
    store: StateStore,
    log: OrchestrationLog,
    artifacts: PhaseArtifacts,
    executor: Arc<dyn PhaseExecutor>,
    live: Option<Arc<LiveStatus>>,
    lease: Lease,
    heartbeat_stop: CancellationToken,
    heartbeat_task: JoinHandle<()>,
    started: Instant,
}

impl ActiveRun {
    /// Transition heartbeat: registry heartbeat files and the lease.
    fn heartbeat(&self, run_id: &str) {
        self.store.heartbeat(run_id);
        if let Err(e) = self.lease.renew() {
            warn!(run_id = %run_id, error = %e, "supervisor lease renewal failed");
        }
    }
}

/// Drives phased runs with a fixed set of options.
pub struct PhasedEngine {
    opts: RunOptions,
    gate: Arc<dyn PhaseGate>,
    executor: Option<Arc<dyn PhaseExecutor>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PhasedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhasedEngine")
            .field("opts", &self.opts)
            .field("executor", &self.executor.as_ref().map(|e| e.name()))
            .finish_non_exhaustive()
    }
}

impl PhasedEngine {
    pub fn new(opts: RunOptions) -> Self {
        let tracker = CliTracker::new(opts.effective_tracker_command());
        Self {
            gate: Arc::new(CouncilGate::new(Box::new(tracker))),
            executor: None,
            cancel: CancellationToken::new(),
            opts,
        }
    }

    pub fn with_gate(mut self, gate: impl PhaseGate + 'static) -> Self {
        self.gate = Arc::new(gate);
        self
    }

    /// Use `executor` for every phase instead of selecting one from the
    /// runtime mode.
    pub fn with_executor(mut self, executor: impl PhaseExecutor + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.opts
    }

    /// Start or resume a run from `cwd`. Returns an error for setup
    /// failures, escalated or failed phases, interruption, and merge or
    /// cleanup problems after a completed run.
    pub async fn run(&self, cwd: &Path, goal: &str) -> Result<RunSummary> {
        let (run, mut state) = self.prepare(cwd, goal)?;
        let outcome = self.drive(&run, &mut state).await;
        self.finish(run, state, outcome).await
    }

    fn prepare(&self, cwd: &Path, goal: &str) -> Result<(ActiveRun, RunState)> {
        let cwd = std::fs::canonicalize(cwd)?;
        let repo_root = match git::repo_root(&cwd) {
            Ok(root) => root.canonicalize().unwrap_or(root),
            Err(e) if self.opts.no_worktree => {
                debug!(error = %e, "not a git repository; running in place");
                cwd.clone()
            }
            Err(e) => return Err(EngineError::CreateWorktree(e.into())),
        };

        let prior = if self.opts.from > Phase::Discovery {
            match Registry::new(&repo_root).load_current() {
                Ok(state) => Some(state),
                Err(e) => {
                    debug!(error = %e, "no prior run state to resume");
                    None
                }
            }
        } else {
            None
        };

        let goal = match &prior {
            Some(p) if goal.trim().is_empty() => p.goal.clone(),
            _ => goal.trim().to_string(),
        };
        self.opts.validate(&goal)?;
        if self.executor.is_none() {
            let command = self.opts.effective_runtime_command();
            if !command_available(command) {
                return Err(EngineError::RuntimeMissing(command.to_string()));
            }
        }

        let mut state = RunState::new(&goal, &self.opts);
        let mut inherited = None;
        if let Some(prior) = &prior {
            state.epic_id.clone_from(&prior.epic_id);
            state.fast_path = prior.fast_path || self.opts.fast_path;
            state.swarm_first = prior.swarm_first;
            state.test_first = prior.test_first || self.opts.test_first;
            state.verdicts.clone_from(&prior.verdicts);
            state.attempts.clone_from(&prior.attempts);
            state.cycle = prior.cycle;
            if let Some(path) = prior.worktree() {
                if !path.exists() {
                    return Err(EngineError::PriorWorktreeMissing(path.display().to_string()));
                }
                inherited = Some(path.to_path_buf());
                state.run_id.clone_from(&prior.run_id);
            } else if self.opts.no_worktree {
                state.run_id.clone_from(&prior.run_id);
            }
            println!(
                "Resuming from {} (previous run {})",
                self.opts.from,
                if prior.run_id.is_empty() { "-" } else { prior.run_id.as_str() }
            );
        }

        if self.opts.auto_clean_stale {
            let opts = CleanupOptions {
                all: true,
                stale_after: self.opts.auto_clean_stale_after,
                keep: prior.iter().map(|p| p.run_id.clone()).collect(),
                ..CleanupOptions::default()
            };
            if let Err(e) = cleanup::run_cleanup(&repo_root, &opts) {
                warn!(error = %e, "stale-run cleanup failed");
            }
        }

        let manager = WorktreeManager::new(&repo_root).with_merge_policy(
            self.opts.merge_dirty_retries,
            self.opts.merge_dirty_backoff,
        );
        let worktree = if inherited.is_some() {
            inherited
        } else if self.opts.no_worktree {
            None
        } else {
            let wt = manager
                .create(self.opts.require_clean)
                .map_err(EngineError::CreateWorktree)?;
            println!("Worktree created: {} (branch: {})", wt.path.display(), wt.branch);
            state.run_id = wt.run_id;
            Some(wt.path)
        };
        if state.run_id.is_empty() {
            state.run_id = new_run_id();
        }
        if let Some(path) = &worktree {
            state.worktree_path = path.display().to_string();
        }
        let root = worktree.clone().unwrap_or_else(|| repo_root.clone());

        let registry = Registry::new(&root);
        let repo_registry = Registry::new(&repo_root);
        std::fs::create_dir_all(registry.state_dir())?;
        std::fs::create_dir_all(repo_registry.state_dir())?;
        let artifacts = PhaseArtifacts::new(&root);
        if self.opts.from == Phase::Discovery {
            artifacts.clean();
        }

        let mut lease = Lease::acquire(
            &registry.lease_path(),
            &state.run_id,
            &root,
            self.opts.lease_ttl,
        )?;
        lease.start_renewal();

        let live = self
            .opts
            .live_status
            .then(|| Arc::new(LiveStatus::new(registry.live_status_path())));

        let (executor, reason): (Arc<dyn PhaseExecutor>, String) = match &self.executor {
            Some(executor) => (Arc::clone(executor), "configured executor".to_string()),
            None => {
                let config = ExecutorConfig::from_options(&self.opts, self.cancel.clone());
                let (executor, reason) = select_executor(self.opts.runtime_mode, config, live.clone());
                (Arc::from(executor), reason)
            }
        };
        state.backend = executor.name().to_string();
        state.orchestrator_pid = std::process::id() as i32;

        // The log stays at the repository root so it outlives the worktree.
        let log = OrchestrationLog::new(repo_registry.log_path(), state.run_id.clone());
        log.append(
            "backend-selection",
            &format!("backend={} reason=\"{reason}\"", state.backend),
        );
        log.append("start", &format!("goal=\"{goal}\" from={}", self.opts.from));
        info!(run_id = %state.run_id, backend = %state.backend, reason = %reason, "run starting");

        let store = StateStore {
            primary: registry,
            mirror: (root != repo_root).then_some(repo_registry),
        };
        // A resumed run id may carry an old terminal status; this run owns it now.
        store.write(&state)?;
        store.heartbeat(&state.run_id);

        let heartbeat_stop = CancellationToken::new();
        let heartbeat_task = {
            let store = store.clone();
            let run_id = state.run_id.clone();
            let stop = heartbeat_stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = stop.cancelled() => return,
                        () = tokio::time::sleep(HEARTBEAT_INTERVAL) => store.heartbeat(&run_id),
                    }
                }
            })
        };

        let run = ActiveRun {
            root,
            worktree,
            manager,
            store,
            log,
            artifacts,
            executor,
            live,
            lease,
            heartbeat_stop,
            heartbeat_task,
            started: Instant::now(),
        };
        Ok((run, state))
    }

    async fn drive(&self, run: &ActiveRun, state: &mut RunState) -> Result<()> {
        let start = state.current_phase()?;
        for phase in start.remaining() {
            if self.cancel.is_cancelled() || state.is_terminal() {
                return Err(EngineError::Interrupted);
            }
            if phase == Phase::Validation
                && state.fast_path
                && classify_complexity(&state.goal) == Complexity::Fast
            {
                println!("Skipping {phase} (fast path, goal complexity: fast)");
                run.log.append(phase.as_str(), "skipped: complexity fast");
                continue;
            }
            self.run_phase(run, state, phase).await?;
        }
        Ok(())
    }

    async fn run_phase(&self, run: &ActiveRun, state: &mut RunState, phase: Phase) -> Result<()> {
        let name = phase.as_str();
        state.phase = phase.number();
        run.store.save(state)?;
        if state.is_terminal() {
            return Err(EngineError::Interrupted);
        }

        let prompt = build_phase_prompt(Some(&run.root), state, phase);
        println!("\n=== Phase {}: {name} ===", phase.number());
        run.log.append(name, "started");
        run.heartbeat(&state.run_id);
        if let Some(live) = &run.live {
            live.mark(phase, "starting", state.attempts_for(phase), "");
        }
        info!(run_id = %state.run_id, phase = name, "phase started");

        let started_at = now_rfc3339();
        let started = Instant::now();
        if let Err(source) = run
            .executor
            .execute(&prompt, &run.root, &state.run_id, phase)
            .await
        {
            run.log.append(name, &format!("FAILED: {source}"));
            return Err(EngineError::phase_failed(phase, source));
        }

        let secs = started.elapsed().as_secs();
        run.log.append(name, &format!("completed in {secs}s"));
        println!("Phase {}: {name} completed in {secs}s", phase.number());
        run.artifacts.write_result(&PhaseResult {
            schema_version: RESULT_SCHEMA_VERSION,
            run_id: state.run_id.clone(),
            phase: phase.number(),
            phase_name: name.to_string(),
            status: "completed".to_string(),
            retries: state.attempts_for(phase),
            backend: state.backend.clone(),
            verdicts: state.verdicts.clone(),
            started_at,
            completed_at: now_rfc3339(),
            duration_seconds: started.elapsed().as_secs_f64(),
            ..PhaseResult::default()
        })?;
        run.heartbeat(&state.run_id);

        self.gate(run, state, phase).await?;

        if run.artifacts.handoff_detected(phase) {
            run.log.append(name, "handoff detected");
            println!("Phase {} wrote a handoff for the next session", phase.number());
        }
        match run.artifacts.ensure_summary(state, phase) {
            Ok(true) => run.log.append(name, "wrote fallback summary"),
            Ok(false) => {}
            Err(e) => warn!(phase = name, error = %e, "could not write phase summary"),
        }
        run.store.save(state)?;
        run.heartbeat(&state.run_id);
        Ok(())
    }

    /// Run the gate, retrying the phase with failure context until it
    /// passes or the attempt budget is spent.
    async fn gate(&self, run: &ActiveRun, state: &mut RunState, phase: Phase) -> Result<()> {
        let name = phase.as_str();
        let max = self.opts.max_retries;
        loop {
            let failure = match self.gate.check(&run.root, state, phase, &run.log) {
                Ok(()) => return Ok(()),
                Err(GateError::Failed(failure)) => failure,
                Err(e) => {
                    run.log.append(name, &format!("gate error: {e}"));
                    return Err(e.into());
                }
            };

            let attempt = state.bump_attempt(phase);
            run.store.save(state)?;
            let decision = RetryDecision::evaluate(&failure, attempt, max);
            if decision.action == GateAction::Escalate {
                let msg = format!(
                    "{name} escalated (attempt {attempt}/{max}). Last report: {}. Manual intervention needed.",
                    failure.report
                );
                println!("{msg}");
                run.log.append(name, &msg);
                run.log.failure_context(name, &failure);
                warn!(run_id = %state.run_id, phase = name, class = %decision.class, "retries exhausted");
                return Err(EngineError::Escalated {
                    class: decision.class,
                    failure,
                });
            }
            if state.is_terminal() {
                return Err(EngineError::Interrupted);
            }

            run.log.append(
                name,
                &format!(
                    "RETRY attempt {attempt}/{max} verdict={} report={} class={}",
                    failure.verdict, failure.report, decision.class
                ),
            );
            println!("{failure}; retrying {name} (attempt {attempt}/{max})");
            if let Some(live) = &run.live {
                live.mark(phase, "retrying", attempt, &failure.to_string());
            }

            let retry = RetryContext {
                attempt,
                max_retries: max,
                verdict: failure.verdict.clone(),
                report: failure.report.clone(),
                findings: failure.findings.clone(),
            };
            let retry_prompt = build_retry_prompt(Some(&run.root), state, phase, &retry);
            run.executor
                .execute(&retry_prompt, &run.root, &state.run_id, phase)
                .await
                .map_err(|source| {
                    run.log.append(name, &format!("RETRY FAILED: {source}"));
                    EngineError::RetryFailed {
                        phase: phase.number(),
                        name,
                        source,
                    }
                })?;

            let prompt = build_phase_prompt(Some(&run.root), state, phase);
            run.executor
                .execute(&prompt, &run.root, &state.run_id, phase)
                .await
                .map_err(|source| {
                    run.log.append(name, &format!("FAILED: {source}"));
                    EngineError::RerunFailed {
                        phase: phase.number(),
                        name,
                        source,
                    }
                })?;
            run.heartbeat(&state.run_id);
        }
    }

    fn terminal_outcome(&self, outcome: &Result<()>) -> (TerminalStatus, String) {
        match outcome {
            Ok(()) => (TerminalStatus::Completed, COMPLETED_REASON.to_string()),
            Err(e) if e.is_cancellation() || self.cancel.is_cancelled() => {
                (TerminalStatus::Interrupted, "interrupted by signal".to_string())
            }
            Err(EngineError::Escalated { class, .. }) => {
                (TerminalStatus::Failed, class.as_str().to_string())
            }
            Err(e) => (TerminalStatus::Failed, e.to_string()),
        }
    }

    async fn finish(
        &self,
        run: ActiveRun,
        mut state: RunState,
        outcome: Result<()>,
    ) -> Result<RunSummary> {
        let (status, reason) = self.terminal_outcome(&outcome);
        match run.store.terminate(&mut state, status, &reason) {
            Ok(true) => info!(
                run_id = %state.run_id,
                status = state.terminal_status.as_str(),
                "keeping terminal status recorded elsewhere"
            ),
            Ok(false) => {}
            Err(e) => {
                warn!(run_id = %state.run_id, error = %e, "could not persist terminal state");
                state.terminate(status, &reason);
            }
        }
        match &outcome {
            Ok(()) => run.log.append("complete", COMPLETED_REASON),
            Err(e) => {
                let phase = state.current_phase().map_or("run", |p| p.as_str());
                run.log
                    .append(phase, &format!("run {}: {e}", state.terminal_status.as_str()));
            }
        }

        run.heartbeat_stop.cancel();
        if let Err(e) = run.heartbeat_task.await {
            debug!(error = %e, "heartbeat task ended abnormally");
        }
        if let Err(e) = run.lease.release().await {
            warn!(error = %e, "could not release supervisor lease");
        }

        let mut result = match outcome {
            Ok(()) if state.terminal_status != TerminalStatus::Completed => {
                Err(EngineError::Interrupted)
            }
            other => other,
        };
        let mut worktree_kept = run.worktree.clone();
        if result.is_ok() {
            if let Some(path) = &run.worktree {
                match merge_and_remove(&run.manager, &run.log, path, &state.run_id) {
                    Ok(()) => worktree_kept = None,
                    Err(e) => result = Err(e),
                }
            }
        }

        let elapsed = run.started.elapsed();
        print_report(&state, elapsed, worktree_kept.as_deref());
        result.map(|()| RunSummary {
            run_id: state.run_id.clone(),
            status: state.terminal_status,
            reason: state.terminal_reason.clone(),
            backend: state.backend.clone(),
            epic_id: state.epic_id.clone(),
            verdicts: state.verdicts.clone(),
            worktree_path: run.worktree.clone(),
            elapsed,
        })
    }
}

fn merge_and_remove(
    manager: &WorktreeManager,
    log: &OrchestrationLog,
    path: &Path,
    run_id: &str,
) -> Result<()> {
    println!(
        "Merging {} into {}",
        branch_for(run_id),
        manager.repo_root().display()
    );
    manager.merge(path, run_id).map_err(|e| {
        log.failure_context("merge", &e);
        EngineError::Merge(e)
    })?;
    log.append("merge", &format!("merged {}", branch_for(run_id)));
    manager
        .remove_logged(path, run_id, log)
        .map_err(EngineError::Cleanup)?;
    log.append("cleanup", &format!("removed worktree {}", path.display()));
    println!("Worktree removed: {}", path.display());
    Ok(())
}

fn print_report(state: &RunState, elapsed: Duration, worktree_kept: Option<&Path>) {
    println!("\n=== RPI run {} ===", state.run_id);
    println!("Status:   {}", state.terminal_status.as_str());
    if !state.terminal_reason.is_empty() {
        println!("Reason:   {}", state.terminal_reason);
    }
    println!("Goal:     {}", state.goal);
    if !state.epic_id.is_empty() {
        println!("Epic:     {}", state.epic_id);
    }
    if !state.verdicts.is_empty() {
        let verdicts: Vec<String> = state
            .verdicts
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        println!("Verdicts: {}", verdicts.join(" "));
    }
    println!("Elapsed:  {}", format_duration(Duration::from_secs(elapsed.as_secs())));
    if let Some(path) = worktree_kept {
        println!("Worktree kept for inspection: {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor;
    use crate::git::test_support::{run as git_run, setup_test_repo};
    use async_trait::async_trait;
    use rpi_core::orchestration_log::read_entries;
    use std::sync::Mutex;
    use tempfile::TempDir;

    type Hook = Arc<dyn Fn(&Path, Phase) + Send + Sync>;

    #[derive(Clone, Default)]
    struct FakeExecutor {
        calls: Arc<Mutex<Vec<Phase>>>,
        fail_on: Option<Phase>,
        hook: Option<Hook>,
    }

    impl FakeExecutor {
        fn calls(&self) -> Vec<Phase> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PhaseExecutor for FakeExecutor {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn execute(
            &self,
            _prompt: &str,
            working_dir: &Path,
            _run_id: &str,
            phase: Phase,
        ) -> executor::Result<()> {
            self.calls.lock().unwrap().push(phase);
            if let Some(hook) = &self.hook {
                hook(working_dir, phase);
            }
            if self.fail_on == Some(phase) {
                return Err(ExecutorError::Exit {
                    command: "fake".into(),
                    code: 2,
                });
            }
            Ok(())
        }
    }

    /// Fails `phase` with FAIL `failures` times, passes everything else.
    struct ScriptedGate {
        phase: Phase,
        failures: Mutex<u32>,
    }

    impl ScriptedGate {
        fn failing(phase: Phase, failures: u32) -> Self {
            Self {
                phase,
                failures: Mutex::new(failures),
            }
        }

        fn passing() -> Self {
            Self::failing(Phase::Discovery, 0)
        }
    }

    impl PhaseGate for ScriptedGate {
        fn check(
            &self,
            _root: &Path,
            state: &mut RunState,
            phase: Phase,
            _log: &OrchestrationLog,
        ) -> crate::gate::Result<()> {
            if phase == Phase::Discovery {
                state.epic_id = "ag-1".into();
            }
            let mut left = self.failures.lock().unwrap();
            if phase == self.phase && *left > 0 {
                *left -= 1;
                return Err(GateError::Failed(GateFailure::new(
                    phase,
                    "FAIL",
                    ".agents/council/vibe.md",
                )));
            }
            Ok(())
        }
    }

    fn in_place() -> RunOptions {
        RunOptions {
            no_worktree: true,
            live_status: false,
            ..RunOptions::default()
        }
    }

    fn entries(root: &Path) -> Vec<String> {
        read_entries(&Registry::new(root).log_path(), None)
            .unwrap()
            .into_iter()
            .map(|e| format!("{}: {}", e.phase, e.details))
            .collect()
    }

    #[tokio::test]
    async fn completes_all_phases_in_place() {
        let dir = TempDir::new().unwrap();
        let exec = FakeExecutor::default();
        let engine = PhasedEngine::new(in_place())
            .with_executor(exec.clone())
            .with_gate(ScriptedGate::passing());

        let summary = engine.run(dir.path(), "add a flag").await.unwrap();
        assert_eq!(summary.status, TerminalStatus::Completed);
        assert_eq!(summary.reason, COMPLETED_REASON);
        assert_eq!(summary.backend, "fake");
        assert_eq!(exec.calls(), Phase::ALL.to_vec());

        let reg = Registry::new(dir.path());
        let state = reg.load_run(&summary.run_id).unwrap();
        assert_eq!(state.terminal_status, TerminalStatus::Completed);
        assert_eq!(state.phase, 3);
        assert_eq!(state.epic_id, "ag-1");
        assert_eq!(state.orchestrator_pid, std::process::id() as i32);
        assert!(reg.read_heartbeat(&summary.run_id).is_some());

        let artifacts = PhaseArtifacts::new(dir.path());
        for phase in Phase::ALL {
            assert!(artifacts.result_path(phase).exists());
            assert!(artifacts.summary_path(phase).exists());
        }
        let log = entries(dir.path());
        assert!(log.contains(&"backend-selection: backend=fake reason=\"configured executor\"".to_string()));
        assert!(log.iter().any(|l| l.starts_with("implementation: completed in")));
    }

    #[tokio::test]
    async fn always_failing_gate_escalates_after_max_retries() {
        let dir = TempDir::new().unwrap();
        let exec = FakeExecutor::default();
        let engine = PhasedEngine::new(in_place())
            .with_executor(exec.clone())
            .with_gate(ScriptedGate::failing(Phase::Validation, u32::MAX));

        let err = engine.run(dir.path(), "add a flag").await.unwrap_err();
        match &err {
            EngineError::Escalated { class, failure } => {
                assert_eq!(*class, FailureClass::VibeFail);
                assert_eq!(failure.phase, Phase::Validation);
            }
            other => panic!("unexpected error: {other}"),
        }

        let state = Registry::new(dir.path()).load_current().unwrap();
        assert_eq!(state.attempts["phase_3"], 3);
        assert_eq!(state.terminal_status, TerminalStatus::Failed);
        assert_eq!(state.terminal_reason, "vibe_fail");
        // Three phases, then a retry session plus a re-run for each of two retries.
        assert_eq!(exec.calls().len(), 7);

        let log = entries(dir.path());
        assert!(log.iter().any(|l| l.contains("RETRY attempt 1/3 verdict=FAIL")
            && l.contains("class=vibe_fail")));
        assert!(log.iter().any(|l| l.contains("escalated (attempt 3/3)")));
        assert!(log.iter().any(|l| l.contains("FAILURE_CONTEXT")));
    }

    #[tokio::test]
    async fn retry_recovers_and_completes() {
        let dir = TempDir::new().unwrap();
        let exec = FakeExecutor::default();
        let engine = PhasedEngine::new(in_place())
            .with_executor(exec.clone())
            .with_gate(ScriptedGate::failing(Phase::Implementation, 1));

        let summary = engine.run(dir.path(), "add a flag").await.unwrap();
        assert_eq!(summary.status, TerminalStatus::Completed);
        let state = Registry::new(dir.path()).load_run(&summary.run_id).unwrap();
        assert_eq!(state.attempts["phase_2"], 1);
        assert_eq!(
            exec.calls(),
            vec![
                Phase::Discovery,
                Phase::Implementation,
                Phase::Implementation,
                Phase::Implementation,
                Phase::Validation,
            ]
        );
    }

    #[tokio::test]
    async fn executor_failure_fails_the_run() {
        let dir = TempDir::new().unwrap();
        let exec = FakeExecutor {
            fail_on: Some(Phase::Implementation),
            ..FakeExecutor::default()
        };
        let engine = PhasedEngine::new(in_place())
            .with_executor(exec.clone())
            .with_gate(ScriptedGate::passing());

        let err = engine.run(dir.path(), "add a flag").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "phase 2 (implementation) failed: fake exited with code 2"
        );
        let state = Registry::new(dir.path()).load_current().unwrap();
        assert_eq!(state.terminal_status, TerminalStatus::Failed);
        assert_eq!(state.terminal_reason, err.to_string());
        assert_eq!(exec.calls(), vec![Phase::Discovery, Phase::Implementation]);
        assert!(entries(dir.path())
            .iter()
            .any(|l| l.starts_with("implementation: FAILED: fake exited")));
    }

    #[tokio::test]
    async fn fast_path_skips_validation_for_small_goals() {
        let dir = TempDir::new().unwrap();
        let exec = FakeExecutor::default();
        let opts = RunOptions {
            fast_path: true,
            ..in_place()
        };
        let engine = PhasedEngine::new(opts)
            .with_executor(exec.clone())
            .with_gate(ScriptedGate::passing());

        engine.run(dir.path(), "fix typo").await.unwrap();
        assert_eq!(exec.calls(), vec![Phase::Discovery, Phase::Implementation]);
        assert!(entries(dir.path())
            .contains(&"validation: skipped: complexity fast".to_string()));
    }

    #[tokio::test]
    async fn resume_keeps_history_and_goal() {
        let dir = TempDir::new().unwrap();
        let reg = Registry::new(dir.path());
        let mut prior = RunState::new("original goal", &RunOptions::default());
        prior.run_id = "prior1".into();
        prior.epic_id = "ag-9".into();
        prior.verdicts.insert("pre_mortem".into(), "WARN".into());
        prior.attempts.insert("phase_1".into(), 2);
        prior.terminate(TerminalStatus::Failed, "crank_blocked");
        reg.save(&prior).unwrap();

        let exec = FakeExecutor::default();
        let opts = RunOptions {
            from: Phase::Implementation,
            ..in_place()
        };
        let engine = PhasedEngine::new(opts)
            .with_executor(exec.clone())
            .with_gate(ScriptedGate::passing());

        let summary = engine.run(dir.path(), "").await.unwrap();
        assert_eq!(summary.run_id, "prior1");
        assert_eq!(exec.calls(), vec![Phase::Implementation, Phase::Validation]);

        let state = reg.load_run("prior1").unwrap();
        assert_eq!(state.goal, "original goal");
        assert_eq!(state.epic_id, "ag-9");
        assert_eq!(state.start_phase, 2);
        assert_eq!(state.attempts["phase_1"], 2);
        assert_eq!(state.verdicts["pre_mortem"], "WARN");
        assert_eq!(state.terminal_status, TerminalStatus::Completed);
    }

    #[tokio::test]
    async fn external_cancel_is_never_overwritten() {
        let dir = TempDir::new().unwrap();
        let hook: Hook = Arc::new(|root: &Path, phase: Phase| {
            if phase == Phase::Implementation {
                let reg = Registry::new(root);
                let run_id = reg.load_current().unwrap().run_id;
                reg.mark_terminal(&run_id, TerminalStatus::Interrupted, "cancelled by rpi cancel")
                    .unwrap();
            }
        });
        let exec = FakeExecutor {
            hook: Some(hook),
            ..FakeExecutor::default()
        };
        let engine = PhasedEngine::new(in_place())
            .with_executor(exec.clone())
            .with_gate(ScriptedGate::passing());

        let err = engine.run(dir.path(), "add a flag").await.unwrap_err();
        assert!(matches!(err, EngineError::Interrupted));
        assert_eq!(exec.calls(), vec![Phase::Discovery, Phase::Implementation]);
        let state = Registry::new(dir.path()).load_current().unwrap();
        assert_eq!(state.terminal_status, TerminalStatus::Interrupted);
        assert_eq!(state.terminal_reason, "cancelled by rpi cancel");
    }

    #[tokio::test]
    async fn worktree_run_merges_and_removes() {
        let (_dir, repo) = setup_test_repo();
        let hook: Hook = Arc::new(|root: &Path, phase: Phase| {
            if phase == Phase::Implementation {
                std::fs::write(root.join("feature.txt"), "done").unwrap();
                git_run(root, &["add", "feature.txt"]);
                git_run(root, &["commit", "-m", "feature"]);
            }
        });
        let exec = FakeExecutor {
            hook: Some(hook),
            ..FakeExecutor::default()
        };
        let opts = RunOptions {
            no_worktree: false,
            merge_dirty_backoff: Duration::from_millis(10),
            ..in_place()
        };
        let engine = PhasedEngine::new(opts)
            .with_executor(exec)
            .with_gate(ScriptedGate::passing());

        let summary = engine.run(&repo, "add a feature").await.unwrap();
        let wt = summary.worktree_path.clone().unwrap();
        assert!(!wt.exists());
        assert_eq!(std::fs::read_to_string(repo.join("feature.txt")).unwrap(), "done");
        assert!(!git::branch_exists(&repo, &branch_for(&summary.run_id)).unwrap());

        // The mirror at the repository root survives the worktree.
        let state = Registry::new(&repo).load_run(&summary.run_id).unwrap();
        assert_eq!(state.terminal_status, TerminalStatus::Completed);
        assert_eq!(state.worktree_path, wt.display().to_string());
        assert!(entries(&repo).iter().any(|l| l.starts_with("cleanup: removed worktree")));
    }

    #[tokio::test]
    async fn failed_worktree_run_keeps_worktree() {
        let (_dir, repo) = setup_test_repo();
        let exec = FakeExecutor {
            fail_on: Some(Phase::Discovery),
            ..FakeExecutor::default()
        };
        let opts = RunOptions {
            no_worktree: false,
            ..in_place()
        };
        let engine = PhasedEngine::new(opts)
            .with_executor(exec)
            .with_gate(ScriptedGate::passing());
        engine.run(&repo, "add a feature").await.unwrap_err();

        let state = Registry::new(&repo).load_current().unwrap();
        assert_eq!(state.terminal_status, TerminalStatus::Failed);
        assert!(state.worktree().unwrap().exists());
        assert!(Registry::new(state.worktree().unwrap())
            .load_run(&state.run_id)
            .is_ok());
    }

    #[tokio::test]
    async fn setup_errors() {
        let dir = TempDir::new().unwrap();
        let opts = RunOptions {
            runtime_command: "definitely-not-installed-rpi-agent".into(),
            ..in_place()
        };
        let err = PhasedEngine::new(opts)
            .run(dir.path(), "goal")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "runtime command \"definitely-not-installed-rpi-agent\" not found on PATH (required for spawning phase sessions)"
        );

        let err = PhasedEngine::new(in_place())
            .with_executor(FakeExecutor::default())
            .run(dir.path(), "  ")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "goal is required when starting from discovery");

        let reg = Registry::new(dir.path());
        let mut prior = RunState::new("goal", &RunOptions::default());
        prior.run_id = "gone1".into();
        prior.worktree_path = dir.path().join("removed").display().to_string();
        reg.save(&prior).unwrap();
        let opts = RunOptions {
            from: Phase::Validation,
            ..in_place()
        };
        let err = PhasedEngine::new(opts)
            .with_executor(FakeExecutor::default())
            .run(dir.path(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PriorWorktreeMissing(_)));
    }

    #[test]
    fn save_waits_for_cancel_and_adopts_its_status() {
        let dir = TempDir::new().unwrap();
        let store = StateStore {
            primary: Registry::new(dir.path().join("wt")),
            mirror: Some(Registry::new(dir.path().join("repo"))),
        };
        let mut state = RunState::new("goal", &RunOptions::default());
        state.run_id = "race1".into();
        store.write(&state).unwrap();

        // Stand in for a cancel that took the lock first.
        let held = store.primary.lock_state().unwrap();
        let writer = {
            let store = store.clone();
            let mut stale = state.clone();
            std::thread::spawn(move || {
                store.save(&mut stale).unwrap();
                stale
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(200));
        let mut cancelled = state.clone();
        cancelled.terminate(TerminalStatus::Interrupted, "cancelled by rpi cancel");
        store.primary.save(&cancelled).unwrap();
        drop(held);

        let saved = writer.join().unwrap();
        assert_eq!(saved.terminal_status, TerminalStatus::Interrupted);
        for registry in store.registries() {
            let on_disk = registry.load_run("race1").unwrap();
            assert_eq!(on_disk.terminal_status, TerminalStatus::Interrupted);
        }
    }
}
