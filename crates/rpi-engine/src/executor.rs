//! Phase executor backends.
//!
//! - `direct`: spawn `<cmd> -p <prompt>` with inherited stdio and wait.
//! - `stream`: spawn with `--output-format stream-json`, fold events into
//!   `PhaseProgress`, and enforce startup, stall and phase deadlines.
//! - `stream` with fallback: transport failures of the stream backend
//!   re-run the phase through `direct`.

use crate::live_status::LiveStatus;
use crate::process::{self, CancelSignal, ProcessLister, PsLister};
use async_trait::async_trait;
use chrono::Utc;
use rpi_core::config::{format_duration, RunOptions};
use rpi_core::stream::StreamParser;
use rpi_core::types::{Phase, RuntimeMode};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between "still running" log lines for the direct backend.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Startup checks never run less often than this.
const MAX_STARTUP_CHECK: Duration = Duration::from_secs(5);

/// Stream lines longer than this are dropped whole.
const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("phase {phase} timed out after {after} (set --phase-timeout to increase)")]
    Timeout { phase: u32, after: String },
    #[error("stall detected: no stream activity for {0}")]
    Stall(String),
    #[error("stream startup timeout: no events received after {0}")]
    StartupTimeout(String),
    #[error("{command} exited with code {code}")]
    Exit { command: String, code: i32 },
    #[error("{command} terminated by signal")]
    Signaled { command: String },
    #[error("stream parse error: {0}")]
    Parse(String),
    #[error("stream startup timeout: stream completed without parseable events")]
    EmptyStream,
    #[error("agent reported error: {0}")]
    AgentReported(String),
    #[error("start {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("phase {0} cancelled")]
    Cancelled(u32),
    #[error("stream execution failed: {stream}; direct fallback failed: {direct}")]
    FallbackFailed {
        stream: Box<ExecutorError>,
        direct: Box<ExecutorError>,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Transport-level stream failures that warrant a direct re-run.
pub fn should_fallback_to_direct(err: &ExecutorError) -> bool {
    matches!(
        err,
        ExecutorError::StartupTimeout(_)
            | ExecutorError::Stall(_)
            | ExecutorError::Parse(_)
            | ExecutorError::EmptyStream
    )
}

#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, prompt: &str, working_dir: &Path, run_id: &str, phase: Phase)
        -> Result<()>;
}

/// Settings shared by the process-backed executors.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub command: String,
    pub phase_timeout: Duration,
    pub stall_timeout: Duration,
    pub startup_timeout: Duration,
    pub stall_check_interval: Duration,
    pub cancel: CancellationToken,
}

impl ExecutorConfig {
    pub fn from_options(opts: &RunOptions, cancel: CancellationToken) -> Self {
        Self {
            command: opts.effective_runtime_command().to_string(),
            phase_timeout: opts.phase_timeout,
            stall_timeout: opts.stall_timeout,
            startup_timeout: opts.stream_startup_timeout,
            stall_check_interval: opts.stall_check_interval,
            cancel,
        }
    }

    fn check_interval(&self) -> Duration {
        if self.stall_check_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.stall_check_interval
        }
    }

    fn startup_check_interval(&self) -> Duration {
        self.check_interval().min(MAX_STARTUP_CHECK)
    }

    fn timeout_error(&self, phase: Phase) -> ExecutorError {
        ExecutorError::Timeout {
            phase: phase.number(),
            after: format_duration(self.phase_timeout),
        }
    }

    fn exit_error(&self, status: ExitStatus) -> Option<ExecutorError> {
        if status.success() {
            return None;
        }
        Some(match status.code() {
            Some(code) => ExecutorError::Exit {
                command: self.command.clone(),
                code,
            },
            None => ExecutorError::Signaled {
                command: self.command.clone(),
            },
        })
    }
}

/// Base command with the nested-session guard variables removed.
fn agent_command(program: &str, prompt: &str, working_dir: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("-p").arg(prompt).current_dir(working_dir).kill_on_drop(true);
    for (key, _) in std::env::vars_os() {
        let name = key.to_string_lossy();
        if name == "CLAUDECODE" || name.starts_with("CLAUDE_CODE_") {
            cmd.env_remove(&key);
        }
    }
    cmd
}

fn spawn(cmd: &mut Command, program: &str) -> Result<Child> {
    cmd.spawn().map_err(|source| ExecutorError::Spawn {
        command: program.to_string(),
        source,
    })
}

/// Kill the agent and whatever it spawned. Descendants go first so they
/// are not reparented out of reach.
async fn kill(child: &mut Child, run_id: &str, reason: &str) {
    if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
        match PsLister.list() {
            Ok(procs) => {
                for descendant in process::descendants(pid, &procs) {
                    if let Err(err) = process::send_signal(descendant, CancelSignal::Kill) {
                        warn!(run_id = %run_id, pid = descendant, error = %err, "could not kill agent descendant");
                    }
                }
            }
            Err(err) => {
                warn!(run_id = %run_id, error = %err, "could not list agent descendants");
            }
        }
    }
    if let Err(err) = child.kill().await {
        warn!(run_id = %run_id, error = %err, reason, "failed to kill agent process");
    }
    if let Err(err) = child.wait().await {
        debug!(run_id = %run_id, error = %err, "reaping killed agent failed");
    }
}

/// Newline-delimited reader for agent output.
///
/// Invalid UTF-8 is replaced rather than treated as an error, and lines
/// over the limit are skipped. A partial line stays in `buf` between
/// calls, so `next_line` is cancel-safe inside `select!`.
#[derive(Debug)]
struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    limit: usize,
    overflow: bool,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_LINE_BYTES)
    }

    fn with_limit(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            limit,
            overflow: false,
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let chunk = self.inner.fill_buf().await?;
            if chunk.is_empty() {
                if self.buf.is_empty() && !self.overflow {
                    return Ok(None);
                }
                // Unterminated final line.
                return Ok(self.take_line());
            }

            let newline = chunk.iter().position(|&b| b == b'\n');
            let piece = &chunk[..newline.unwrap_or(chunk.len())];
            if self.overflow || self.buf.len() + piece.len() > self.limit {
                self.overflow = true;
                self.buf.clear();
            } else {
                self.buf.extend_from_slice(piece);
            }
            let used = newline.map_or(chunk.len(), |i| i + 1);
            self.inner.consume(used);

            if newline.is_some() {
                if let Some(line) = self.take_line() {
                    return Ok(Some(line));
                }
            }
        }
    }

    /// The buffered line, or None when it ran past the limit.
    fn take_line(&mut self) -> Option<String> {
        let mut bytes = std::mem::take(&mut self.buf);
        if std::mem::take(&mut self.overflow) {
            warn!(limit = self.limit, "dropping oversized stream line");
            return None;
        }
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        Some(match String::from_utf8(bytes) {
            Ok(line) => line,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }
}

/// Waits for process exit with inherited stdio.
#[derive(Debug, Clone)]
pub struct DirectExecutor {
    config: ExecutorConfig,
}

impl DirectExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PhaseExecutor for DirectExecutor {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn execute(
        &self,
        prompt: &str,
        working_dir: &Path,
        run_id: &str,
        phase: Phase,
    ) -> Result<()> {
        let cfg = &self.config;
        let mut cmd = agent_command(&cfg.command, prompt, working_dir);
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        debug!(run_id = %run_id, phase = phase.as_str(), command = %cfg.command, "spawning direct phase");
        let mut child = spawn(&mut cmd, &cfg.command)?;

        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if !cfg.phase_timeout.is_zero() && elapsed >= cfg.phase_timeout {
                warn!(run_id = %run_id, phase = phase.as_str(), "phase timed out; killing");
                kill(&mut child, run_id, "timeout").await;
                return Err(cfg.timeout_error(phase));
            }
            let remaining = if cfg.phase_timeout.is_zero() {
                Duration::MAX
            } else {
                cfg.phase_timeout.saturating_sub(elapsed)
            };

            tokio::select! {
                status = child.wait() => {
                    let status = status?;
                    return cfg.exit_error(status).map_or(Ok(()), Err);
                }
                () = cfg.cancel.cancelled() => {
                    info!(run_id = %run_id, phase = phase.as_str(), "cancellation requested; killing agent");
                    kill(&mut child, run_id, "cancelled").await;
                    return Err(ExecutorError::Cancelled(phase.number()));
                }
                () = tokio::time::sleep(HEARTBEAT_INTERVAL.min(remaining)) => {
                    debug!(
                        run_id = %run_id,
                        phase = phase.as_str(),
                        elapsed_sec = started.elapsed().as_secs(),
                        "agent still running"
                    );
                }
            }
        }
    }
}

/// Parses the structured event stream and watches for startup and stall.
#[derive(Debug, Clone)]
pub struct StreamExecutor {
    config: ExecutorConfig,
    live_status: Option<Arc<LiveStatus>>,
}

impl StreamExecutor {
    pub fn new(config: ExecutorConfig, live_status: Option<Arc<LiveStatus>>) -> Self {
        Self {
            config,
            live_status,
        }
    }
}

#[async_trait]
impl PhaseExecutor for StreamExecutor {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn execute(
        &self,
        prompt: &str,
        working_dir: &Path,
        run_id: &str,
        phase: Phase,
    ) -> Result<()> {
        let cfg = &self.config;
        let mut cmd = agent_command(&cfg.command, prompt, working_dir);
        cmd.args(["--output-format", "stream-json", "--verbose"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        debug!(run_id = %run_id, phase = phase.as_str(), command = %cfg.command, "spawning stream phase");
        let mut child = spawn(&mut cmd, &cfg.command)?;
        let Some(stdout) = child.stdout.take() else {
            kill(&mut child, run_id, "no stdout").await;
            return Err(ExecutorError::Parse("stdout pipe unavailable".to_string()));
        };
        let mut lines = LineReader::new(BufReader::new(stdout));

        let mut parser = StreamParser::new(phase.as_str());
        let started = Instant::now();
        let mut last_activity = started;
        let mut stdout_open = true;

        loop {
            let elapsed = started.elapsed();
            if !cfg.phase_timeout.is_zero() && elapsed >= cfg.phase_timeout {
                kill(&mut child, run_id, "timeout").await;
                return Err(cfg.timeout_error(phase));
            }
            if parser.has_started() {
                if !cfg.stall_timeout.is_zero() && last_activity.elapsed() >= cfg.stall_timeout {
                    kill(&mut child, run_id, "stall").await;
                    return Err(ExecutorError::Stall(format_duration(cfg.stall_timeout)));
                }
            } else if !cfg.startup_timeout.is_zero() && elapsed >= cfg.startup_timeout {
                kill(&mut child, run_id, "startup timeout").await;
                return Err(ExecutorError::StartupTimeout(format_duration(
                    cfg.startup_timeout,
                )));
            }

            let tick = if parser.has_started() {
                cfg.check_interval()
            } else {
                cfg.startup_check_interval()
            };
            let tick = if cfg.phase_timeout.is_zero() {
                tick
            } else {
                tick.min(cfg.phase_timeout.saturating_sub(elapsed))
            };

            tokio::select! {
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        parser.progress_mut().elapsed = started.elapsed();
                        if parser.feed_line(&line, Utc::now()) {
                            last_activity = Instant::now();
                            if let Some(status) = &self.live_status {
                                status.update(phase, parser.progress());
                            }
                        }
                    }
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        kill(&mut child, run_id, "read error").await;
                        return Err(ExecutorError::Parse(e.to_string()));
                    }
                },
                status = child.wait(), if !stdout_open => {
                    let status = status?;
                    if let Some(err) = cfg.exit_error(status) {
                        return Err(err);
                    }
                    break;
                }
                () = cfg.cancel.cancelled() => {
                    info!(run_id = %run_id, phase = phase.as_str(), "cancellation requested; killing agent");
                    kill(&mut child, run_id, "cancelled").await;
                    return Err(ExecutorError::Cancelled(phase.number()));
                }
                () = tokio::time::sleep(tick) => {}
            }
        }

        if !parser.has_started() {
            return Err(ExecutorError::EmptyStream);
        }
        if parser.saw_result_error() {
            return Err(ExecutorError::AgentReported(
                parser.progress().last_error.clone(),
            ));
        }
        info!(
            run_id = %run_id,
            phase = phase.as_str(),
            events = parser.events_seen(),
            tools = parser.progress().tool_count,
            cost_usd = parser.progress().cost_usd,
            "stream phase finished"
        );
        Ok(())
    }
}

/// Streaming first; transport failures fall back to direct.
#[derive(Debug, Clone)]
pub struct FallbackExecutor {
    stream: StreamExecutor,
    direct: DirectExecutor,
}

impl FallbackExecutor {
    pub fn new(stream: StreamExecutor, direct: DirectExecutor) -> Self {
        Self { stream, direct }
    }
}

#[async_trait]
impl PhaseExecutor for FallbackExecutor {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn execute(
        &self,
        prompt: &str,
        working_dir: &Path,
        run_id: &str,
        phase: Phase,
    ) -> Result<()> {
        let err = match self.stream.execute(prompt, working_dir, run_id, phase).await {
            Ok(()) => return Ok(()),
            Err(e) if should_fallback_to_direct(&e) => e,
            Err(e) => return Err(e),
        };
        println!(
            "Stream backend degraded for phase {}; falling back to direct execution ({err})",
            phase.number()
        );
        warn!(run_id = %run_id, phase = phase.as_str(), error = %err, "falling back to direct executor");
        self.direct
            .execute(prompt, working_dir, run_id, phase)
            .await
            .map_err(|direct| ExecutorError::FallbackFailed {
                stream: Box::new(err),
                direct: Box::new(direct),
            })
    }
}

/// Whether `command` resolves to an executable, either as a path or on `PATH`.
pub fn command_available(command: &str) -> bool {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return is_executable(candidate);
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(command))))
        .unwrap_or(false)
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Pick a backend for the run and explain why.
pub fn select_executor(
    mode: RuntimeMode,
    config: ExecutorConfig,
    live_status: Option<Arc<LiveStatus>>,
) -> (Box<dyn PhaseExecutor>, String) {
    match mode {
        RuntimeMode::Stream => (
            Box::new(StreamExecutor::new(config, live_status)),
            "runtime=stream".to_string(),
        ),
        RuntimeMode::Direct => (
            Box::new(DirectExecutor::new(config)),
            "runtime=direct".to_string(),
        ),
        RuntimeMode::Auto => {
            if command_available(&config.command) {
                let direct = DirectExecutor::new(config.clone());
                (
                    Box::new(FallbackExecutor::new(
                        StreamExecutor::new(config, live_status),
                        direct,
                    )),
                    "runtime=auto stream with direct fallback".to_string(),
                )
            } else {
                let reason = format!("runtime=auto {} not found; direct", config.command);
                (Box::new(DirectExecutor::new(config)), reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn config(command: String) -> ExecutorConfig {
        ExecutorConfig {
            command,
            phase_timeout: Duration::from_secs(20),
            stall_timeout: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(10),
            stall_check_interval: Duration::from_millis(50),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn direct_success_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let ok = DirectExecutor::new(config(script(dir.path(), "ok.sh", "exit 0")));
        ok.execute("p", dir.path(), "r", Phase::Discovery).await.unwrap();

        let cmd = script(dir.path(), "fail.sh", "exit 3");
        let fail = DirectExecutor::new(config(cmd.clone()));
        let err = fail
            .execute("p", dir.path(), "r", Phase::Discovery)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), format!("{cmd} exited with code 3"));
        assert!(!should_fallback_to_direct(&err));
    }

    #[tokio::test]
    async fn direct_receives_prompt_flag() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("args.txt");
        let cmd = script(dir.path(), "echo.sh", &format!("echo \"$1|$2\" > {}", out.display()));
        DirectExecutor::new(config(cmd))
            .execute("do the thing", dir.path(), "r", Phase::Implementation)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap().trim(), "-p|do the thing");
    }

    #[tokio::test]
    async fn direct_phase_timeout_kills() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(script(dir.path(), "slow.sh", "sleep 30"));
        cfg.phase_timeout = Duration::from_millis(200);
        let err = DirectExecutor::new(cfg)
            .execute("p", dir.path(), "r", Phase::Validation)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "phase 3 timed out after 200ms (set --phase-timeout to increase)"
        );
    }

    #[tokio::test]
    async fn direct_cancel_kills() {
        let dir = TempDir::new().unwrap();
        let cfg = config(script(dir.path(), "slow.sh", "sleep 30"));
        let token = cfg.cancel.clone();
        let exec = DirectExecutor::new(cfg);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });
        let err = exec.execute("p", dir.path(), "r", Phase::Discovery).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled(1)));
    }

    #[tokio::test]
    async fn stream_success_updates_live_status() {
        let dir = TempDir::new().unwrap();
        let body = r#"echo '{"type":"system","subtype":"init","session_id":"s1","model":"m"}'
echo 'garbage'
echo '{"type":"assistant","tool_name":"Read"}'
echo '{"type":"result","cost_usd":0.1,"num_turns":2}'"#;
        let status = Arc::new(LiveStatus::new(dir.path().join("live-status.md")));
        let exec = StreamExecutor::new(
            config(script(dir.path(), "stream.sh", body)),
            Some(Arc::clone(&status)),
        );
        exec.execute("p", dir.path(), "r", Phase::Implementation)
            .await
            .unwrap();
        let text = std::fs::read_to_string(status.path()).unwrap();
        assert!(text.contains("| implementation | running |"));
        assert!(text.contains("result received"));
    }

    #[tokio::test]
    async fn stream_skips_undecodable_and_oversized_lines() {
        let dir = TempDir::new().unwrap();
        let body = r#"echo '{"type":"system","subtype":"init","session_id":"s1","model":"m"}'
printf '\377\376 bad\n'
head -c 2000000 /dev/zero | tr '\0' 'x'
echo
echo '{"type":"result","cost_usd":0.1,"num_turns":2}'"#;
        StreamExecutor::new(config(script(dir.path(), "noisy.sh", body)), None)
            .execute("p", dir.path(), "r", Phase::Implementation)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn line_reader_decodes_lossily_and_bounds_length() {
        let input: &[u8] = b"ok\r\n\xff\xfe bad\n0123456789\nafter\ntail";
        let mut reader = LineReader::with_limit(input, 8);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("ok"));
        assert_eq!(
            reader.next_line().await.unwrap().as_deref(),
            Some("\u{fffd}\u{fffd} bad")
        );
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("after"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("tail"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    /// True once `pid` has exited, counting unreaped zombies as gone.
    fn exited(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn timeout_kills_agent_descendants() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let body = format!("sleep 30 &\necho $! > {}\nwait", pid_file.display());
        let mut cfg = config(script(dir.path(), "spawner.sh", &body));
        cfg.phase_timeout = Duration::from_millis(500);
        let err = DirectExecutor::new(cfg)
            .execute("p", dir.path(), "r", Phase::Implementation)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout { phase: 2, .. }));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let pid = pid.trim();
        let deadline = Instant::now() + Duration::from_secs(3);
        while !exited(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(exited(pid), "grandchild {pid} survived the timeout");
    }

    #[tokio::test]
    async fn stream_startup_timeout_is_fallback_eligible() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(script(dir.path(), "silent.sh", "sleep 30"));
        cfg.startup_timeout = Duration::from_millis(200);
        let err = StreamExecutor::new(cfg, None)
            .execute("p", dir.path(), "r", Phase::Discovery)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "stream startup timeout: no events received after 200ms"
        );
        assert!(should_fallback_to_direct(&err));
    }

    #[tokio::test]
    async fn stream_stall_after_first_event() {
        let dir = TempDir::new().unwrap();
        let body = "echo '{\"type\":\"init\"}'\nsleep 30";
        let mut cfg = config(script(dir.path(), "stall.sh", body));
        cfg.stall_timeout = Duration::from_millis(300);
        let err = StreamExecutor::new(cfg, None)
            .execute("p", dir.path(), "r", Phase::Implementation)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Stall(_)));
        assert!(should_fallback_to_direct(&err));
    }

    #[tokio::test]
    async fn stream_without_events_and_agent_errors() {
        let dir = TempDir::new().unwrap();
        let empty = StreamExecutor::new(config(script(dir.path(), "empty.sh", "echo nope")), None);
        let err = empty
            .execute("p", dir.path(), "r", Phase::Discovery)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::EmptyStream));
        assert!(should_fallback_to_direct(&err));

        let body = r#"echo '{"type":"result","is_error":true,"message":"quota exhausted"}'"#;
        let errs = StreamExecutor::new(config(script(dir.path(), "err.sh", body)), None);
        let err = errs
            .execute("p", dir.path(), "r", Phase::Discovery)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "agent reported error: quota exhausted");
        assert!(!should_fallback_to_direct(&err));

        let body = "echo '{\"type\":\"init\"}'\nexit 2";
        let exit = StreamExecutor::new(config(script(dir.path(), "exit.sh", body)), None);
        let err = exit
            .execute("p", dir.path(), "r", Phase::Discovery)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Exit { code: 2, .. }));
        assert!(!should_fallback_to_direct(&err));
    }

    #[tokio::test]
    async fn fallback_runs_direct_after_startup_timeout() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("direct-ran");
        // Silent when asked for stream output, succeeds when run directly.
        let body = format!(
            "case \"$*\" in *stream-json*) sleep 30 ;; *) touch {} ;; esac",
            marker.display()
        );
        let mut cfg = config(script(dir.path(), "agent.sh", &body));
        cfg.startup_timeout = Duration::from_millis(200);
        let exec = FallbackExecutor::new(
            StreamExecutor::new(cfg.clone(), None),
            DirectExecutor::new(cfg),
        );
        exec.execute("p", dir.path(), "r", Phase::Implementation)
            .await
            .unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn fallback_reports_both_failures() {
        let dir = TempDir::new().unwrap();
        let body = "case \"$*\" in *stream-json*) sleep 30 ;; *) exit 4 ;; esac";
        let mut cfg = config(script(dir.path(), "agent.sh", body));
        cfg.startup_timeout = Duration::from_millis(200);
        let exec = FallbackExecutor::new(
            StreamExecutor::new(cfg.clone(), None),
            DirectExecutor::new(cfg),
        );
        let err = exec
            .execute("p", dir.path(), "r", Phase::Implementation)
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("stream execution failed: stream startup timeout"));
        assert!(text.contains("direct fallback failed:"));
        assert!(text.ends_with("exited with code 4"));
    }

    #[test]
    fn selection_by_mode() {
        let dir = TempDir::new().unwrap();
        let cmd = script(dir.path(), "agent.sh", "exit 0");
        let (exec, reason) = select_executor(RuntimeMode::Direct, config(cmd.clone()), None);
        assert_eq!((exec.name(), reason.as_str()), ("direct", "runtime=direct"));
        let (exec, _) = select_executor(RuntimeMode::Stream, config(cmd.clone()), None);
        assert_eq!(exec.name(), "stream");
        let (exec, reason) = select_executor(RuntimeMode::Auto, config(cmd), None);
        assert_eq!(exec.name(), "stream");
        assert!(reason.contains("fallback"));

        let missing = dir.path().join("missing").display().to_string();
        let (exec, reason) = select_executor(RuntimeMode::Auto, config(missing), None);
        assert_eq!(exec.name(), "direct");
        assert!(reason.contains("not found"));
    }
}
