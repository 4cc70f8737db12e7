//! Post-phase gates.
//!
//! Each phase is followed by a gate that reads what the agent left behind:
//! the external work tracker (epics and their children) and council
//! reports under `.agents/council/`. A failed gate carries a
//! [`GateFailure`] the retry flow can classify; any other error fails the
//! phase outright.

use regex::Regex;
use rpi_core::artifacts::{ArtifactError, PhaseArtifacts};
use rpi_core::classify::{Finding, GateFailure};
use rpi_core::orchestration_log::OrchestrationLog;
use rpi_core::registry::RunState;
use rpi_core::types::{Phase, Verdict};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

/// Findings carried into a retry prompt.
pub const MAX_FINDINGS: usize = 5;

const COUNCIL_DIR: &str = ".agents/council";

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Failed(GateFailure),
    #[error("{command} {args}: {reason}")]
    Tracker {
        command: String,
        args: String,
        reason: String,
    },
    #[error("no epic found in {0} list output")]
    NoEpic(String),
    #[error("discovery phase: could not extract epic ID (implementation needs this): {0}")]
    EpicMissing(Box<GateError>),
    #[error("phase {phase} prerequisite not met: {source}")]
    Prerequisite { phase: u32, source: ArtifactError },
    #[error("no council report matching {0:?} found")]
    ReportMissing(String),
    #[error("validation phase: vibe report not found (phase may not have completed): {0}")]
    VibeReportMissing(Box<GateError>),
    #[error("no verdict found in {0}")]
    VerdictMissing(PathBuf),
    #[error("validation phase: could not extract vibe verdict from {path}: {source}")]
    VibeVerdict {
        path: PathBuf,
        source: Box<GateError>,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, GateError>;

/// The external work tracker the agent plans into.
pub trait WorkTracker: Send + Sync {
    /// Newest open epic id.
    fn latest_open_epic(&self) -> Result<String>;

    /// Raw `children <epic>` listing, one issue per line.
    fn children(&self, epic: &str) -> Result<String>;

    /// Command name shown in gate reports.
    fn name(&self) -> &str {
        "bd"
    }
}

/// Tracker driven through its CLI (`bd` by default).
#[derive(Debug, Clone)]
pub struct CliTracker {
    command: String,
}

impl CliTracker {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let failed = |reason: String| GateError::Tracker {
            command: self.command.clone(),
            args: args.join(" "),
            reason,
        };
        let output = Command::new(&self.command)
            .args(args)
            .output()
            .map_err(|e| failed(e.to_string()))?;
        if !output.status.success() {
            return Err(failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl WorkTracker for CliTracker {
    fn latest_open_epic(&self) -> Result<String> {
        match self.run(&["list", "--type", "epic", "--status", "open", "--json"]) {
            Ok(out) => match parse_latest_epic_json(&out) {
                Some(id) => return Ok(id),
                None => debug!(command = %self.command, "epic JSON unusable; falling back to text"),
            },
            Err(e) => debug!(error = %e, "epic JSON listing failed; falling back to text"),
        }
        let out = self.run(&["list", "--type", "epic", "--status", "open"])?;
        parse_latest_epic_text(&out).ok_or_else(|| GateError::NoEpic(self.command.clone()))
    }

    fn children(&self, epic: &str) -> Result<String> {
        self.run(&["children", epic])
    }

    fn name(&self) -> &str {
        &self.command
    }
}

/// Last non-empty `id` in a JSON array of issues.
pub fn parse_latest_epic_json(data: &str) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct Entry {
        #[serde(default)]
        id: String,
    }
    let entries: Vec<Entry> = serde_json::from_str(data).ok()?;
    entries
        .into_iter()
        .rev()
        .map(|e| e.id.trim().to_string())
        .find(|id| !id.is_empty())
}

/// Last issue-like token (`prefix-id`) among the first three fields of any
/// line.
pub fn parse_latest_epic_text(output: &str) -> Option<String> {
    let id = Regex::new(r"^[a-z][a-z0-9]*-[a-z0-9][a-z0-9.]*$").ok()?;
    let mut latest = None;
    for line in output.lines() {
        let found = line
            .split_whitespace()
            .take(3)
            .map(|f| f.trim_matches(|c| matches!(c, '[' | ']' | '(' | ')')))
            .find(|t| id.is_match(t));
        if let Some(token) = found {
            latest = Some(token.to_string());
        }
    }
    latest
}

fn child_lines(output: &str) -> impl Iterator<Item = String> + '_ {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_lowercase)
}

/// A micro-epic has at most two children and none blocked.
pub fn parse_fast_path(output: &str) -> bool {
    let (total, blocked) = child_lines(output).fold((0, 0), |(t, b), line| {
        (t + 1, b + usize::from(line.contains("blocked")))
    });
    total <= 2 && blocked == 0
}

/// DONE when every child is closed (or there are none), BLOCKED when any
/// child is blocked, else PARTIAL.
pub fn parse_crank_completion(output: &str) -> Verdict {
    let mut total = 0;
    let mut closed = 0;
    let mut blocked = 0;
    for line in child_lines(output) {
        total += 1;
        if line.contains("closed") || line.contains('✓') {
            closed += 1;
        }
        if line.contains("blocked") {
            blocked += 1;
        }
    }
    if total == closed {
        Verdict::Done
    } else if blocked > 0 {
        Verdict::Blocked
    } else {
        Verdict::Partial
    }
}

/// Newest `*<pattern>*.md` under `.agents/council/`, preferring names that
/// contain the epic id. Newest means last by sorted name.
pub fn find_latest_council_report(root: &Path, pattern: &str, epic_id: &str) -> Result<PathBuf> {
    let dir = root.join(COUNCIL_DIR);
    let entries = std::fs::read_dir(&dir)
        .map_err(|_| GateError::ReportMissing(pattern.to_string()))?;

    let mut all = Vec::new();
    let mut scoped = Vec::new();
    for entry in entries.flatten() {
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.contains(pattern) || !name.ends_with(".md") {
            continue;
        }
        if !epic_id.is_empty() && name.contains(epic_id) {
            scoped.push(name.clone());
        }
        all.push(name);
    }

    let mut selected = if scoped.is_empty() { all } else { scoped };
    selected.sort();
    selected
        .pop()
        .map(|name| dir.join(name))
        .ok_or_else(|| GateError::ReportMissing(pattern.to_string()))
}

/// `## Council Verdict: PASS|WARN|FAIL`.
pub fn extract_council_verdict(report: &Path) -> Result<String> {
    let data = std::fs::read_to_string(report)?;
    let re = Regex::new(r"(?m)^## Council Verdict:\s*(PASS|WARN|FAIL)")?;
    re.captures(&data)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| GateError::VerdictMissing(report.to_path_buf()))
}

/// Structured `FINDING: .. | FIX: .. | REF: ..` lines, else numbered bold
/// items from the shared-findings list.
pub fn extract_council_findings(report: &Path, max: usize) -> Result<Vec<Finding>> {
    let data = std::fs::read_to_string(report)?;
    let structured = Regex::new(r"(?m)FINDING:\s*(.+?)\s*\|\s*FIX:\s*(.+?)\s*\|\s*REF:\s*(.+?)$")?;
    let mut findings: Vec<Finding> = structured
        .captures_iter(&data)
        .take(max)
        .map(|c| Finding {
            description: c[1].to_string(),
            fix: c[2].to_string(),
            reference: c[3].to_string(),
        })
        .collect();

    if findings.is_empty() {
        let numbered = Regex::new(r"(?m)^\d+\.\s+\*\*(.+?)\*\*\s*[—–-]\s*(.+)$")?;
        findings = numbered
            .captures_iter(&data)
            .take(max)
            .map(|c| Finding {
                description: format!("{}: {}", &c[1], &c[2]),
                fix: "See council report".to_string(),
                reference: report.display().to_string(),
            })
            .collect();
    }
    Ok(findings)
}

fn failure_from_report(phase: Phase, verdict: &str, report: &Path) -> GateFailure {
    let findings = extract_council_findings(report, MAX_FINDINGS).unwrap_or_else(|e| {
        warn!(report = %report.display(), error = %e, "could not extract council findings");
        Vec::new()
    });
    GateFailure::new(phase, verdict, report.display().to_string()).with_findings(findings)
}

/// Decides whether a finished phase may advance.
pub trait PhaseGate: Send + Sync {
    /// Inspect the phase's output under `root`, recording verdicts on
    /// `state`.
    fn check(
        &self,
        root: &Path,
        state: &mut RunState,
        phase: Phase,
        log: &OrchestrationLog,
    ) -> Result<()>;
}

/// Gate backed by the work tracker and council reports.
pub struct CouncilGate {
    tracker: Box<dyn WorkTracker>,
}

impl std::fmt::Debug for CouncilGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouncilGate").finish_non_exhaustive()
    }
}

impl CouncilGate {
    pub fn new(tracker: Box<dyn WorkTracker>) -> Self {
        Self { tracker }
    }

    fn discovery(&self, root: &Path, state: &mut RunState, log: &OrchestrationLog) -> Result<()> {
        let epic = self
            .tracker
            .latest_open_epic()
            .map_err(|e| GateError::EpicMissing(Box::new(e)))?;
        println!("Epic ID: {epic}");
        log.append("discovery", &format!("extracted epic: {epic}"));
        state.epic_id = epic;

        if !state.fast_path {
            match self.tracker.children(&state.epic_id) {
                Ok(out) if parse_fast_path(&out) => {
                    state.fast_path = true;
                    println!("Micro-epic detected; using fast path (--quick for gates)");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "fast-path detection failed (continuing without)"),
            }
        }

        let report = match find_latest_council_report(root, "pre-mortem", &state.epic_id) {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "pre-mortem council report not found");
                return Ok(());
            }
        };
        let verdict = match extract_council_verdict(&report) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "could not extract pre-mortem verdict");
                return Ok(());
            }
        };
        state.verdicts.insert("pre_mortem".into(), verdict.clone());
        println!("Pre-mortem verdict: {verdict}");
        log.append(
            "discovery",
            &format!("pre-mortem verdict: {verdict} report={}", report.display()),
        );
        if Verdict::normalize(&verdict) == Verdict::Fail {
            return Err(GateError::Failed(failure_from_report(
                Phase::Discovery,
                &verdict,
                &report,
            )));
        }
        Ok(())
    }

    fn implementation(
        &self,
        root: &Path,
        state: &RunState,
        log: &OrchestrationLog,
    ) -> Result<()> {
        if state.start_phase <= Phase::Discovery.number() {
            PhaseArtifacts::new(root)
                .validate_prior(Phase::Discovery)
                .map_err(|source| GateError::Prerequisite { phase: 2, source })?;
        }
        if state.epic_id.is_empty() {
            return Ok(());
        }
        let status = match self.tracker.children(&state.epic_id) {
            Ok(out) => parse_crank_completion(&out),
            Err(e) => {
                warn!(error = %e, "could not check crank completion (continuing to validation)");
                return Ok(());
            }
        };
        println!("Crank status: {status}");
        log.append("implementation", &format!("crank status: {status}"));
        if matches!(status, Verdict::Blocked | Verdict::Partial) {
            return Err(GateError::Failed(GateFailure::new(
                Phase::Implementation,
                status.as_str(),
                format!("{} children {}", self.tracker.name(), state.epic_id),
            )));
        }
        Ok(())
    }

    fn validation(&self, root: &Path, state: &mut RunState, log: &OrchestrationLog) -> Result<()> {
        if state.start_phase <= Phase::Implementation.number() {
            PhaseArtifacts::new(root)
                .validate_prior(Phase::Implementation)
                .map_err(|source| GateError::Prerequisite { phase: 3, source })?;
        }
        let report = find_latest_council_report(root, "vibe", &state.epic_id)
            .map_err(|e| GateError::VibeReportMissing(Box::new(e)))?;
        let verdict = extract_council_verdict(&report).map_err(|e| GateError::VibeVerdict {
            path: report.clone(),
            source: Box::new(e),
        })?;
        state.verdicts.insert("vibe".into(), verdict.clone());
        println!("Vibe verdict: {verdict}");
        log.append(
            "validation",
            &format!("vibe verdict: {verdict} report={}", report.display()),
        );
        if Verdict::normalize(&verdict) == Verdict::Fail {
            return Err(GateError::Failed(failure_from_report(
                Phase::Validation,
                &verdict,
                &report,
            )));
        }

        if let Ok(pm) = find_latest_council_report(root, "post-mortem", &state.epic_id) {
            if let Ok(pm_verdict) = extract_council_verdict(&pm) {
                println!("Post-mortem verdict: {pm_verdict}");
                log.append(
                    "validation",
                    &format!("post-mortem verdict: {pm_verdict} report={}", pm.display()),
                );
                state.verdicts.insert("post_mortem".into(), pm_verdict);
            }
        }
        Ok(())
    }
}

impl PhaseGate for CouncilGate {
    fn check(
        &self,
        root: &Path,
        state: &mut RunState,
        phase: Phase,
        log: &OrchestrationLog,
    ) -> Result<()> {
        match phase {
            Phase::Discovery => self.discovery(root, state, log),
            Phase::Implementation => self.implementation(root, state, log),
            Phase::Validation => self.validation(root, state, log),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpi_core::artifacts::PhaseResult;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeTracker {
        epic: Option<String>,
        children: Mutex<Option<String>>,
    }

    impl WorkTracker for FakeTracker {
        fn latest_open_epic(&self) -> Result<String> {
            self.epic.clone().ok_or_else(|| GateError::NoEpic("bd".into()))
        }

        fn children(&self, _epic: &str) -> Result<String> {
            self.children
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| GateError::Tracker {
                    command: "bd".into(),
                    args: "children".into(),
                    reason: "unavailable".into(),
                })
        }
    }

    fn council(root: &Path, name: &str, body: &str) -> PathBuf {
        let dir = root.join(COUNCIL_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn completed(root: &Path, phase: Phase) {
        PhaseArtifacts::new(root)
            .write_result(&PhaseResult {
                schema_version: 1,
                run_id: "r".into(),
                phase: phase.number(),
                phase_name: phase.as_str().into(),
                status: "completed".into(),
                ..PhaseResult::default()
            })
            .unwrap();
    }

    fn log(root: &Path) -> OrchestrationLog {
        OrchestrationLog::new(root.join("log"), "r")
    }

    #[test]
    fn epic_id_parsing() {
        let json = r#"[{"id":"ag-1"},{"id":"ag-2"},{"id":"  "}]"#;
        assert_eq!(parse_latest_epic_json(json).as_deref(), Some("ag-2"));
        assert_eq!(parse_latest_epic_json("not json"), None);

        let text = "○ bd-12 [epic] first\n○ [ag-3.1] second epic\nno ids here\n";
        assert_eq!(parse_latest_epic_text(text).as_deref(), Some("ag-3.1"));
        assert_eq!(parse_latest_epic_text("nothing\n"), None);
    }

    #[test]
    fn crank_and_fast_path_parsing() {
        assert_eq!(parse_crank_completion(""), Verdict::Done);
        assert_eq!(parse_crank_completion("a closed\nb ✓\n"), Verdict::Done);
        assert_eq!(parse_crank_completion("a closed\nb blocked\n"), Verdict::Blocked);
        assert_eq!(parse_crank_completion("a closed\nb open\n"), Verdict::Partial);

        assert!(parse_fast_path("a open\nb open\n"));
        assert!(!parse_fast_path("a\nb\nc\n"));
        assert!(!parse_fast_path("a BLOCKED\n"));
    }

    #[test]
    fn council_report_prefers_epic_and_newest_name() {
        let dir = TempDir::new().unwrap();
        council(dir.path(), "2026-01-01-vibe.md", "");
        council(dir.path(), "2026-01-03-vibe.md", "");
        let scoped = council(dir.path(), "2026-01-02-vibe-ag-9.md", "");
        council(dir.path(), "2026-01-04-vibe.txt", "");

        assert_eq!(find_latest_council_report(dir.path(), "vibe", "ag-9").unwrap(), scoped);
        assert!(find_latest_council_report(dir.path(), "vibe", "")
            .unwrap()
            .ends_with("2026-01-03-vibe.md"));
        let err = find_latest_council_report(dir.path(), "pre-mortem", "").unwrap_err();
        assert_eq!(err.to_string(), "no council report matching \"pre-mortem\" found");
    }

    #[test]
    fn findings_structured_then_numbered() {
        let dir = TempDir::new().unwrap();
        let body = "## Council Verdict: FAIL\n\
                    FINDING: missing test | FIX: add test | REF: src/a.rs:10\n\
                    FINDING: leak | FIX: close fd | REF: src/b.rs\n";
        let report = council(dir.path(), "vibe.md", body);
        assert_eq!(extract_council_verdict(&report).unwrap(), "FAIL");
        let findings = extract_council_findings(&report, 1).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].reference, "src/a.rs:10");

        let numbered = council(
            dir.path(),
            "pre-mortem.md",
            "## Shared Findings\n1. **Scope creep** - too many files\n",
        );
        let findings = extract_council_findings(&numbered, MAX_FINDINGS).unwrap();
        assert_eq!(findings[0].description, "Scope creep: too many files");
        assert_eq!(findings[0].fix, "See council report");
        assert!(matches!(
            extract_council_verdict(&numbered),
            Err(GateError::VerdictMissing(_))
        ));
    }

    #[test]
    fn discovery_records_epic_and_fails_on_pre_mortem_fail() {
        let dir = TempDir::new().unwrap();
        let gate = CouncilGate::new(Box::new(FakeTracker {
            epic: Some("ag-5".into()),
            children: Mutex::new(Some("a open\n".into())),
        }));
        let mut state = RunState::default();
        gate.check(dir.path(), &mut state, Phase::Discovery, &log(dir.path()))
            .unwrap();
        assert_eq!(state.epic_id, "ag-5");
        assert!(state.fast_path);

        council(dir.path(), "pre-mortem-ag-5.md", "## Council Verdict: FAIL\n");
        let err = gate
            .check(dir.path(), &mut state, Phase::Discovery, &log(dir.path()))
            .unwrap_err();
        let GateError::Failed(failure) = err else {
            panic!("expected gate failure");
        };
        assert_eq!(failure.class().as_str(), "pre_mortem_fail");
        assert_eq!(state.verdicts["pre_mortem"], "FAIL");
    }

    #[test]
    fn discovery_without_epic_is_fatal() {
        let dir = TempDir::new().unwrap();
        let gate = CouncilGate::new(Box::new(FakeTracker::default()));
        let err = gate
            .check(dir.path(), &mut RunState::default(), Phase::Discovery, &log(dir.path()))
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("discovery phase: could not extract epic ID (implementation needs this):"));
    }

    #[test]
    fn implementation_requires_prior_and_classifies_crank() {
        let dir = TempDir::new().unwrap();
        let tracker = FakeTracker {
            epic: Some("ag-1".into()),
            children: Mutex::new(Some("x closed\ny blocked\n".into())),
        };
        let gate = CouncilGate::new(Box::new(tracker));
        let mut state = RunState {
            epic_id: "ag-1".into(),
            ..RunState::default()
        };
        let err = gate
            .check(dir.path(), &mut state, Phase::Implementation, &log(dir.path()))
            .unwrap_err();
        assert!(err.to_string().starts_with("phase 2 prerequisite not met:"));

        completed(dir.path(), Phase::Discovery);
        let err = gate
            .check(dir.path(), &mut state, Phase::Implementation, &log(dir.path()))
            .unwrap_err();
        assert_eq!(err.to_string(), "gate FAIL at phase 2: BLOCKED (report: bd children ag-1)");

        state.start_phase = 2;
        std::fs::remove_file(PhaseArtifacts::new(dir.path()).result_path(Phase::Discovery))
            .unwrap();
        assert!(gate
            .check(dir.path(), &mut state, Phase::Implementation, &log(dir.path()))
            .is_err());
    }

    #[test]
    fn validation_requires_vibe_report() {
        let dir = TempDir::new().unwrap();
        let gate = CouncilGate::new(Box::new(FakeTracker::default()));
        let mut state = RunState {
            start_phase: 3,
            ..RunState::default()
        };
        let err = gate
            .check(dir.path(), &mut state, Phase::Validation, &log(dir.path()))
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("validation phase: vibe report not found"));

        council(dir.path(), "vibe.md", "## Council Verdict: WARN\n");
        council(dir.path(), "post-mortem.md", "## Council Verdict: PASS\n");
        gate.check(dir.path(), &mut state, Phase::Validation, &log(dir.path()))
            .unwrap();
        assert_eq!(state.verdicts["vibe"], "WARN");
        assert_eq!(state.verdicts["post_mortem"], "PASS");

        let text = std::fs::read_to_string(dir.path().join("log")).unwrap();
        assert!(text.contains("validation: vibe verdict: WARN report="));
    }
}
