//! Prompt assembly for phase sessions.
//!
//! Every prompt opens with the context-discipline and summary-contract
//! preamble so it survives compaction inside the agent session. Phases 2+
//! also carry a context block built from prior verdicts and summaries.

use crate::artifacts::PhaseArtifacts;
use crate::classify::Finding;
use crate::registry::RunState;
use crate::types::Phase;
use std::fmt::Write;
use std::path::Path;

pub const CONTEXT_HEADER: &str = "--- RPI Context (from prior phases) ---";

/// Feedback carried into a retried phase.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub attempt: u32,
    pub max_retries: u32,
    pub verdict: String,
    pub report: String,
    pub findings: Vec<Finding>,
}

fn context_budget(phase: Phase) -> &'static str {
    match phase {
        Phase::Discovery => {
            "BUDGET: This session runs research + plan + pre-mortem. Research: limit to ~15 file reads, \
             write findings to .agents/research/. Plan: write to .agents/plans/, focus on issue creation. \
             Pre-mortem: invoke /council, read the verdict, done. If pre-mortem FAILs, re-plan and re-run \
             pre-mortem within this session (max 3 attempts)."
        }
        Phase::Implementation => {
            "BUDGET (CRITICAL): Crank is the highest-risk phase for context. /crank spawns workers \
             internally. Do NOT re-read worker output into your context. Trust /crank to manage its \
             waves. Read only the completion status."
        }
        Phase::Validation => {
            "BUDGET: This session runs vibe + post-mortem. Vibe: invoke /council on recent changes, \
             read the verdict. Post-mortem: invoke /council + /retro, read output files, write summary. \
             Minimal context for both."
        }
    }
}

/// Context discipline block followed by the summary contract.
pub fn preamble(phase: Phase) -> String {
    let n = phase.number();
    format!(
        "CONTEXT DISCIPLINE: You are running inside rpi phased (phase {n} of 3). Each phase gets a FRESH context window. Stay disciplined:\n\
         - Do NOT accumulate large file contents in context. Read files JIT and extract only what you need.\n\
         - Do NOT explore broadly when narrow exploration suffices. Be surgical.\n\
         - Write findings, plans, and results to DISK (files in .agents/), not just in conversation.\n\
         - If you are delegating to workers or spawning agents, do NOT accumulate their full output. Read their result files from disk.\n\
         - If you notice context degradation (forgetting earlier instructions, repeating yourself, losing track of the goal), IMMEDIATELY write a handoff to .agents/rpi/phase-{n}-handoff.md with: (1) what you accomplished, (2) what remains, (3) key context. Then finish cleanly.\n\
         {budget}\n\
         \n\
         PHASE SUMMARY CONTRACT: Before finishing this session, write a concise summary (max 500 tokens) to .agents/rpi/phase-{n}-summary.md covering key insights, tradeoffs considered, and risks for subsequent phases. This file is read by the next phase.\n\
         \n",
        budget = context_budget(phase),
    )
}

fn swarm_step_hint(swarm_first: bool, hint: &str) -> String {
    if swarm_first {
        format!("Prefer: {hint}\nFallback direct command:\n")
    } else {
        String::new()
    }
}

/// The skill invocation for a phase, without preamble or context.
pub fn phase_invocation(state: &RunState, phase: Phase) -> String {
    let quick = if state.fast_path { " --quick" } else { "" };
    let test_first = if state.test_first { " --test-first" } else { "" };
    let mut out = String::new();
    match phase {
        Phase::Discovery => {
            if state.swarm_first {
                out.push_str(
                    "SWARM-FIRST EXECUTION CONTRACT:\n\
                     - Default to /swarm for each step in this phase (research, plan, pre-mortem) using a lead + worker team pattern.\n\
                     - If /swarm runtime is unavailable, execute the direct commands below in this same session.\n\
                     - Keep worker outputs on disk and consume thin summaries only.\n\n",
                );
            }
            out.push_str("Run these skills IN SEQUENCE. Do not skip any step.\n\n");
            let _ = write!(
                out,
                "STEP 1 - Research:\n{}/research \"{goal}\" --auto\n\n",
                swarm_step_hint(state.swarm_first, "execute this step via /swarm with research-focused workers."),
                goal = state.goal,
            );
            let _ = write!(
                out,
                "STEP 2 - Plan:\nAfter research completes, run:\n{}/plan \"{goal}\" --auto\n\n",
                swarm_step_hint(state.swarm_first, "execute this step via /swarm with planning/decomposition workers."),
                goal = state.goal,
            );
            let _ = write!(
                out,
                "STEP 3 - Pre-mortem:\nAfter plan completes, run:\n{}/pre-mortem{quick}\n\n",
                swarm_step_hint(
                    state.swarm_first,
                    "execute this step via /swarm (including council/critique workers when available)."
                ),
            );
            out.push_str(
                "If pre-mortem returns FAIL, re-run /plan with the findings and then /pre-mortem again. \
                 Max 3 total attempts. If still FAIL after 3 attempts, stop and report.\n\
                 If pre-mortem returns PASS or WARN, proceed.",
            );
        }
        Phase::Implementation => {
            if state.swarm_first {
                out.push_str(
                    "SWARM-FIRST EXECUTION CONTRACT:\n\
                     - Run implementation with swarm-managed waves by default (lead + worker teams).\n\
                     - Prefer crank paths that delegate to /swarm for wave execution.\n\n",
                );
            }
            let _ = write!(out, "/crank {}{test_first}", state.epic_id);
        }
        Phase::Validation => {
            if state.swarm_first {
                out.push_str(
                    "SWARM-FIRST EXECUTION CONTRACT:\n\
                     - Use swarm/team execution for validation and retrospective steps where available.\n\
                     - Keep validator and implementer contexts isolated; do not reuse implementation worker context.\n\n",
                );
            }
            out.push_str("Run these skills IN SEQUENCE. Do not skip any step.\n\n");
            let _ = write!(
                out,
                "STEP 1 - Vibe:\n{}/vibe{quick} recent\n\n",
                swarm_step_hint(state.swarm_first, "execute vibe using /swarm-driven validation workers."),
            );
            out.push_str(
                "If vibe returns FAIL, STOP and report the findings. Do NOT proceed to post-mortem.\n\
                 If vibe returns PASS or WARN, proceed.\n\n",
            );
            let _ = write!(
                out,
                "STEP 2 - Post-mortem:\n{}/post-mortem{quick} {}",
                swarm_step_hint(state.swarm_first, "execute post-mortem using /swarm-driven retro workers."),
                state.epic_id,
            );
        }
    }
    out
}

/// Goal, prior verdicts and prior summaries, or `None` when there is nothing to carry.
pub fn phase_context(root: Option<&Path>, state: &RunState, phase: Phase) -> Option<String> {
    let mut parts = Vec::new();
    if !state.goal.is_empty() {
        parts.push(format!("Goal: {}", state.goal));
    }
    for (key, verdict) in &state.verdicts {
        parts.push(format!("{} verdict: {verdict}", key.replace('_', "-")));
    }
    if let Some(summaries) = root.and_then(|r| PhaseArtifacts::new(r).read_prior_summaries(phase)) {
        parts.push(summaries);
    }
    if parts.is_empty() {
        return None;
    }
    Some(format!("{CONTEXT_HEADER}\n{}", parts.join("\n")))
}

/// Full prompt for a normal phase invocation.
pub fn build_phase_prompt(root: Option<&Path>, state: &RunState, phase: Phase) -> String {
    let mut prompt = preamble(phase);
    if phase != Phase::Discovery {
        if let Some(ctx) = phase_context(root, state, phase) {
            prompt.push_str(&ctx);
            prompt.push_str("\n\n");
        }
    }
    prompt.push_str(&phase_invocation(state, phase));
    prompt
}

fn retry_block(retry: &RetryContext) -> String {
    let mut out = format!(
        "RETRY CONTEXT (attempt {}/{}): the previous attempt ended with verdict {}",
        retry.attempt, retry.max_retries, retry.verdict
    );
    if !retry.report.is_empty() {
        let _ = write!(out, " (report: {})", retry.report);
    }
    out.push_str(
        ".\n\
         1. Start by summarizing what prior phases and attempts already accomplished (read .agents/rpi/ summaries).\n\
         2. Do NOT repeat work that already succeeded; keep completed changes and closed issues as they are.\n\
         3. Focus only on the reported failure below.\n",
    );
    out
}

fn findings_block(findings: &[Finding]) -> String {
    findings
        .iter()
        .map(|f| format!("FINDING: {} | FIX: {} | REF: {}\n", f.description, f.fix, f.reference))
        .collect()
}

/// Phase-specific retry invocation.
pub fn retry_invocation(state: &RunState, phase: Phase, retry: &RetryContext) -> String {
    match phase {
        Phase::Validation => {
            let test_first = if state.test_first { " --test-first" } else { "" };
            format!(
                "/crank {}{test_first}\n\nVibe FAIL (attempt {}/{}). Address these findings:\n{}",
                state.epic_id,
                retry.attempt,
                retry.max_retries,
                findings_block(&retry.findings)
            )
        }
        _ => {
            let mut out = phase_invocation(state, phase);
            if !retry.findings.is_empty() {
                out.push_str("\n\nAddress these findings:\n");
                out.push_str(&findings_block(&retry.findings));
            }
            out
        }
    }
}

/// Prompt for the corrective session run before a phase is re-executed.
pub fn build_retry_prompt(
    root: Option<&Path>,
    state: &RunState,
    phase: Phase,
    retry: &RetryContext,
) -> String {
    let mut prompt = preamble(phase);
    if let Some(ctx) = phase_context(root, state, phase) {
        prompt.push_str(&ctx);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&retry_block(retry));
    prompt.push('\n');
    prompt.push_str(&retry_invocation(state, phase, retry));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state() -> RunState {
        RunState {
            goal: "add retries".into(),
            epic_id: "ag-7".into(),
            swarm_first: false,
            ..RunState::default()
        }
    }

    #[test]
    fn discovery_prompt_has_preamble_and_steps() {
        let p = build_phase_prompt(None, &state(), Phase::Discovery);
        assert!(p.starts_with("CONTEXT DISCIPLINE: You are running inside rpi phased (phase 1 of 3)."));
        assert!(p.contains(".agents/rpi/phase-1-handoff.md"));
        assert!(p.contains("PHASE SUMMARY CONTRACT"));
        assert!(p.contains("/research \"add retries\" --auto"));
        assert!(p.contains("/plan \"add retries\" --auto"));
        assert!(p.contains("/pre-mortem\n"));
        assert!(!p.contains(CONTEXT_HEADER));
        assert!(!p.contains("SWARM-FIRST"));
    }

    #[test]
    fn fast_path_and_test_first_flags() {
        let mut s = state();
        s.fast_path = true;
        s.test_first = true;
        assert!(phase_invocation(&s, Phase::Discovery).contains("/pre-mortem --quick"));
        assert_eq!(phase_invocation(&s, Phase::Implementation), "/crank ag-7 --test-first");
        let v = phase_invocation(&s, Phase::Validation);
        assert!(v.contains("/vibe --quick recent"));
        assert!(v.ends_with("/post-mortem --quick ag-7"));
    }

    #[test]
    fn swarm_first_adds_contract() {
        let mut s = state();
        s.swarm_first = true;
        let p = phase_invocation(&s, Phase::Discovery);
        assert!(p.starts_with("SWARM-FIRST EXECUTION CONTRACT:"));
        assert!(p.contains("Fallback direct command:\n/research"));
    }

    #[test]
    fn later_phases_carry_context() {
        let dir = TempDir::new().unwrap();
        let artifacts = PhaseArtifacts::new(dir.path());
        std::fs::create_dir_all(artifacts.dir()).unwrap();
        std::fs::write(artifacts.summary_path(Phase::Discovery), "planned 3 issues").unwrap();

        let mut s = state();
        s.verdicts.insert("pre_mortem".into(), "PASS".into());
        let p = build_phase_prompt(Some(dir.path()), &s, Phase::Implementation);
        assert!(p.contains(
            "--- RPI Context (from prior phases) ---\nGoal: add retries\npre-mortem verdict: PASS\n[Phase 1: discovery]\nplanned 3 issues"
        ));
        assert!(p.ends_with("/crank ag-7"));
    }

    #[test]
    fn validation_retry_lists_findings() {
        let retry = RetryContext {
            attempt: 1,
            max_retries: 3,
            verdict: "FAIL".into(),
            report: ".agents/council/vibe.md".into(),
            findings: vec![Finding {
                description: "missing test".into(),
                fix: "add test".into(),
                reference: "src/lib.rs:10".into(),
            }],
        };
        let p = build_retry_prompt(None, &state(), Phase::Validation, &retry);
        assert!(p.starts_with("CONTEXT DISCIPLINE"));
        assert!(p.contains("summarizing what prior phases"));
        assert!(p.contains("Do NOT repeat work"));
        assert!(p.contains("Focus only on the reported failure"));
        assert!(p.ends_with(
            "/crank ag-7\n\nVibe FAIL (attempt 1/3). Address these findings:\nFINDING: missing test | FIX: add test | REF: src/lib.rs:10\n"
        ));
    }

    #[test]
    fn non_validation_retry_reuses_invocation() {
        let retry = RetryContext {
            attempt: 2,
            max_retries: 3,
            verdict: "BLOCKED".into(),
            ..RetryContext::default()
        };
        let p = build_retry_prompt(None, &state(), Phase::Implementation, &retry);
        assert!(p.contains("RETRY CONTEXT (attempt 2/3): the previous attempt ended with verdict BLOCKED."));
        assert!(p.ends_with("/crank ag-7"));
    }
}
