//! Stream parser: folds agent events into cumulative phase progress.
//!
//! The parser is line-oriented and synchronous; the executor owns the
//! async read loop and the startup/stall deadlines, and feeds lines here.

use crate::events::{StreamEvent, StreamEventType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::trace;

/// Longest action summary kept for status rendering.
const MAX_ACTION_LEN: usize = 72;

/// Progress for one phase invocation. Rebuilt from the stream every time a
/// phase is spawned; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseProgress {
    pub name: String,
    pub session_id: String,
    pub model: String,
    pub last_tool: String,
    pub current_action: String,
    pub retry_count: u32,
    pub last_error: String,
    pub tool_count: u32,
    pub turn_count: u32,
    pub cost_usd: f64,
    pub elapsed: Duration,
    pub last_update: Option<DateTime<Utc>>,
}

impl PhaseProgress {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Fold one event into the running totals.
    pub fn apply(&mut self, event: &StreamEvent) {
        if event.is_init() {
            if let Some(session) = &event.session_id {
                self.session_id.clone_from(session);
            }
            if let Some(model) = &event.model {
                self.model.clone_from(model);
            }
            self.current_action = "initialized".to_string();
            return;
        }

        match event.event_type {
            StreamEventType::Assistant => {
                if let Some(tool) = event.tool_name.as_deref().filter(|t| !t.is_empty()) {
                    self.tool_count += 1;
                    self.last_tool = tool.to_string();
                    self.current_action = format!("tool: {tool}");
                } else if let Some(text) = event.message_text().filter(|t| !t.trim().is_empty()) {
                    self.current_action = summarize_action(&text);
                }
            }
            StreamEventType::Result => {
                if let Some(cost) = event.cost_usd {
                    self.cost_usd = cost;
                }
                if let Some(turns) = event.num_turns {
                    self.turn_count = turns;
                }
                if let Some(ms) = event.duration_ms.filter(|ms| *ms > 0.0) {
                    self.elapsed = Duration::from_secs_f64(ms / 1000.0);
                }
                if event.is_error.unwrap_or(false) {
                    self.current_action = "result error".to_string();
                    self.last_error = event
                        .message_text()
                        .filter(|t| !t.trim().is_empty())
                        .map(|t| summarize_action(&t))
                        .unwrap_or_else(|| "result event reported error".to_string());
                } else {
                    self.current_action = "result received".to_string();
                }
            }
            _ => {}
        }
    }
}

/// Collapse whitespace and cap at the status column width.
pub fn summarize_action(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_ACTION_LEN {
        return collapsed;
    }
    let head: String = collapsed.chars().take(MAX_ACTION_LEN - 3).collect();
    format!("{head}...")
}

/// Decode one line. Blank and malformed lines yield `None`.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<StreamEvent>(trimmed) {
        Ok(event) => Some(event),
        Err(err) => {
            trace!(error = %err, "skipping malformed stream line");
            None
        }
    }
}

/// Incremental parser state for one phase invocation.
#[derive(Debug, Clone, Default)]
pub struct StreamParser {
    progress: PhaseProgress,
    events_seen: u64,
    result_error: bool,
}

impl StreamParser {
    pub fn new(phase_name: impl Into<String>) -> Self {
        Self {
            progress: PhaseProgress::named(phase_name),
            ..Self::default()
        }
    }

    /// Feed one raw line. Returns true when an event was applied.
    pub fn feed_line(&mut self, line: &str, now: DateTime<Utc>) -> bool {
        let Some(event) = parse_line(line) else {
            return false;
        };
        self.progress.apply(&event);
        self.progress.last_update = Some(now);
        self.events_seen += 1;
        if event.event_type == StreamEventType::Result && event.is_error.unwrap_or(false) {
            self.result_error = true;
        }
        true
    }

    pub fn progress(&self) -> &PhaseProgress {
        &self.progress
    }

    pub fn progress_mut(&mut self) -> &mut PhaseProgress {
        &mut self.progress
    }

    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    pub fn has_started(&self) -> bool {
        self.events_seen > 0
    }

    /// Whether a `result` event reported an agent-level error.
    pub fn saw_result_error(&self) -> bool {
        self.result_error
    }
}
