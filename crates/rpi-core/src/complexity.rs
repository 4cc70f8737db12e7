//! Goal complexity scoring.
//!
//! A fast-path run skips validation only when the goal scores `fast`.

use regex::Regex;
use serde::{Deserialize, Serialize};

const SCOPE_KEYWORDS: &[&str] = &[
    "all",
    "entire",
    "across",
    "everywhere",
    "every file",
    "every module",
    "system-wide",
    "systemwide",
    "global",
    "throughout",
    "codebase",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "refactor",
    "migrate",
    "migration",
    "rewrite",
    "redesign",
    "rearchitect",
    "overhaul",
    "restructure",
    "reorganize",
    "decouple",
    "deprecate",
    "split",
    "extract module",
    "port",
];

const FAST_MAX_LEN: usize = 30;
const FULL_MIN_LEN: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Fast,
    Standard,
    Full,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Score {
    len: usize,
    scope: usize,
    complex: usize,
}

fn contains_whole_word(text: &str, keyword: &str) -> bool {
    match Regex::new(&format!(r"(?i)\b{}\b", regex::escape(keyword))) {
        Ok(re) => re.is_match(text),
        Err(_) => text.contains(keyword),
    }
}

fn score(goal: &str) -> Score {
    let lower = goal.trim().to_lowercase();
    let count = |words: &[&str]| words.iter().filter(|kw| contains_whole_word(&lower, kw)).count();
    Score {
        len: lower.len(),
        scope: count(SCOPE_KEYWORDS),
        complex: count(COMPLEX_KEYWORDS),
    }
}

/// Classify a goal by length and keyword signals.
pub fn classify_complexity(goal: &str) -> Complexity {
    let s = score(goal);
    if s.complex > 0 || s.scope > 1 || s.len > FULL_MIN_LEN {
        return Complexity::Full;
    }
    if s.len > FAST_MAX_LEN || s.scope > 0 {
        return Complexity::Standard;
    }
    Complexity::Fast
}
