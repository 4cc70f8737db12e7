//! Run options for phased orchestration.
//!
//! Read from the key=value file at `.agents/rpi/config`, then environment,
//! then CLI flags. The resulting value is immutable for the life of a run.

use crate::types::{Phase, RuntimeMode, TypeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Config file location relative to the repository root.
pub const CONFIG_FILE: &str = ".agents/rpi/config";

pub const ENV_RUNTIME_MODE: &str = "RPI_RUNTIME_MODE";
pub const ENV_RUNTIME_COMMAND: &str = "RPI_RUNTIME_COMMAND";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid duration value for {key}: {value}")]
    InvalidDuration { key: String, value: String },
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error("goal is required when starting from discovery")]
    MissingGoal,
    #[error("{0} must be greater than zero")]
    NonPositive(&'static str),
}

/// Options threaded through every component of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub from: Phase,
    pub max_retries: u32,
    #[serde(with = "duration_str")]
    pub phase_timeout: Duration,
    #[serde(with = "duration_str")]
    pub stall_timeout: Duration,
    #[serde(with = "duration_str")]
    pub stream_startup_timeout: Duration,
    #[serde(with = "duration_str")]
    pub stall_check_interval: Duration,
    pub no_worktree: bool,
    pub require_clean: bool,
    pub fast_path: bool,
    pub test_first: bool,
    pub swarm_first: bool,
    pub live_status: bool,
    pub auto_clean_stale: bool,
    #[serde(with = "duration_str")]
    pub auto_clean_stale_after: Duration,
    pub runtime_mode: RuntimeMode,
    pub runtime_command: String,
    pub tracker_command: String,
    #[serde(with = "duration_str")]
    pub lease_ttl: Duration,
    pub merge_dirty_retries: u32,
    #[serde(with = "duration_str")]
    pub merge_dirty_backoff: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            from: Phase::Discovery,
            max_retries: 3,
            phase_timeout: Duration::from_secs(90 * 60),
            stall_timeout: Duration::from_secs(10 * 60),
            stream_startup_timeout: Duration::from_secs(45),
            stall_check_interval: Duration::from_secs(30),
            no_worktree: false,
            require_clean: false,
            fast_path: false,
            test_first: false,
            swarm_first: true,
            live_status: true,
            auto_clean_stale: false,
            auto_clean_stale_after: Duration::from_secs(24 * 60 * 60),
            runtime_mode: RuntimeMode::Auto,
            runtime_command: "claude".to_string(),
            tracker_command: "bd".to_string(),
            lease_ttl: Duration::from_secs(120),
            merge_dirty_retries: 5,
            merge_dirty_backoff: Duration::from_secs(2),
        }
    }
}

impl RunOptions {
    /// Load options from a config file over the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        options.load_file(path)?;
        Ok(options)
    }

    /// Defaults plus `<repo_root>/.agents/rpi/config` when present.
    pub fn for_repo(repo_root: &Path) -> Result<Self, ConfigError> {
        let path = repo_root.join(CONFIG_FILE);
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            let value = Self::unquote(value.trim());
            self.apply_value(key.trim(), &value)?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "from" => self.from = Phase::parse(value)?,
            "max_retries" => {
                self.max_retries = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "phase_timeout" => self.phase_timeout = Self::parse_duration_value(key, value)?,
            "stall_timeout" => self.stall_timeout = Self::parse_duration_value(key, value)?,
            "stream_startup_timeout" => {
                self.stream_startup_timeout = Self::parse_duration_value(key, value)?;
            }
            "stall_check_interval" => {
                self.stall_check_interval = Self::parse_duration_value(key, value)?;
            }
            "no_worktree" => self.no_worktree = Self::parse_bool(key, value)?,
            "require_clean" => self.require_clean = Self::parse_bool(key, value)?,
            "fast_path" => self.fast_path = Self::parse_bool(key, value)?,
            "test_first" => self.test_first = Self::parse_bool(key, value)?,
            "swarm_first" => self.swarm_first = Self::parse_bool(key, value)?,
            "live_status" => self.live_status = Self::parse_bool(key, value)?,
            "auto_clean_stale" => self.auto_clean_stale = Self::parse_bool(key, value)?,
            "auto_clean_stale_after" => {
                self.auto_clean_stale_after = Self::parse_duration_value(key, value)?;
            }
            "runtime" | "runtime_mode" => self.runtime_mode = RuntimeMode::parse(value)?,
            "runtime_command" => self.runtime_command = value.trim().to_string(),
            "tracker_command" => self.tracker_command = value.trim().to_string(),
            "lease_ttl" => self.lease_ttl = Self::parse_duration_value(key, value)?,
            "merge_dirty_retries" => {
                self.merge_dirty_retries = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "merge_dirty_backoff" => {
                self.merge_dirty_backoff = Self::parse_duration_value(key, value)?;
            }
            _ => {
                tracing::warn!(key, "unknown config key");
            }
        }
        Ok(())
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_duration_value(key: &str, value: &str) -> Result<Duration, ConfigError> {
        parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Apply environment overrides through a lookup function.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup(ENV_RUNTIME_MODE).filter(|v| !v.trim().is_empty()) {
            self.runtime_mode = RuntimeMode::parse(&mode)?;
        }
        if let Some(cmd) = lookup(ENV_RUNTIME_COMMAND).filter(|v| !v.trim().is_empty()) {
            self.runtime_command = cmd.trim().to_string();
        }
        Ok(())
    }

    /// Check invariants that the engine relies on.
    pub fn validate(&self, goal: &str) -> Result<(), ConfigError> {
        if self.from == Phase::Discovery && goal.trim().is_empty() {
            return Err(ConfigError::MissingGoal);
        }
        if self.phase_timeout.is_zero() {
            return Err(ConfigError::NonPositive("phase_timeout"));
        }
        if self.stream_startup_timeout.is_zero() {
            return Err(ConfigError::NonPositive("stream_startup_timeout"));
        }
        Ok(())
    }

    /// Runtime command with the default applied to blank values.
    pub fn effective_runtime_command(&self) -> &str {
        let trimmed = self.runtime_command.trim();
        if trimmed.is_empty() {
            "claude"
        } else {
            trimmed
        }
    }

    pub fn effective_tracker_command(&self) -> &str {
        let trimmed = self.tracker_command.trim();
        if trimmed.is_empty() {
            "bd"
        } else {
            trimmed
        }
    }
}

/// Parse `90m`, `45s`, `2h`, `500ms`, `1h30m` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let number: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];
        let secs = match unit {
            "ms" => number / 1000.0,
            "s" => number,
            "m" => number * 60.0,
            "h" => number * 3600.0,
            _ => return None,
        };
        total = total.checked_add(Duration::try_from_secs_f64(secs).ok()?)?;
    }
    Some(total)
}

/// Render a duration compactly (`1h30m0s`, `45s`, `500ms`).
pub fn format_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms < 1000 {
        return format!("{total_ms}ms");
    }
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

mod duration_str {
    use super::{format_duration, parse_duration};
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).ok_or_else(|| de::Error::custom(format!("invalid duration: {raw}")))
    }
}
