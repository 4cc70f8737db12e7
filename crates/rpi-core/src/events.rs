//! Wire types for the agent's newline-delimited JSON event stream.

use serde::{Deserialize, Serialize};

/// Event type discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    System,
    Assistant,
    User,
    Result,
    Init,
    #[serde(other)]
    Unknown,
}

impl StreamEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::User => "user",
            Self::Result => "result",
            Self::Init => "init",
            Self::Unknown => "unknown",
        }
    }
}

/// One decoded stream record. All fields beyond `type` are optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    /// Free-form message payload; may be a string or a structured object.
    #[serde(default)]
    pub message: Option<serde_json::Value>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub duration_api_ms: Option<f64>,
    #[serde(default)]
    pub is_error: Option<bool>,
    #[serde(default)]
    pub num_turns: Option<u32>,
}

impl StreamEvent {
    /// True for `init` records and `system` records with subtype `init`.
    pub fn is_init(&self) -> bool {
        match self.event_type {
            StreamEventType::Init => true,
            StreamEventType::System => self.subtype.as_deref() == Some("init"),
            _ => false,
        }
    }

    /// Message rendered as text. Objects are searched for a `text` or
    /// `content` string before falling back to compact JSON.
    pub fn message_text(&self) -> Option<String> {
        let value = self.message.as_ref()?;
        match value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            serde_json::Value::Object(map) => map
                .get("text")
                .or_else(|| map.get("content"))
                .and_then(|v| v.as_str())
                .map(ToString::to_string)
                .or_else(|| Some(value.to_string())),
            other => Some(other.to_string()),
        }
    }
}
