//! Raw Claude Code transcript lines as written to `~/.claude/projects/**/*.jsonl`
//!
//! Only the fields the backfill derives events from are modelled. Everything
//! else in a line is ignored by serde.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// One line of a session JSONL file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptLine {
    #[serde(default)]
    pub session_id: Option<String>,

    /// Per-line id, identical in every copy of the same line
    #[serde(default)]
    pub uuid: Option<String>,

    /// "user", "assistant", "summary", "file-history-snapshot", ...
    #[serde(rename = "type", default)]
    pub line_type: String,

    /// RFC 3339 timestamp, kept raw so a bad value ignores the line instead of failing it
    #[serde(default)]
    pub timestamp: Option<String>,

    #[serde(default)]
    pub message: Option<TranscriptMessage>,
}

impl TranscriptLine {
    pub fn is_assistant(&self) -> bool {
        self.line_type == "assistant"
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.timestamp.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn line_id(&self) -> Option<&str> {
        self.uuid.as_deref().filter(|id| !id.is_empty())
    }

    /// Content blocks of the message; a plain-string content has none
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match self.message.as_ref().and_then(|m| m.content.as_ref()) {
            Some(Value::Array(items)) => {
                items.iter().filter_map(ContentBlock::from_value).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Message body of a user or assistant line
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptMessage {
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub usage: Option<UsageBlock>,

    /// String or array of content blocks depending on the Claude Code version
    #[serde(default)]
    pub content: Option<Value>,
}

/// `message.usage` of an assistant response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageBlock {
    #[serde(default)]
    pub input_tokens: Option<u64>,

    #[serde(default)]
    pub output_tokens: Option<u64>,

    #[serde(default, alias = "cache_read_tokens")]
    pub cache_read_input_tokens: Option<u64>,

    #[serde(default, alias = "cache_write_tokens")]
    pub cache_creation_input_tokens: Option<u64>,
}

/// A content block relevant to event derivation
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        is_error: bool,
    },
}

impl ContentBlock {
    fn from_value(value: &Value) -> Option<Self> {
        let block_type = value.get("type")?.as_str()?;
        match block_type {
            "tool_use" => Some(ContentBlock::ToolUse {
                id: value.get("id")?.as_str()?.to_string(),
                name: value
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: value.get("input").cloned().unwrap_or(Value::Null),
            }),
            "tool_result" => Some(ContentBlock::ToolResult {
                tool_use_id: value.get("tool_use_id")?.as_str()?.to_string(),
                is_error: value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            _ => None,
        }
    }
}
