//! Derivation of `SessionEvent`s from transcript lines
//!
//! A `LineDeriver` lives for one file: tool uses are matched to their results
//! by `tool_use_id` within the same file, and a session start is emitted for
//! the first line of each session id the file carries.

use crate::models::{
    ActionKind, ContentBlock, Decision, EventPayload, SessionEvent, TokenCounts, TranscriptLine,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

static GIT_COMMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bgit\s+commit\b").expect("valid git commit regex"));
static GH_PR_CREATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bgh\s+pr\s+create\b").expect("valid gh pr regex"));

/// Tools whose permission decisions feed the code-edit decision counter
const CODE_EDIT_TOOLS: [&str; 4] = ["Edit", "MultiEdit", "Write", "NotebookEdit"];

/// Model label used when an assistant line has usage but no model
pub const UNKNOWN_MODEL: &str = "unknown";

/// A tool use waiting for its result
#[derive(Debug, Clone)]
struct PendingTool {
    name: String,
    language: String,
    code_edit: bool,
    action: Option<ActionKind>,
}

impl PendingTool {
    fn from_tool_use(name: &str, input: &Value) -> Self {
        let action = if name == "Bash" {
            input
                .get("command")
                .and_then(Value::as_str)
                .and_then(detect_action)
        } else {
            None
        };

        Self {
            name: name.to_string(),
            language: language_of(input).to_string(),
            code_edit: CODE_EDIT_TOOLS.contains(&name),
            action,
        }
    }
}

/// Per-file event derivation state
#[derive(Debug, Default)]
pub struct LineDeriver {
    sessions_started: HashSet<String>,
    pending: HashMap<String, PendingTool>,
    last_session: Option<String>,
}

impl LineDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events of one line, or `None` when the line has no usable session id or timestamp
    ///
    /// Lines without a `sessionId` inherit the last one seen in the file.
    /// Timestamps before the Unix epoch count as unusable.
    pub fn derive(&mut self, line: &TranscriptLine, project: &str) -> Option<Vec<SessionEvent>> {
        let timestamp = line
            .parsed_timestamp()
            .filter(|ts| ts.timestamp_millis() >= 0)?;
        let session_id = match line.session_id() {
            Some(id) => {
                self.last_session = Some(id.to_string());
                id.to_string()
            }
            None => self.last_session.clone()?,
        };

        let line_id = line.line_id().map(str::to_string);
        let mut payloads = Vec::new();
        if self.sessions_started.insert(session_id.clone()) {
            payloads.push(EventPayload::SessionStart);
        }

        let blocks = line.blocks();

        if line.is_assistant() {
            if let Some(payload) = token_usage(line) {
                payloads.push(payload);
            }

            let (mut added, mut removed) = (0u64, 0u64);
            for block in &blocks {
                if let ContentBlock::ToolUse { id, name, input } = block {
                    let (a, r) = line_delta(name, input);
                    added = added.saturating_add(a);
                    removed = removed.saturating_add(r);
                    self.pending
                        .insert(id.clone(), PendingTool::from_tool_use(name, input));
                }
            }
            if added > 0 || removed > 0 {
                payloads.push(EventPayload::LinesOfCode { added, removed });
            }
        }

        for block in &blocks {
            let ContentBlock::ToolResult {
                tool_use_id,
                is_error,
            } = block
            else {
                continue;
            };
            let Some(tool) = self.pending.remove(tool_use_id) else {
                continue;
            };
            if tool.code_edit {
                payloads.push(EventPayload::ToolDecision {
                    tool: tool.name.clone(),
                    decision: if *is_error {
                        Decision::Reject
                    } else {
                        Decision::Accept
                    },
                    language: tool.language.clone(),
                });
            }
            if let (false, Some(action)) = (*is_error, tool.action) {
                payloads.push(EventPayload::Action(action));
            }
        }

        Some(
            payloads
                .into_iter()
                .enumerate()
                .map(|(ordinal, payload)| SessionEvent {
                    timestamp,
                    session_id: session_id.clone(),
                    project: project.to_string(),
                    line_id: line_id.clone(),
                    ordinal: u16::try_from(ordinal).unwrap_or(u16::MAX),
                    payload,
                })
                .collect(),
        )
    }
}

fn token_usage(line: &TranscriptLine) -> Option<EventPayload> {
    let message = line.message.as_ref()?;
    let usage = message.usage.as_ref()?;
    let tokens = TokenCounts {
        input: usage.input_tokens.unwrap_or(0),
        output: usage.output_tokens.unwrap_or(0),
        cache_read: usage.cache_read_input_tokens.unwrap_or(0),
        cache_creation: usage.cache_creation_input_tokens.unwrap_or(0),
    };
    if tokens.is_empty() {
        return None;
    }

    let model = message
        .model
        .as_deref()
        .filter(|m| !m.is_empty())
        .unwrap_or(UNKNOWN_MODEL)
        .to_string();
    Some(EventPayload::TokenUsage { model, tokens })
}

/// Number of lines in a tool string, zero when empty
fn count_lines(text: &str) -> u64 {
    if text.is_empty() {
        0
    } else {
        text.matches('\n').count() as u64 + 1
    }
}

fn str_field<'a>(input: &'a Value, field: &str) -> &'a str {
    input.get(field).and_then(Value::as_str).unwrap_or_default()
}

/// (added, removed) lines of a code-edit tool use
fn line_delta(tool: &str, input: &Value) -> (u64, u64) {
    match tool {
        "Edit" => (
            count_lines(str_field(input, "new_string")),
            count_lines(str_field(input, "old_string")),
        ),
        "MultiEdit" => input
            .get("edits")
            .and_then(Value::as_array)
            .map(|edits| {
                edits.iter().fold((0, 0), |(a, r), edit| {
                    (
                        a + count_lines(str_field(edit, "new_string")),
                        r + count_lines(str_field(edit, "old_string")),
                    )
                })
            })
            .unwrap_or((0, 0)),
        "Write" => (count_lines(str_field(input, "content")), 0),
        "NotebookEdit" => (count_lines(str_field(input, "new_source")), 0),
        _ => (0, 0),
    }
}

fn detect_action(command: &str) -> Option<ActionKind> {
    if GIT_COMMIT_RE.is_match(command) {
        Some(ActionKind::Commit)
    } else if GH_PR_CREATE_RE.is_match(command) {
        Some(ActionKind::PullRequest)
    } else {
        None
    }
}

/// Language label inferred from the edited file's extension
fn language_of(input: &Value) -> &'static str {
    let path = input
        .get("file_path")
        .or_else(|| input.get("notebook_path"))
        .and_then(Value::as_str);
    let Some(path) = path else {
        return "unknown";
    };
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match extension.as_deref() {
        Some("rs") => "Rust",
        Some("py") => "Python",
        Some("ts" | "tsx") => "TypeScript",
        Some("js" | "jsx" | "mjs" | "cjs") => "JavaScript",
        Some("go") => "Go",
        Some("java") => "Java",
        Some("kt" | "kts") => "Kotlin",
        Some("swift") => "Swift",
        Some("rb") => "Ruby",
        Some("php") => "PHP",
        Some("c" | "h") => "C",
        Some("cc" | "cpp" | "cxx" | "hpp") => "C++",
        Some("cs") => "C#",
        Some("sh" | "bash" | "zsh") => "Shell",
        Some("md") => "Markdown",
        Some("json") => "JSON",
        Some("yaml" | "yml") => "YAML",
        Some("toml") => "TOML",
        Some("html") => "HTML",
        Some("css" | "scss") => "CSS",
        Some("sql") => "SQL",
        Some("ipynb") => "Jupyter",
        _ => "unknown",
    }
}
