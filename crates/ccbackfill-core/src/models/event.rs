//! Session events derived from Claude Code transcript lines

use chrono::{DateTime, Utc};
use std::fmt;

/// Discriminant of a session event, also part of its de-duplication key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    SessionStart,
    TokenUsage,
    LinesOfCode,
    ToolDecision,
    Action,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::SessionStart,
        EventKind::TokenUsage,
        EventKind::LinesOfCode,
        EventKind::ToolDecision,
        EventKind::Action,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionStart => "session_start",
            EventKind::TokenUsage => "token_usage",
            EventKind::LinesOfCode => "lines_of_code",
            EventKind::ToolDecision => "tool_decision",
            EventKind::Action => "action",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token type, rendered as the `type` label of the token counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TokenType {
    Input,
    Output,
    CacheRead,
    CacheCreation,
}

impl TokenType {
    pub fn label(&self) -> &'static str {
        match self {
            TokenType::Input => "input",
            TokenType::Output => "output",
            TokenType::CacheRead => "cacheRead",
            TokenType::CacheCreation => "cacheCreation",
        }
    }
}

/// Token counts of one assistant response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

impl TokenCounts {
    /// Sum of all four counts, saturating at `u64::MAX`
    pub fn total(&self) -> u64 {
        self.input
            .saturating_add(self.output)
            .saturating_add(self.cache_read)
            .saturating_add(self.cache_creation)
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Counts paired with their type, in label order
    pub fn by_type(&self) -> [(TokenType, u64); 4] {
        [
            (TokenType::Input, self.input),
            (TokenType::Output, self.output),
            (TokenType::CacheRead, self.cache_read),
            (TokenType::CacheCreation, self.cache_creation),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Decision {
    Accept,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Accept => "accept",
            Decision::Reject => "reject",
        }
    }
}

/// Cost-relevant action confirmed by a successful tool result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    Commit,
    PullRequest,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Commit => "commit",
            ActionKind::PullRequest => "pull_request",
        }
    }
}

/// Kind-specific payload of a `SessionEvent`
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    SessionStart,
    TokenUsage { model: String, tokens: TokenCounts },
    LinesOfCode { added: u64, removed: u64 },
    ToolDecision {
        tool: String,
        decision: Decision,
        language: String,
    },
    Action(ActionKind),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::SessionStart => EventKind::SessionStart,
            EventPayload::TokenUsage { .. } => EventKind::TokenUsage,
            EventPayload::LinesOfCode { .. } => EventKind::LinesOfCode,
            EventPayload::ToolDecision { .. } => EventKind::ToolDecision,
            EventPayload::Action(_) => EventKind::Action,
        }
    }
}

/// One parsed event, immutable once produced by the reader
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    /// Project slug taken from the log file path
    pub project: String,
    /// `uuid` of the source line, when the line carries one
    pub line_id: Option<String>,
    /// Position among the events derived from the same log line
    pub ordinal: u16,
    pub payload: EventPayload,
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            session_id: self.session_id.clone(),
            timestamp_ms: self.timestamp_ms(),
            kind: self.kind(),
            line_id: self.line_id.clone(),
            ordinal: self.ordinal,
        }
    }
}

/// Identity used to drop the same event seen through several files
///
/// Copies of a line share its `uuid`, so distinct lines landing on the same
/// millisecond stay distinct. Lines without one fall back to
/// session, timestamp, kind and ordinal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub session_id: String,
    pub timestamp_ms: i64,
    pub kind: EventKind,
    pub line_id: Option<String>,
    pub ordinal: u16,
}
