//! Parsers for Claude Code transcripts and emitted snapshots

pub mod exposition;
pub mod line_events;
pub mod session_events;

pub use exposition::{parse_snapshot, ParsedSnapshot};
pub use line_events::LineDeriver;
pub use session_events::{
    project_slug, EventReader, ReadStats, SessionEvents, SourceFile, SourceSet,
};
