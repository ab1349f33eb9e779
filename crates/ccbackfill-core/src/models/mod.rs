//! Data models for ccbackfill

pub mod event;
pub mod series;
pub mod transcript;

pub use event::{
    ActionKind, Decision, EventKey, EventKind, EventPayload, SessionEvent, TokenCounts, TokenType,
};
pub use series::{LabelSet, Metric, MetricSeries, Sample, SeriesKey, SeriesTable};
pub use transcript::{ContentBlock, TranscriptLine, TranscriptMessage, UsageBlock};
