//! Cumulative counter series keyed by (metric, label set)

use std::collections::btree_map::{self, BTreeMap};
use std::fmt;

/// Metrics produced by the backfill, in emission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    SessionCount,
    TokenUsage,
    CostUsage,
    ActiveTime,
    LinesOfCode,
    CodeEditToolDecision,
    CommitCount,
    PullRequestCount,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::SessionCount,
        Metric::TokenUsage,
        Metric::CostUsage,
        Metric::ActiveTime,
        Metric::LinesOfCode,
        Metric::CodeEditToolDecision,
        Metric::CommitCount,
        Metric::PullRequestCount,
    ];

    /// Exposition name, shared with the live collector's series
    pub fn name(&self) -> &'static str {
        match self {
            Metric::SessionCount => "claude_code_session_count_total",
            Metric::TokenUsage => "claude_code_token_usage_tokens_total",
            Metric::CostUsage => "claude_code_cost_usage_USD_total",
            Metric::ActiveTime => "claude_code_active_time_seconds_total",
            Metric::LinesOfCode => "claude_code_lines_of_code_count_total",
            Metric::CodeEditToolDecision => "claude_code_code_edit_tool_decision_total",
            Metric::CommitCount => "claude_code_commit_count_total",
            Metric::PullRequestCount => "claude_code_pull_request_count_total",
        }
    }

    pub fn help(&self) -> &'static str {
        match self {
            Metric::SessionCount => "Count of CLI sessions started",
            Metric::TokenUsage => "Number of tokens used",
            Metric::CostUsage => "Cost of the Claude Code session",
            Metric::ActiveTime => "Total active time in seconds",
            Metric::LinesOfCode => "Count of lines of code modified",
            Metric::CodeEditToolDecision => "Count of code editing tool permission decisions",
            Metric::CommitCount => "Number of git commits created",
            Metric::PullRequestCount => "Number of pull requests created",
        }
    }

    pub fn from_name(name: &str) -> Option<Metric> {
        Metric::ALL.into_iter().find(|m| m.name() == name)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Label set ordered by label name
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Series identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub metric: Metric,
    pub labels: LabelSet,
}

impl SeriesKey {
    pub fn new(metric: Metric, labels: LabelSet) -> Self {
        Self { metric, labels }
    }
}

/// One recorded (timestamp, cumulative value) point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
}

/// A cumulative counter with its full sample history
///
/// Values never decrease and recorded timestamps strictly increase: an update
/// at or before the last timestamp is recorded 1 ms after it.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSeries {
    samples: Vec<Sample>,
}

impl MetricSeries {
    fn empty() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    pub fn value(&self) -> f64 {
        self.samples.last().map(|s| s.value).unwrap_or(0.0)
    }

    pub fn last_timestamp_ms(&self) -> Option<i64> {
        self.samples.last().map(|s| s.timestamp_ms)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Record a new cumulative value, returns true when the timestamp was advanced
    fn record(&mut self, value: f64, timestamp_ms: i64) -> bool {
        let (timestamp_ms, adjusted) = match self.last_timestamp_ms() {
            Some(last) if timestamp_ms <= last => (last + 1, true),
            _ => (timestamp_ms, false),
        };
        let value = value.max(self.value());
        self.samples.push(Sample {
            timestamp_ms,
            value,
        });
        adjusted
    }
}

/// All series of a run, iterated in (metric, labels) order
#[derive(Debug, Clone, Default)]
pub struct SeriesTable {
    series: BTreeMap<SeriesKey, MetricSeries>,
    synthetic_adjustments: u64,
}

impl SeriesTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increase a counter by `delta`
    pub fn add(&mut self, key: SeriesKey, delta: f64, timestamp_ms: i64) {
        if !(delta.is_finite() && delta > 0.0) {
            return;
        }
        let series = self.series.entry(key).or_insert_with(MetricSeries::empty);
        let value = series.value() + delta;
        if series.record(value, timestamp_ms) {
            self.synthetic_adjustments += 1;
        }
    }

    /// Set a counter to `value` only on its first observation
    pub fn set_once(&mut self, key: SeriesKey, value: f64, timestamp_ms: i64) -> bool {
        match self.series.entry(key) {
            btree_map::Entry::Occupied(_) => false,
            btree_map::Entry::Vacant(slot) => {
                slot.insert(MetricSeries::empty()).record(value, timestamp_ms);
                true
            }
        }
    }

    /// Raise a counter to `value` when it exceeds the current value
    pub fn raise_to(&mut self, key: SeriesKey, value: f64, timestamp_ms: i64) -> bool {
        let current = self.series.get(&key).map(MetricSeries::value).unwrap_or(0.0);
        if !(value.is_finite() && value > current) {
            return false;
        }
        let series = self.series.entry(key).or_insert_with(MetricSeries::empty);
        if series.record(value, timestamp_ms) {
            self.synthetic_adjustments += 1;
        }
        true
    }

    pub fn get(&self, key: &SeriesKey) -> Option<&MetricSeries> {
        self.series.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SeriesKey, &MetricSeries)> {
        self.series.iter()
    }

    /// Series of one metric, in label order
    pub fn metric_series(
        &self,
        metric: Metric,
    ) -> impl Iterator<Item = (&SeriesKey, &MetricSeries)> {
        self.series.iter().filter(move |(key, _)| key.metric == metric)
    }

    /// Sum of the final values of every series of `metric`
    pub fn metric_total(&self, metric: Metric) -> f64 {
        self.metric_series(metric).map(|(_, s)| s.value()).sum()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.series.values().map(|s| s.samples.len()).sum()
    }

    /// Updates recorded 1 ms after their series' previous sample
    pub fn synthetic_adjustments(&self) -> u64 {
        self.synthetic_adjustments
    }

    /// Insert a pre-built series, used to validate foreign tables
    #[doc(hidden)]
    pub fn insert_raw(&mut self, key: SeriesKey, samples: Vec<Sample>) {
        self.series.insert(key, MetricSeries { samples });
    }
}
