//! Error types for ccbackfill-core
//!
//! Fatal conditions are `BackfillError` variants built with thiserror. Per-line and
//! per-model issues never abort a run: they are collected as `RunWarning`s in a
//! `WarningReport` and surfaced once in the run summary.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fatal error for a backfill run
#[derive(Error, Debug)]
pub enum BackfillError {
    // ===================
    // IO Errors
    // ===================
    #[error("No readable source path among {paths:?}")]
    NoReadableSource { paths: Vec<PathBuf> },

    #[error("Failed to write snapshot: {path}")]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ===================
    // Config Errors
    // ===================
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Failed to read config file: {path}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ConfigParse {
        path: PathBuf,
        message: String,
        #[source]
        source: toml::de::Error,
    },

    // ===================
    // Snapshot Errors
    // ===================
    #[error("Invalid snapshot: {message}")]
    InvalidSnapshot { message: String },

    #[error("Malformed snapshot line {line_number}: {message}")]
    SnapshotParse { line_number: usize, message: String },

    // ===================
    // Store Errors
    // ===================
    #[error("Store rejected bulk load of {snapshot} (snapshot kept for inspection)")]
    StoreRejected {
        snapshot: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error("Backfill cancelled before emission, no snapshot written")]
    Cancelled,
}

impl BackfillError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn invalid_snapshot(message: impl Into<String>) -> Self {
        Self::InvalidSnapshot {
            message: message.into(),
        }
    }
}

/// Error raised by a `MetricsStore` implementation
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Bulk-load command template is empty")]
    EmptyCommand,

    #[error("Failed to spawn bulk-load command `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Bulk-load command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("Failed to inspect TSDB directory: {path}")]
    TsdbInspect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Bulk load produced no new blocks in {tsdb_dir}")]
    NoBlocksCreated { tsdb_dir: PathBuf },

    #[error("Reload request to {url} failed")]
    Reload {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Reload endpoint {url} returned HTTP {status}")]
    ReloadStatus { url: String, status: u16 },

    #[error("Reload request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
}

/// Category of a non-fatal issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WarningKind {
    /// Malformed log lines were skipped
    ParseWarning,
    /// A model was priced with the fallback entry
    PricingFallback,
    /// A source root or file could not be read
    SourceUnreadable,
    /// Data was loaded but the store did not reload
    ReloadFailed,
    /// Nothing to hand to the store
    EmptySnapshot,
}

impl WarningKind {
    pub fn label(&self) -> &'static str {
        match self {
            WarningKind::ParseWarning => "parse",
            WarningKind::PricingFallback => "pricing-fallback",
            WarningKind::SourceUnreadable => "source-unreadable",
            WarningKind::ReloadFailed => "reload-failed",
            WarningKind::EmptySnapshot => "empty-snapshot",
        }
    }
}

/// Individual warning entry in a run report
#[derive(Debug, Clone)]
pub struct RunWarning {
    pub kind: WarningKind,
    pub source: String,
    pub message: String,
    /// Actionable suggestion for user (optional)
    pub suggestion: Option<String>,
}

impl RunWarning {
    pub fn new(kind: WarningKind, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add an actionable suggestion to this warning
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn unreadable(path: &std::path::Path, error: &std::io::Error) -> Self {
        Self::new(
            WarningKind::SourceUnreadable,
            path.display().to_string(),
            format!("Cannot read: {}", error),
        )
        .with_suggestion(format!("Check permissions: ls -l {}", path.display()))
    }

    pub fn skipped_lines(count: usize) -> Self {
        Self::new(
            WarningKind::ParseWarning,
            "reader",
            format!("Skipped {} malformed line(s)", count),
        )
        .with_suggestion("Re-run with RUST_LOG=ccbackfill_core=trace to see each line")
    }

    pub fn pricing_fallback(model: &str, occurrences: usize, fallback_family: &str) -> Self {
        Self::new(
            WarningKind::PricingFallback,
            format!("model:{}", model),
            format!(
                "No pricing entry matched, priced as '{}' ({} usage event(s))",
                fallback_family, occurrences
            ),
        )
        .with_suggestion("Add a [[pricing]] entry for this model in the config file")
    }

    pub fn reload_failed(error: &StoreError) -> Self {
        Self::new(
            WarningKind::ReloadFailed,
            "store",
            format!("Blocks loaded but not yet queryable: {}", error),
        )
        .with_suggestion("Restart Prometheus or POST to /-/reload manually")
    }
}

/// Warnings collected during a run
///
/// Enables graceful degradation by tracking recoverable issues
/// instead of failing on the first one.
#[derive(Debug, Default, Clone)]
pub struct WarningReport {
    pub warnings: Vec<RunWarning>,
}

impl WarningReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, warning: RunWarning) {
        self.warnings.push(warning);
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    pub fn of_kind(&self, kind: WarningKind) -> impl Iterator<Item = &RunWarning> {
        self.warnings.iter().filter(move |w| w.kind == kind)
    }

    pub fn count(&self, kind: WarningKind) -> usize {
        self.of_kind(kind).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunWarning> {
        self.warnings.iter()
    }

    /// Merge another report into this one
    pub fn merge(&mut self, other: WarningReport) {
        self.warnings.extend(other.warnings);
    }
}

impl Extend<RunWarning> for WarningReport {
    fn extend<T: IntoIterator<Item = RunWarning>>(&mut self, iter: T) {
        self.warnings.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_report_counting() {
        let mut report = WarningReport::new();
        report.add(RunWarning::skipped_lines(3));
        report.add(RunWarning::pricing_fallback("claude-5-ultra", 2, "sonnet"));
        report.add(RunWarning::pricing_fallback("mystery", 1, "sonnet"));

        assert_eq!(report.len(), 3);
        assert_eq!(report.count(WarningKind::ParseWarning), 1);
        assert_eq!(report.count(WarningKind::PricingFallback), 2);
        assert_eq!(report.count(WarningKind::ReloadFailed), 0);
    }

    #[test]
    fn test_warning_report_merge() {
        let mut first = WarningReport::new();
        first.add(RunWarning::skipped_lines(1));

        let mut second = WarningReport::new();
        second.add(RunWarning::reload_failed(&StoreError::ReloadStatus {
            url: "http://localhost:9090/-/reload".to_string(),
            status: 503,
        }));

        first.merge(second);
        assert_eq!(first.len(), 2);
        assert!(first.of_kind(WarningKind::ReloadFailed).next().is_some());
    }

    #[test]
    fn test_fallback_warning_names_model() {
        let warning = RunWarning::pricing_fallback("claude-5-ultra", 4, "sonnet");
        assert_eq!(warning.source, "model:claude-5-ultra");
        assert!(warning.message.contains("sonnet"));
        assert!(warning.suggestion.is_some());
    }

    #[test]
    fn test_store_rejected_keeps_source() {
        let err = BackfillError::StoreRejected {
            snapshot: PathBuf::from("/tmp/snap.prom"),
            source: StoreError::NoBlocksCreated {
                tsdb_dir: PathBuf::from("/prometheus"),
            },
        };
        assert!(err.to_string().contains("/tmp/snap.prom"));
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("/prometheus"));
    }
}
