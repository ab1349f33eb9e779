//! Backfill orchestration
//!
//! Drives one run through its phases:
//!
//! ```text
//! Idle -> Reading -> Aggregating -> Emitting -> DryRunComplete
//!                                            -> Committing -> Verifying -> Committed
//! any phase -> Failed
//! ```
//!
//! Dry runs never touch the store. A commit writes the snapshot first, so a
//! store rejection leaves it on disk for inspection.

use crate::aggregator::{AggregateSummary, Aggregator};
use crate::emitter::{self, Snapshot, SnapshotFormat};
use crate::error::{BackfillError, RunWarning, StoreError, WarningKind, WarningReport};
use crate::parsers::{EventReader, ReadStats, SourceSet};
use crate::pricing::PricingTable;
use crate::store::{BulkLoadReceipt, MetricsStore};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Reading,
    Aggregating,
    Emitting,
    DryRunComplete,
    Committing,
    Verifying,
    Committed,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Reading => "reading",
            RunPhase::Aggregating => "aggregating",
            RunPhase::Emitting => "emitting",
            RunPhase::DryRunComplete => "dry-run-complete",
            RunPhase::Committing => "committing",
            RunPhase::Verifying => "verifying",
            RunPhase::Committed => "committed",
            RunPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunPhase::DryRunComplete | RunPhase::Committed | RunPhase::Failed
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    DryRun,
    Commit,
}

/// Inputs of one run
#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub sources: Vec<PathBuf>,
    /// Required in commit mode; optional for dry runs
    pub output: Option<PathBuf>,
    pub mode: RunMode,
    pub format: SnapshotFormat,
    /// Drop events at or after this instant
    pub before: Option<DateTime<Utc>>,
}

impl BackfillOptions {
    pub fn dry_run(sources: Vec<PathBuf>) -> Self {
        Self {
            sources,
            output: None,
            mode: RunMode::DryRun,
            format: SnapshotFormat::default(),
            before: None,
        }
    }

    pub fn commit(sources: Vec<PathBuf>, output: PathBuf) -> Self {
        Self {
            sources,
            output: Some(output),
            mode: RunMode::Commit,
            format: SnapshotFormat::OpenMetrics,
            before: None,
        }
    }

    pub fn with_output(mut self, output: PathBuf) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_format(mut self, format: SnapshotFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_before(mut self, before: Option<DateTime<Utc>>) -> Self {
        self.before = before;
        self
    }
}

/// Result of a run that reached a successful terminal phase
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub phase: RunPhase,
    pub snapshot: Snapshot,
    /// Where the snapshot was written, if anywhere
    pub snapshot_path: Option<PathBuf>,
    pub summary: AggregateSummary,
    pub read_stats: ReadStats,
    pub warnings: WarningReport,
    pub receipt: Option<BulkLoadReceipt>,
}

/// One backfill run
pub struct Backfill {
    options: BackfillOptions,
    pricing: PricingTable,
    cancel: CancellationToken,
    phase: RunPhase,
}

impl Backfill {
    pub fn new(options: BackfillOptions, pricing: PricingTable) -> Self {
        Self {
            options,
            pricing,
            cancel: CancellationToken::new(),
            phase: RunPhase::Idle,
        }
    }

    /// Cancel the run between files with `token`
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn transition(&mut self, next: RunPhase) {
        info!(from = %self.phase, to = %next, "Backfill phase");
        self.phase = next;
    }

    fn fail(&mut self, error: BackfillError) -> BackfillError {
        warn!(phase = %self.phase, error = %error, "Backfill failed");
        self.phase = RunPhase::Failed;
        error
    }

    /// Run to a terminal phase; `store` is only used in commit mode
    pub async fn run(&mut self, store: &dyn MetricsStore) -> Result<RunOutcome, BackfillError> {
        if self.options.mode == RunMode::Commit && self.options.output.is_none() {
            return Err(self.fail(BackfillError::invalid_config(
                "commit mode needs an output path for the snapshot",
            )));
        }

        self.transition(RunPhase::Reading);
        let sources = SourceSet::discover(&self.options.sources).map_err(|e| self.fail(e))?;
        info!(files = sources.len(), roots = sources.readable_roots, "Sources discovered");
        let mut events = EventReader::new(sources)
            .with_before(self.options.before)
            .with_cancellation(self.cancel.clone())
            .events();

        self.transition(RunPhase::Aggregating);
        let mut aggregator = Aggregator::new(&self.pricing);
        for event in events.by_ref() {
            aggregator.observe(event);
        }
        if events.is_cancelled() {
            return Err(self.fail(BackfillError::Cancelled));
        }
        let aggregation = aggregator.finish();
        let read_stats = events.stats().clone();

        let mut warnings = WarningReport::new();
        warnings.extend(events.take_warnings());
        if read_stats.lines_skipped > 0 {
            warnings.add(RunWarning::skipped_lines(read_stats.lines_skipped));
        }
        let fallback_family = self.pricing.fallback_entry().family.clone();
        for (model, occurrences) in &aggregation.summary.fallback_models {
            warnings.add(RunWarning::pricing_fallback(model, *occurrences, &fallback_family));
        }
        info!(
            files = read_stats.files_read,
            lines = read_stats.lines_read,
            skipped = read_stats.lines_skipped,
            events = read_stats.events_emitted,
            duplicates = read_stats.duplicates_dropped,
            series = aggregation.summary.series_count,
            "Aggregation complete"
        );

        self.transition(RunPhase::Emitting);
        let snapshot =
            emitter::render(&aggregation.series, self.options.format).map_err(|e| self.fail(e))?;
        if let Some(path) = self.options.output.clone() {
            emitter::write_snapshot(&snapshot, &path).map_err(|e| self.fail(e))?;
            info!(path = %path.display(), bytes = snapshot.len(), "Snapshot written");
        }

        let mut outcome = RunOutcome {
            phase: self.phase,
            snapshot,
            snapshot_path: self.options.output.clone(),
            summary: aggregation.summary,
            read_stats,
            warnings,
            receipt: None,
        };

        let snapshot_path = match (self.options.mode, self.options.output.clone()) {
            (RunMode::Commit, Some(path)) => path,
            _ => {
                self.transition(RunPhase::DryRunComplete);
                outcome.phase = self.phase;
                return Ok(outcome);
            }
        };

        if outcome.snapshot.is_empty() {
            warn!("Snapshot has no series, nothing to bulk-load");
            outcome.warnings.add(
                RunWarning::new(
                    WarningKind::EmptySnapshot,
                    "store",
                    "No usage data found, store left untouched",
                )
                .with_suggestion("Check --source and --before"),
            );
            self.transition(RunPhase::Committed);
            outcome.phase = self.phase;
            return Ok(outcome);
        }

        self.transition(RunPhase::Committing);
        let rejected = |source: StoreError| BackfillError::StoreRejected {
            snapshot: snapshot_path.clone(),
            source,
        };
        let receipt = match store.bulk_load(&snapshot_path).await {
            Ok(receipt) => receipt,
            Err(e) => return Err(self.fail(rejected(e))),
        };

        self.transition(RunPhase::Verifying);
        let receipt = match store.verify(receipt).await {
            Ok(receipt) => receipt,
            Err(e) => return Err(self.fail(rejected(e))),
        };
        if let Err(e) = store.reload().await {
            warn!(
                store = store.name(),
                error = %e,
                "Reload failed, data is loaded but may not be queryable yet"
            );
            outcome.warnings.add(RunWarning::reload_failed(&e));
        }

        self.transition(RunPhase::Committed);
        outcome.phase = self.phase;
        outcome.receipt = Some(receipt);
        Ok(outcome)
    }
}
