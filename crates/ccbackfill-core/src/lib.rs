//! ccbackfill-core - Core library for ccbackfill
//!
//! Reads Claude Code JSONL session logs, derives cumulative usage and cost
//! counters, and emits a Prometheus snapshot for bulk-loading into the TSDB.

pub mod aggregator;
pub mod backfill;
pub mod config;
pub mod emitter;
pub mod error;
pub mod models;
pub mod parsers;
pub mod pricing;
pub mod store;

pub use aggregator::{AggregateSummary, Aggregation, Aggregator, ModelTotals};
pub use backfill::{Backfill, BackfillOptions, RunMode, RunOutcome, RunPhase};
pub use config::BackfillConfig;
pub use emitter::{Snapshot, SnapshotFormat};
pub use error::{BackfillError, RunWarning, StoreError, WarningKind, WarningReport};
pub use parsers::{parse_snapshot, EventReader, ParsedSnapshot, ReadStats};
pub use pricing::{PriceLookup, PricingEntry, PricingTable};
pub use store::{BulkLoadReceipt, MetricsStore, PrometheusStore, StoreConfig};
