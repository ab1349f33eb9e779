//! Single-pass metric aggregation
//!
//! The aggregator owns the series table while events stream in and hands it
//! over, finalised, from `finish()`.

use crate::models::{
    ActionKind, EventKind, EventPayload, LabelSet, Metric, SeriesKey, SeriesTable, SessionEvent,
};
use crate::pricing::PricingTable;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Tokens and cost attributed to one model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelTotals {
    pub tokens: u64,
    pub cost: f64,
    pub usage_events: usize,
    /// Priced with the fallback entry
    pub fallback: bool,
}

/// Summary of one aggregation pass
#[derive(Debug, Clone, Default)]
pub struct AggregateSummary {
    pub events_by_kind: BTreeMap<EventKind, usize>,
    pub sessions: usize,
    /// Cost per project slug
    pub project_costs: BTreeMap<String, f64>,
    pub models: BTreeMap<String, ModelTotals>,
    /// Models priced with the fallback entry and their usage event counts
    pub fallback_models: BTreeMap<String, usize>,
    pub metric_totals: BTreeMap<Metric, f64>,
    pub series_count: usize,
    pub sample_count: usize,
    pub synthetic_adjustments: u64,
    pub first_event: Option<DateTime<Utc>>,
    pub last_event: Option<DateTime<Utc>>,
}

impl AggregateSummary {
    pub fn total_events(&self) -> usize {
        self.events_by_kind.values().sum()
    }

    pub fn total_cost(&self) -> f64 {
        self.models.values().map(|m| m.cost).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.models
            .values()
            .fold(0u64, |sum, m| sum.saturating_add(m.tokens))
    }

    pub fn projects(&self) -> usize {
        self.project_costs.len()
    }
}

/// Finalised output of an aggregation pass
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub series: SeriesTable,
    pub summary: AggregateSummary,
}

#[derive(Debug, Clone)]
struct SessionState {
    project: String,
    first_ms: i64,
}

/// Accumulates cumulative counters from a stream of session events
pub struct Aggregator<'p> {
    pricing: &'p PricingTable,
    table: SeriesTable,
    sessions: HashMap<String, SessionState>,
    summary: AggregateSummary,
}

impl<'p> Aggregator<'p> {
    pub fn new(pricing: &'p PricingTable) -> Self {
        Self {
            pricing,
            table: SeriesTable::new(),
            sessions: HashMap::new(),
            summary: AggregateSummary::default(),
        }
    }

    /// Consume an event stream and finish
    pub fn aggregate<I>(pricing: &'p PricingTable, events: I) -> Aggregation
    where
        I: IntoIterator<Item = SessionEvent>,
    {
        let mut aggregator = Self::new(pricing);
        for event in events {
            aggregator.observe(event);
        }
        aggregator.finish()
    }

    pub fn observe(&mut self, event: SessionEvent) {
        let ts = event.timestamp_ms();
        *self.summary.events_by_kind.entry(event.kind()).or_default() += 1;
        self.track_time_range(event.timestamp);

        let session = self
            .sessions
            .entry(event.session_id.clone())
            .or_insert_with(|| SessionState {
                project: event.project.clone(),
                first_ms: ts,
            });
        session.first_ms = session.first_ms.min(ts);
        let project = session.project.clone();
        let elapsed_ms = ts - session.first_ms;

        let base = LabelSet::new()
            .with("session_id", event.session_id.as_str())
            .with("project", project.as_str());

        match event.payload {
            EventPayload::SessionStart => {
                self.table
                    .set_once(SeriesKey::new(Metric::SessionCount, base.clone()), 1.0, ts);
            }
            EventPayload::TokenUsage { model, tokens } => {
                for (token_type, count) in tokens.by_type() {
                    if count == 0 {
                        continue;
                    }
                    let labels = base
                        .clone()
                        .with("model", model.as_str())
                        .with("type", token_type.label());
                    self.table
                        .add(SeriesKey::new(Metric::TokenUsage, labels), count as f64, ts);
                }

                let lookup = self.pricing.resolve(&model);
                let cost = lookup.entry().cost(&tokens);
                let fallback = lookup.is_fallback();
                if fallback {
                    *self.summary.fallback_models.entry(model.clone()).or_default() += 1;
                }
                self.table.add(
                    SeriesKey::new(Metric::CostUsage, base.clone().with("model", model.as_str())),
                    cost,
                    ts,
                );

                *self.summary.project_costs.entry(project).or_default() += cost;
                let totals = self.summary.models.entry(model).or_default();
                totals.tokens = totals.tokens.saturating_add(tokens.total());
                totals.cost += cost;
                totals.usage_events += 1;
                totals.fallback |= fallback;
            }
            EventPayload::LinesOfCode { added, removed } => {
                for (kind, count) in [("added", added), ("removed", removed)] {
                    self.table.add(
                        SeriesKey::new(Metric::LinesOfCode, base.clone().with("type", kind)),
                        count as f64,
                        ts,
                    );
                }
            }
            EventPayload::ToolDecision {
                tool,
                decision,
                language,
            } => {
                let labels = base
                    .clone()
                    .with("tool_name", tool)
                    .with("decision", decision.as_str())
                    .with("language", language);
                self.table
                    .add(SeriesKey::new(Metric::CodeEditToolDecision, labels), 1.0, ts);
            }
            EventPayload::Action(action) => {
                let metric = match action {
                    ActionKind::Commit => Metric::CommitCount,
                    ActionKind::PullRequest => Metric::PullRequestCount,
                };
                self.table.add(SeriesKey::new(metric, base.clone()), 1.0, ts);
            }
        }

        self.table.raise_to(
            SeriesKey::new(Metric::ActiveTime, base),
            elapsed_ms as f64 / 1000.0,
            ts,
        );
    }

    fn track_time_range(&mut self, timestamp: DateTime<Utc>) {
        let summary = &mut self.summary;
        summary.first_event = Some(summary.first_event.map_or(timestamp, |t| t.min(timestamp)));
        summary.last_event = Some(summary.last_event.map_or(timestamp, |t| t.max(timestamp)));
    }

    pub fn finish(self) -> Aggregation {
        let mut summary = self.summary;
        summary.sessions = self.sessions.len();
        summary.metric_totals = Metric::ALL
            .into_iter()
            .filter_map(|metric| {
                let mut series = self.table.metric_series(metric).peekable();
                series.peek()?;
                Some((metric, series.map(|(_, s)| s.value()).sum()))
            })
            .collect();
        summary.series_count = self.table.len();
        summary.sample_count = self.table.sample_count();
        summary.synthetic_adjustments = self.table.synthetic_adjustments();

        debug!(
            sessions = summary.sessions,
            series = summary.series_count,
            samples = summary.sample_count,
            synthetic_adjustments = summary.synthetic_adjustments,
            "Aggregation finished"
        );

        Aggregation {
            series: self.table,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Decision, TokenCounts};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_735_689_600 + secs, 0).unwrap()
    }

    fn event(session: &str, secs: i64, ordinal: u16, payload: EventPayload) -> SessionEvent {
        SessionEvent {
            timestamp: at(secs),
            session_id: session.to_string(),
            project: "-home-dev-app".to_string(),
            line_id: None,
            ordinal,
            payload,
        }
    }

    fn usage(model: &str, output: u64) -> EventPayload {
        EventPayload::TokenUsage {
            model: model.to_string(),
            tokens: TokenCounts {
                output,
                ..Default::default()
            },
        }
    }

    fn base(session: &str) -> LabelSet {
        LabelSet::new()
            .with("session_id", session)
            .with("project", "-home-dev-app")
    }

    #[test]
    fn test_cost_derivation_for_sonnet() {
        let pricing = PricingTable::embedded();
        let aggregation = Aggregator::aggregate(
            &pricing,
            vec![event("s1", 0, 0, usage("claude-sonnet-4-20250514", 1_000_000))],
        );

        let key = SeriesKey::new(
            Metric::CostUsage,
            base("s1").with("model", "claude-sonnet-4-20250514"),
        );
        assert_eq!(aggregation.series.get(&key).unwrap().value(), 15.0);
        assert!(aggregation.summary.fallback_models.is_empty());
    }

    #[test]
    fn test_fallback_model_is_priced_and_listed() {
        let pricing = PricingTable::embedded();
        let aggregation = Aggregator::aggregate(
            &pricing,
            vec![
                event("s1", 0, 0, usage("claude-5-ultra", 1_000)),
                event("s1", 1, 0, usage("claude-5-ultra", 1_000)),
            ],
        );

        assert_eq!(aggregation.summary.fallback_models.get("claude-5-ultra"), Some(&2));
        assert!(aggregation.summary.models["claude-5-ultra"].fallback);
        assert!(aggregation.summary.total_cost() > 0.0);
    }

    #[test]
    fn test_session_counter_set_once() {
        let pricing = PricingTable::embedded();
        let aggregation = Aggregator::aggregate(
            &pricing,
            vec![
                event("s1", 0, 0, EventPayload::SessionStart),
                event("s1", 50, 0, EventPayload::SessionStart),
            ],
        );

        let series = aggregation
            .series
            .get(&SeriesKey::new(Metric::SessionCount, base("s1")))
            .unwrap();
        assert_eq!(series.value(), 1.0);
        assert_eq!(series.samples().len(), 1);
        assert_eq!(aggregation.summary.sessions, 1);
    }

    #[test]
    fn test_active_time_grows_with_session_span() {
        let pricing = PricingTable::embedded();
        let aggregation = Aggregator::aggregate(
            &pricing,
            vec![
                event("s1", 0, 0, EventPayload::SessionStart),
                event("s1", 30, 0, EventPayload::Action(ActionKind::Commit)),
                event("s1", 90, 0, usage("claude-haiku-4-5", 10)),
            ],
        );

        let active = aggregation
            .series
            .get(&SeriesKey::new(Metric::ActiveTime, base("s1")))
            .unwrap();
        assert_eq!(active.value(), 90.0);
        assert_eq!(active.samples().len(), 2);
        assert_eq!(aggregation.summary.metric_totals[&Metric::CommitCount], 1.0);
    }

    #[test]
    fn test_same_timestamp_updates_are_spread() {
        let pricing = PricingTable::embedded();
        let aggregation = Aggregator::aggregate(
            &pricing,
            vec![
                event("s1", 10, 0, EventPayload::Action(ActionKind::Commit)),
                event("s1", 10, 1, EventPayload::Action(ActionKind::Commit)),
            ],
        );

        let series = aggregation
            .series
            .get(&SeriesKey::new(Metric::CommitCount, base("s1")))
            .unwrap();
        let stamps: Vec<i64> = series.samples().iter().map(|s| s.timestamp_ms).collect();
        let first = at(10).timestamp_millis();
        assert_eq!(stamps, vec![first, first + 1]);
        assert_eq!(series.value(), 2.0);
        assert_eq!(aggregation.summary.synthetic_adjustments, 1);
    }

    #[test]
    fn test_lines_and_decisions() {
        let pricing = PricingTable::embedded();
        let aggregation = Aggregator::aggregate(
            &pricing,
            vec![
                event(
                    "s1",
                    0,
                    0,
                    EventPayload::LinesOfCode {
                        added: 12,
                        removed: 0,
                    },
                ),
                event(
                    "s1",
                    1,
                    0,
                    EventPayload::ToolDecision {
                        tool: "Edit".to_string(),
                        decision: Decision::Accept,
                        language: "Rust".to_string(),
                    },
                ),
            ],
        );

        let added = SeriesKey::new(Metric::LinesOfCode, base("s1").with("type", "added"));
        let removed = SeriesKey::new(Metric::LinesOfCode, base("s1").with("type", "removed"));
        assert_eq!(aggregation.series.get(&added).unwrap().value(), 12.0);
        assert!(aggregation.series.get(&removed).is_none());

        let decision = SeriesKey::new(
            Metric::CodeEditToolDecision,
            base("s1")
                .with("tool_name", "Edit")
                .with("decision", "accept")
                .with("language", "Rust"),
        );
        assert_eq!(aggregation.series.get(&decision).unwrap().value(), 1.0);
    }

    #[test]
    fn test_project_label_fixed_at_first_observation() {
        let pricing = PricingTable::embedded();
        let mut later = event("s1", 5, 0, EventPayload::Action(ActionKind::Commit));
        later.project = "elsewhere".to_string();

        let aggregation = Aggregator::aggregate(
            &pricing,
            vec![event("s1", 0, 0, EventPayload::SessionStart), later],
        );

        assert!(aggregation
            .series
            .get(&SeriesKey::new(Metric::CommitCount, base("s1")))
            .is_some());
    }
}
