//! Argument parsing helpers and the end-of-run summary
//!
//! The summary goes to stderr so stdout can carry the snapshot itself.

use ccbackfill_core::{RunOutcome, RunPhase};
use chrono::{DateTime, NaiveDate, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table};

// ============================================================================
// Argument parsing
// ============================================================================

/// Parse `--before YYYY-MM-DD` as midnight UTC
pub fn parse_before(s: &str) -> Result<DateTime<Utc>, String> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| format!("invalid date '{}' (expected YYYY-MM-DD): {}", s, e))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("invalid date '{}'", s))
}

// ============================================================================
// Summary
// ============================================================================

fn header(labels: &[&str], no_color: bool) -> Vec<Cell> {
    labels
        .iter()
        .map(|label| {
            let cell = Cell::new(label);
            if no_color {
                cell
            } else {
                cell.fg(Color::Cyan)
            }
        })
        .collect()
}

fn new_table() -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Human-readable run report: totals, per-model costs and warnings
pub fn format_summary(outcome: &RunOutcome, no_color: bool) -> String {
    let summary = &outcome.summary;
    let stats = &outcome.read_stats;
    let mut out = String::new();

    let mut totals = new_table();
    totals.set_header(header(&["Run", ""], no_color));
    let period = match (summary.first_event, summary.last_event) {
        (Some(first), Some(last)) => format!(
            "{} .. {}",
            first.format("%Y-%m-%d %H:%M"),
            last.format("%Y-%m-%d %H:%M")
        ),
        _ => "-".to_string(),
    };
    let rows = [
        ("Phase", outcome.phase.to_string()),
        (
            "Files",
            format!("{} read, {} failed", stats.files_read, stats.files_failed),
        ),
        (
            "Lines",
            format!("{} read, {} skipped", stats.lines_read, stats.lines_skipped),
        ),
        (
            "Events",
            format!(
                "{} kept, {} duplicates",
                stats.events_emitted, stats.duplicates_dropped
            ),
        ),
        ("Sessions", summary.sessions.to_string()),
        ("Projects", summary.projects().to_string()),
        ("Period", period),
        ("Tokens", format_tokens(summary.total_tokens())),
        ("Cost", format_cost(summary.total_cost())),
        (
            "Series",
            format!(
                "{} ({} samples, {} adjusted)",
                summary.series_count, summary.sample_count, summary.synthetic_adjustments
            ),
        ),
        ("Snapshot", snapshot_target(outcome)),
    ];
    for (name, value) in rows {
        totals.add_row(vec![name.to_string(), value]);
    }
    if let Some(receipt) = &outcome.receipt {
        totals.add_row(vec![
            "Blocks".to_string(),
            format!("{} new in {}", receipt.new_blocks(), receipt.tsdb_dir.display()),
        ]);
    }
    out.push_str(&totals.to_string());

    if !summary.models.is_empty() {
        let mut models = new_table();
        models.set_header(header(&["Model", "Events", "Tokens", "Cost"], no_color));
        for (model, totals) in &summary.models {
            let name = if totals.fallback {
                format!("{} (fallback price)", model)
            } else {
                model.clone()
            };
            models.add_row(vec![
                name,
                totals.usage_events.to_string(),
                format_tokens(totals.tokens),
                format_cost(totals.cost),
            ]);
        }
        out.push('\n');
        out.push_str(&models.to_string());
    }

    if !outcome.warnings.is_empty() {
        let mut warnings = new_table();
        warnings.set_header(header(&["Warning", "Source", "Message"], no_color));
        for warning in outcome.warnings.iter() {
            let message = match &warning.suggestion {
                Some(hint) => format!("{}\n{}", warning.message, hint),
                None => warning.message.clone(),
            };
            let kind = Cell::new(warning.kind.label());
            warnings.add_row(vec![
                if no_color { kind } else { kind.fg(Color::Yellow) },
                Cell::new(&warning.source),
                Cell::new(message),
            ]);
        }
        out.push('\n');
        out.push_str(&warnings.to_string());
    }

    out
}

fn snapshot_target(outcome: &RunOutcome) -> String {
    let format = outcome.snapshot.format;
    match &outcome.snapshot_path {
        Some(path) => format!("{} ({})", path.display(), format),
        None if outcome.phase == RunPhase::DryRunComplete => format!("stdout ({})", format),
        None => "-".to_string(),
    }
}

// ============================================================================
// Utilities
// ============================================================================

fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

fn format_cost(cost: f64) -> String {
    format!("${:.2}", cost)
}

// ============================================================================
// Tests
// ============================================================================
