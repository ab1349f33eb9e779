//! Snapshot emission in Prometheus exposition text
//!
//! Metrics are written in declaration order, series in label order and
//! samples in time order, each group preceded by `# HELP` and
//! `# TYPE <name> counter`. Two timestamp flavours are supported:
//!
//! - `prometheus`: integer milliseconds
//! - `openmetrics`: seconds with millisecond precision and a trailing `# EOF`,
//!   as read by `promtool tsdb create-blocks-from openmetrics`
//!
//! The table is validated before anything is rendered, and the file is
//! written through a temp file in the target directory, then renamed.

use crate::error::BackfillError;
use crate::models::{Metric, SeriesTable};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::{self, Write as _};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

static METRIC_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("valid metric name regex"));
static LABEL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("valid label name regex"));

/// Timestamp flavour of an emitted snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    #[default]
    Prometheus,
    OpenMetrics,
}

impl SnapshotFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotFormat::Prometheus => "prometheus",
            SnapshotFormat::OpenMetrics => "openmetrics",
        }
    }
}

impl fmt::Display for SnapshotFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotFormat {
    type Err = BackfillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prometheus" => Ok(SnapshotFormat::Prometheus),
            "openmetrics" => Ok(SnapshotFormat::OpenMetrics),
            other => Err(BackfillError::invalid_config(format!(
                "unknown snapshot format '{}' (expected prometheus or openmetrics)",
                other
            ))),
        }
    }
}

/// Rendered snapshot text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub format: SnapshotFormat,
    pub content: String,
    pub series_count: usize,
    pub sample_count: usize,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series_count == 0
    }
}

/// Check names, values and timestamps of every series
pub fn validate(table: &SeriesTable) -> Result<(), BackfillError> {
    for (key, series) in table.iter() {
        let name = key.metric.name();
        if !METRIC_NAME_RE.is_match(name) {
            return Err(BackfillError::invalid_snapshot(format!(
                "invalid metric name '{}'",
                name
            )));
        }
        for (label, _) in key.labels.iter() {
            if !LABEL_NAME_RE.is_match(label) || label.starts_with("__") {
                return Err(BackfillError::invalid_snapshot(format!(
                    "invalid label name '{}' on {}",
                    label, name
                )));
            }
        }

        let mut previous: Option<(i64, f64)> = None;
        for sample in series.samples() {
            if !sample.value.is_finite() || sample.value < 0.0 {
                return Err(BackfillError::invalid_snapshot(format!(
                    "{} has non-finite or negative value {}",
                    name, sample.value
                )));
            }
            if sample.timestamp_ms < 0 {
                return Err(BackfillError::invalid_snapshot(format!(
                    "{} has a timestamp before the Unix epoch ({} ms)",
                    name, sample.timestamp_ms
                )));
            }
            if let Some((last_ts, last_value)) = previous {
                if sample.timestamp_ms <= last_ts {
                    return Err(BackfillError::invalid_snapshot(format!(
                        "{} timestamps not strictly increasing ({} after {})",
                        name, sample.timestamp_ms, last_ts
                    )));
                }
                if sample.value < last_value {
                    return Err(BackfillError::invalid_snapshot(format!(
                        "{} counter decreased from {} to {}",
                        name, last_value, sample.value
                    )));
                }
            }
            previous = Some((sample.timestamp_ms, sample.value));
        }
    }
    Ok(())
}

/// Validate then render the table
pub fn render(table: &SeriesTable, format: SnapshotFormat) -> Result<Snapshot, BackfillError> {
    validate(table)?;

    let mut content = String::new();
    let mut sample_count = 0;
    for metric in Metric::ALL {
        let mut series = table.metric_series(metric).peekable();
        if series.peek().is_none() {
            continue;
        }

        let name = metric.name();
        // Writing into a String cannot fail
        let _ = writeln!(content, "# HELP {} {}", name, metric.help());
        let _ = writeln!(content, "# TYPE {} counter", name);
        for (key, series) in series {
            let labels = key
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
                .collect::<Vec<_>>()
                .join(",");
            for sample in series.samples() {
                let _ = writeln!(
                    content,
                    "{}{{{}}} {} {}",
                    name,
                    labels,
                    format_value(sample.value),
                    format_timestamp(sample.timestamp_ms, format)
                );
                sample_count += 1;
            }
        }
    }
    if format == SnapshotFormat::OpenMetrics {
        content.push_str("# EOF\n");
    }

    Ok(Snapshot {
        format,
        content,
        series_count: table.len(),
        sample_count,
    })
}

/// Escape `\`, `"` and newlines in a label value
pub fn escape_label_value(value: &str) -> Cow<'_, str> {
    if !value.contains(['\\', '"', '\n']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

/// Shortest representation that parses back to the same f64
pub fn format_value(value: f64) -> String {
    if value == 0.0 {
        "0".to_string()
    } else {
        value.to_string()
    }
}

/// Sample timestamp text; `validate` guarantees it is not before the epoch
pub fn format_timestamp(timestamp_ms: i64, format: SnapshotFormat) -> String {
    match format {
        SnapshotFormat::Prometheus => timestamp_ms.to_string(),
        SnapshotFormat::OpenMetrics => format!(
            "{}.{:03}",
            timestamp_ms.div_euclid(1000),
            timestamp_ms.rem_euclid(1000)
        ),
    }
}

/// Write the snapshot atomically
///
/// The content goes to a temp file next to `path` which is then renamed over
/// it, so a partially written snapshot never exists at `path`.
pub fn write_snapshot(snapshot: &Snapshot, path: &Path) -> Result<(), BackfillError> {
    let output_error = |source: std::io::Error| BackfillError::OutputWrite {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(output_error)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".ccbackfill-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(output_error)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        writer
            .write_all(snapshot.content.as_bytes())
            .map_err(output_error)?;
        writer.flush().map_err(output_error)?;
    }
    tmp.as_file().sync_all().map_err(output_error)?;
    tmp.persist(path).map_err(|e| output_error(e.error))?;

    debug!(
        path = %path.display(),
        bytes = snapshot.len(),
        series = snapshot.series_count,
        samples = snapshot.sample_count,
        format = %snapshot.format,
        "Snapshot written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LabelSet, Sample, SeriesKey};
    use tempfile::tempdir;

    fn sample_table() -> SeriesTable {
        let mut table = SeriesTable::new();
        let labels = LabelSet::new().with("session_id", "s1").with("project", "p");
        table.add(
            SeriesKey::new(Metric::CommitCount, labels.clone()),
            1.0,
            1_700_000_000_123,
        );
        table.add(
            SeriesKey::new(Metric::CommitCount, labels.clone()),
            1.0,
            1_700_000_060_000,
        );
        table.set_once(
            SeriesKey::new(Metric::SessionCount, labels),
            1.0,
            1_700_000_000_000,
        );
        table
    }

    #[test]
    fn test_render_prometheus_flavour() {
        let snapshot = render(&sample_table(), SnapshotFormat::Prometheus).unwrap();
        let expected = "\
# HELP claude_code_session_count_total Count of CLI sessions started
# TYPE claude_code_session_count_total counter
claude_code_session_count_total{project=\"p\",session_id=\"s1\"} 1 1700000000000
# HELP claude_code_commit_count_total Number of git commits created
# TYPE claude_code_commit_count_total counter
claude_code_commit_count_total{project=\"p\",session_id=\"s1\"} 1 1700000000123
claude_code_commit_count_total{project=\"p\",session_id=\"s1\"} 2 1700000060000
";
        assert_eq!(snapshot.content, expected);
        assert_eq!(snapshot.series_count, 2);
        assert_eq!(snapshot.sample_count, 3);
    }

    #[test]
    fn test_render_openmetrics_flavour() {
        let snapshot = render(&sample_table(), SnapshotFormat::OpenMetrics).unwrap();
        let line =
            "claude_code_commit_count_total{project=\"p\",session_id=\"s1\"} 1 1700000000.123\n";
        assert!(snapshot.content.contains(line));
        assert!(snapshot.content.ends_with("# EOF\n"));
    }

    #[test]
    fn test_empty_table_renders_nothing() {
        let snapshot = render(&SeriesTable::new(), SnapshotFormat::Prometheus).unwrap();
        assert!(snapshot.content.is_empty());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_escape_label_value() {
        assert_eq!(escape_label_value("plain"), "plain");
        assert_eq!(escape_label_value(r#"a\b"c"#), r#"a\\b\"c"#);
        assert_eq!(escape_label_value("x\ny"), "x\\ny");
    }

    #[test]
    fn test_format_value_round_trips() {
        for value in [0.0, 1.0, 15.0, 0.1 + 0.2, 1e-7, 123456789.000001] {
            let text = format_value(value);
            assert_eq!(text.parse::<f64>().unwrap(), value, "{}", text);
        }
        assert_eq!(format_value(-0.0), "0");
        assert_eq!(format_value(2.5), "2.5");
    }

    #[test]
    fn test_validate_rejects_broken_series() {
        let key = SeriesKey::new(Metric::CommitCount, LabelSet::new().with("session_id", "s"));

        let mut regressing = SeriesTable::new();
        regressing.insert_raw(
            key.clone(),
            vec![
                Sample { timestamp_ms: 10, value: 1.0 },
                Sample { timestamp_ms: 10, value: 2.0 },
            ],
        );
        assert!(matches!(
            validate(&regressing),
            Err(BackfillError::InvalidSnapshot { .. })
        ));

        let mut decreasing = SeriesTable::new();
        decreasing.insert_raw(
            key.clone(),
            vec![
                Sample { timestamp_ms: 10, value: 2.0 },
                Sample { timestamp_ms: 11, value: 1.0 },
            ],
        );
        assert!(validate(&decreasing).is_err());

        let mut bad_label = SeriesTable::new();
        bad_label.insert_raw(
            SeriesKey::new(Metric::CommitCount, LabelSet::new().with("__name__", "x")),
            vec![Sample { timestamp_ms: 1, value: 1.0 }],
        );
        assert!(validate(&bad_label).is_err());

        let mut pre_epoch = SeriesTable::new();
        pre_epoch.insert_raw(
            key.clone(),
            vec![Sample { timestamp_ms: -1_999, value: 1.0 }],
        );
        assert!(matches!(
            render(&pre_epoch, SnapshotFormat::OpenMetrics),
            Err(BackfillError::InvalidSnapshot { .. })
        ));
    }

    #[test]
    fn test_write_snapshot_is_atomic_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("snapshot.prom");
        let snapshot = render(&sample_table(), SnapshotFormat::Prometheus).unwrap();

        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "stale").unwrap();
        write_snapshot(&snapshot, &path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), snapshot.content);
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("OpenMetrics".parse::<SnapshotFormat>().unwrap(), SnapshotFormat::OpenMetrics);
        assert!("influx".parse::<SnapshotFormat>().is_err());
    }
}
