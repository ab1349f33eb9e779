//! Parser for emitted snapshots
//!
//! Reads either timestamp flavour back into `(metric, labels) -> samples`.
//! A file containing a `# EOF` line is read as OpenMetrics (timestamps in
//! seconds), otherwise timestamps are integer milliseconds.

use crate::error::BackfillError;
use crate::models::{LabelSet, Sample};
use std::collections::{BTreeMap, BTreeSet};

/// Series identity in a parsed snapshot
pub type ParsedSeriesKey = (String, LabelSet);

/// A snapshot read back from text
#[derive(Debug, Clone, Default)]
pub struct ParsedSnapshot {
    pub openmetrics: bool,
    /// Metric names declared by `# TYPE`
    pub declared: BTreeSet<String>,
    pub series: BTreeMap<ParsedSeriesKey, Vec<Sample>>,
}

impl ParsedSnapshot {
    /// Last value of a series
    pub fn final_value(&self, metric: &str, labels: &LabelSet) -> Option<f64> {
        self.series
            .get(&(metric.to_string(), labels.clone()))
            .and_then(|samples| samples.last())
            .map(|s| s.value)
    }

    /// Last value of every series
    pub fn final_values(&self) -> BTreeMap<ParsedSeriesKey, f64> {
        self.series
            .iter()
            .filter_map(|(key, samples)| samples.last().map(|s| (key.clone(), s.value)))
            .collect()
    }

    pub fn sample_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }
}

pub fn parse_snapshot(text: &str) -> Result<ParsedSnapshot, BackfillError> {
    let mut parsed = ParsedSnapshot {
        openmetrics: text.lines().any(|l| l.trim() == "# EOF"),
        ..ParsedSnapshot::default()
    };

    for (index, raw) in text.lines().enumerate() {
        let line_number = index + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line == "# EOF" {
            break;
        }
        if let Some(rest) = line.strip_prefix("# TYPE ") {
            let name = rest.split_whitespace().next().ok_or_else(|| {
                parse_error(line_number, "TYPE line without metric name")
            })?;
            parsed.declared.insert(name.to_string());
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let (name, labels, rest) = split_sample(line, line_number)?;
        if !parsed.declared.contains(name) {
            return Err(parse_error(
                line_number,
                format!("sample for '{}' before its # TYPE line", name),
            ));
        }

        let mut fields = rest.split_whitespace();
        let value_text = fields
            .next()
            .ok_or_else(|| parse_error(line_number, "missing value"))?;
        let value: f64 = value_text
            .parse()
            .map_err(|_| parse_error(line_number, format!("bad value '{}'", value_text)))?;
        let timestamp_text = fields
            .next()
            .ok_or_else(|| parse_error(line_number, "missing timestamp"))?;
        let timestamp_ms = if parsed.openmetrics {
            parse_seconds(timestamp_text)
        } else {
            timestamp_text.parse::<i64>().ok()
        }
        .ok_or_else(|| parse_error(line_number, format!("bad timestamp '{}'", timestamp_text)))?;

        parsed
            .series
            .entry((name.to_string(), labels))
            .or_default()
            .push(Sample {
                timestamp_ms,
                value,
            });
    }

    Ok(parsed)
}

fn parse_error(line_number: usize, message: impl Into<String>) -> BackfillError {
    BackfillError::SnapshotParse {
        line_number,
        message: message.into(),
    }
}

/// Split `name{labels} rest` into its parts
fn split_sample(line: &str, line_number: usize) -> Result<(&str, LabelSet, &str), BackfillError> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    if name.is_empty() {
        return Err(parse_error(line_number, "missing metric name"));
    }

    let after_name = &line[name_end..];
    if !after_name.starts_with('{') {
        return Ok((name, LabelSet::new(), after_name));
    }

    let mut labels = LabelSet::new();
    let mut chars = after_name[1..].char_indices();
    let mut label_name = String::new();
    loop {
        let Some((offset, c)) = chars.next() else {
            return Err(parse_error(line_number, "unterminated label block"));
        };
        match c {
            '}' if label_name.trim().is_empty() => {
                let rest_start = name_end + 1 + offset + 1;
                return Ok((name, labels, &line[rest_start..]));
            }
            ',' if label_name.trim().is_empty() => continue,
            '=' => {
                if chars.next().map(|(_, c)| c) != Some('"') {
                    return Err(parse_error(line_number, "label value must be quoted"));
                }
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, '"')) => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, 'n')) => value.push('\n'),
                            Some((_, '\\')) => value.push('\\'),
                            Some((_, '"')) => value.push('"'),
                            _ => return Err(parse_error(line_number, "bad escape in label value")),
                        },
                        Some((_, c)) => value.push(c),
                        None => return Err(parse_error(line_number, "unterminated label value")),
                    }
                }
                labels.insert(label_name.trim().to_string(), value);
                label_name.clear();
            }
            c => label_name.push(c),
        }
    }
}

/// `1700000000.123` (seconds) to milliseconds, without float rounding
fn parse_seconds(text: &str) -> Option<i64> {
    let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));
    let seconds: i64 = whole.parse().ok()?;
    if fraction.len() > 3 || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let millis: i64 = if fraction.is_empty() {
        0
    } else {
        format!("{:0<3}", fraction).parse().ok()?
    };
    Some(seconds * 1000 + millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prometheus_flavour() {
        let text = "\
# HELP claude_code_commit_count_total Number of git commits created
# TYPE claude_code_commit_count_total counter
claude_code_commit_count_total{project=\"p\",session_id=\"s1\"} 1 1700000000123
claude_code_commit_count_total{project=\"p\",session_id=\"s1\"} 2 1700000060000
";
        let parsed = parse_snapshot(text).unwrap();
        let labels = LabelSet::new().with("project", "p").with("session_id", "s1");

        assert!(!parsed.openmetrics);
        assert_eq!(
            parsed.final_value("claude_code_commit_count_total", &labels),
            Some(2.0)
        );
        assert_eq!(parsed.sample_count(), 2);
    }

    #[test]
    fn test_parse_openmetrics_flavour_with_escapes() {
        let text = "\
# TYPE m_total counter
m_total{a=\"x\\\"y\",b=\"line\\nbreak\",c=\"back\\\\slash\"} 0.30000000000000004 1700000000.5
# EOF
";
        let parsed = parse_snapshot(text).unwrap();
        let ((name, labels), samples) = parsed.series.iter().next().unwrap();

        assert_eq!(name, "m_total");
        assert_eq!(labels.get("a"), Some("x\"y"));
        assert_eq!(labels.get("b"), Some("line\nbreak"));
        assert_eq!(labels.get("c"), Some("back\\slash"));
        assert_eq!(samples[0].value, 0.1 + 0.2);
        assert_eq!(samples[0].timestamp_ms, 1_700_000_000_500);
    }

    #[test]
    fn test_sample_without_type_is_rejected() {
        let err = parse_snapshot("m_total{a=\"1\"} 1 1\n").unwrap_err();
        assert!(matches!(err, BackfillError::SnapshotParse { line_number: 1, .. }));
    }

    #[test]
    fn test_malformed_lines_report_line_number() {
        let text = "# TYPE m counter\nm{a=\"1\" 1 1\n";
        assert!(matches!(
            parse_snapshot(text),
            Err(BackfillError::SnapshotParse { line_number: 2, .. })
        ));

        let text = "# TYPE m counter\nm 1 abc\n";
        assert!(matches!(
            parse_snapshot(text),
            Err(BackfillError::SnapshotParse { line_number: 2, .. })
        ));
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("1700000000.123"), Some(1_700_000_000_123));
        assert_eq!(parse_seconds("1700000000.1"), Some(1_700_000_000_100));
        assert_eq!(parse_seconds("1700000000"), Some(1_700_000_000_000));
        assert_eq!(parse_seconds("1.2345"), None);
    }
}
