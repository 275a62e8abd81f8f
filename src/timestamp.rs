//! Timestamp format detection and column parsing.
//!
//! Survey exports disagree on how they spell time. Detection walks an ordered
//! list of [`FormatDescriptor`]s and picks the first whose regex matches at
//! least 80% of a small sample (first match, not best match). Parsing then
//! tries the descriptor's patterns in order, accepting the first under which
//! more than half of the non-empty values parse, falls through to a
//! best-effort parse, and finally leaves anything unparsable as `None`.
//! A column counts as critically unparsable only when every non-empty value
//! in the whole file failed; chunked callers accumulate a [`ParseTally`].
//!
//! All parsed values are naive UTC: offsets present in the text are applied,
//! values without an offset are taken as UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    attempt::{first_accepted, ratio},
    config::TimestampConfig,
    error::{SurveyError, ValidationKind},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    #[default]
    Strptime,
    UnixSeconds,
    UnixMilliseconds,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatDescriptor {
    pub name: String,
    pub regex: String,
    /// chrono `strftime` patterns, tried in order. Ignored for epoch kinds.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub kind: FormatKind,
}

impl FormatDescriptor {
    fn strptime(name: &str, regex: &str, patterns: &[&str]) -> Self {
        FormatDescriptor {
            name: name.to_string(),
            regex: regex.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            kind: FormatKind::Strptime,
        }
    }

    fn epoch(name: &str, regex: &str, kind: FormatKind) -> Self {
        FormatDescriptor {
            name: name.to_string(),
            regex: regex.to_string(),
            patterns: Vec::new(),
            kind,
        }
    }

    fn parse_attempts(&self) -> Vec<ParseAttempt<'_>> {
        match self.kind {
            FormatKind::Strptime => self
                .patterns
                .iter()
                .map(|p| ParseAttempt::Pattern(p.as_str()))
                .collect(),
            kind => vec![ParseAttempt::Epoch(kind)],
        }
    }
}

/// Most specific first: zoned ISO-8601 before bare ISO, date-times before
/// dates, day-first before month-first.
pub fn default_formats() -> Vec<FormatDescriptor> {
    vec![
        FormatDescriptor::strptime(
            "iso8601_offset",
            r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?[+-]\d{2}:?\d{2}$",
            &["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%z"],
        ),
        FormatDescriptor::strptime(
            "iso8601_utc",
            r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z$",
            &["%Y-%m-%dT%H:%M:%S%.fZ"],
        ),
        FormatDescriptor::strptime(
            "iso8601",
            r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}(:\d{2}(\.\d+)?)?$",
            &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"],
        ),
        FormatDescriptor::strptime(
            "ymd_hms",
            r"^\d{4}-\d{2}-\d{2} \d{1,2}:\d{2}:\d{2}(\.\d+)?$",
            &["%Y-%m-%d %H:%M:%S%.f"],
        ),
        FormatDescriptor::strptime(
            "ymd_hm",
            r"^\d{4}-\d{2}-\d{2} \d{1,2}:\d{2}$",
            &["%Y-%m-%d %H:%M"],
        ),
        FormatDescriptor::strptime(
            "ymd_slash",
            r"^\d{4}/\d{1,2}/\d{1,2} \d{1,2}:\d{2}(:\d{2}(\.\d+)?)?$",
            &["%Y/%m/%d %H:%M:%S%.f", "%Y/%m/%d %H:%M"],
        ),
        FormatDescriptor::strptime(
            "dmy_ampm",
            r"^\d{1,2}/\d{1,2}/\d{4} \d{1,2}:\d{2}(:\d{2})? ?[AaPp][Mm]$",
            &[
                "%d/%m/%Y %I:%M:%S %p",
                "%d/%m/%Y %I:%M %p",
                "%d/%m/%Y %I:%M:%S%p",
                "%d/%m/%Y %I:%M%p",
                "%m/%d/%Y %I:%M:%S %p",
                "%m/%d/%Y %I:%M %p",
            ],
        ),
        FormatDescriptor::strptime(
            "dmy_hms",
            r"^\d{1,2}/\d{1,2}/\d{4} \d{1,2}:\d{2}(:\d{2}(\.\d+)?)?$",
            &[
                "%d/%m/%Y %H:%M:%S%.f",
                "%d/%m/%Y %H:%M",
                "%m/%d/%Y %H:%M:%S%.f",
                "%m/%d/%Y %H:%M",
            ],
        ),
        FormatDescriptor::strptime(
            "dmy_dash",
            r"^\d{1,2}-\d{1,2}-\d{4} \d{1,2}:\d{2}(:\d{2})?$",
            &["%d-%m-%Y %H:%M:%S", "%d-%m-%Y %H:%M"],
        ),
        FormatDescriptor::epoch("unix_milliseconds", r"^\d{13}$", FormatKind::UnixMilliseconds),
        FormatDescriptor::epoch("unix_seconds", r"^\d{9,10}(\.\d+)?$", FormatKind::UnixSeconds),
        FormatDescriptor::strptime("ymd", r"^\d{4}-\d{2}-\d{2}$", &["%Y-%m-%d"]),
        FormatDescriptor::strptime(
            "dmy",
            r"^\d{1,2}/\d{1,2}/\d{4}$",
            &["%d/%m/%Y", "%m/%d/%Y"],
        ),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseAttempt<'a> {
    Pattern(&'a str),
    Epoch(FormatKind),
}

impl ParseAttempt<'_> {
    fn parse(self, value: &str) -> Option<NaiveDateTime> {
        match self {
            ParseAttempt::Pattern(pattern) => parse_with_pattern(value, pattern),
            ParseAttempt::Epoch(FormatKind::UnixSeconds) => parse_unix_seconds(value),
            ParseAttempt::Epoch(FormatKind::UnixMilliseconds) => parse_unix_millis(value),
            ParseAttempt::Epoch(FormatKind::Strptime) => None,
        }
    }

    fn label(self) -> String {
        match self {
            ParseAttempt::Pattern(pattern) => pattern.to_string(),
            ParseAttempt::Epoch(FormatKind::UnixSeconds) => "unix_seconds".to_string(),
            ParseAttempt::Epoch(_) => "unix_milliseconds".to_string(),
        }
    }
}

/// How a column ended up being parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStrategy {
    /// An accepted descriptor pattern (or epoch pseudo-format).
    Accepted(String),
    /// No pattern cleared the acceptance threshold.
    BestEffort,
    /// The column had no non-empty values.
    Empty,
}

#[derive(Debug, Clone)]
pub struct ParsedColumn {
    pub values: Vec<Option<NaiveDateTime>>,
    pub non_empty: usize,
    pub failed: usize,
    pub strategy: ParseStrategy,
}

impl ParsedColumn {
    pub fn epoch_millis(&self) -> Vec<Option<i64>> {
        self.values.iter().map(|v| v.as_ref().map(to_epoch_millis)).collect()
    }
}

/// Parse totals for one column, accumulated over every chunk of a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseTally {
    pub non_empty: usize,
    pub failed: usize,
}

impl ParseTally {
    pub fn record(&mut self, parsed: &ParsedColumn) {
        self.non_empty += parsed.non_empty;
        self.failed += parsed.failed;
    }

    pub fn all_failed(&self) -> bool {
        self.non_empty > 0 && self.failed == self.non_empty
    }

    /// Fails with [`SurveyError::CriticalParse`] when no non-empty value of
    /// `column` parsed.
    pub fn check(&self, column: &str) -> Result<(), SurveyError> {
        if self.all_failed() {
            return Err(SurveyError::CriticalParse {
                column: column.to_string(),
                failed: self.failed,
            });
        }
        Ok(())
    }
}

struct CompiledFormat {
    descriptor: FormatDescriptor,
    regex: Regex,
}

pub struct TimestampNormalizer {
    formats: Vec<CompiledFormat>,
    sample_size: usize,
    detection_threshold: f64,
    acceptance_threshold: f64,
}

impl TimestampNormalizer {
    pub fn new(config: &TimestampConfig) -> Result<Self, SurveyError> {
        let formats = config
            .formats
            .iter()
            .map(|descriptor| {
                Regex::new(&descriptor.regex)
                    .map(|regex| CompiledFormat {
                        descriptor: descriptor.clone(),
                        regex,
                    })
                    .map_err(|err| {
                        SurveyError::validation(
                            ValidationKind::InvalidConfig,
                            format!("timestamp format '{}': {err}", descriptor.name),
                        )
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TimestampNormalizer {
            formats,
            sample_size: config.sample_size,
            detection_threshold: config.detection_threshold,
            acceptance_threshold: config.acceptance_threshold,
        })
    }

    /// The leading non-empty, trimmed values used for detection.
    pub fn sample<'v, S: AsRef<str> + 'v>(&self, values: &'v [S]) -> Vec<&'v str> {
        values
            .iter()
            .map(|v| v.as_ref().trim())
            .filter(|v| !v.is_empty())
            .take(self.sample_size)
            .collect()
    }

    /// First descriptor whose regex matches at least the detection threshold
    /// of `samples`.
    pub fn detect_format<S: AsRef<str>>(&self, samples: &[S]) -> Option<&FormatDescriptor> {
        let samples: Vec<&str> = samples
            .iter()
            .map(|s| s.as_ref().trim())
            .filter(|s| !s.is_empty())
            .collect();
        if samples.is_empty() {
            return None;
        }
        let accepted = first_accepted(
            self.formats.iter(),
            |format| {
                let hits = samples.iter().filter(|s| format.regex.is_match(s)).count();
                ratio(hits, samples.len())
            },
            |score| *score >= self.detection_threshold,
        )?;
        debug!(
            "Detected timestamp format '{}' ({:.0}% of {} sample(s))",
            accepted.strategy.descriptor.name,
            accepted.output * 100.0,
            samples.len()
        );
        Some(&accepted.strategy.descriptor)
    }

    pub fn parse_column<S: AsRef<str>>(
        &self,
        values: &[S],
        descriptor: Option<&FormatDescriptor>,
    ) -> ParsedColumn {
        let trimmed: Vec<&str> = values.iter().map(|v| v.as_ref().trim()).collect();
        let non_empty = trimmed.iter().filter(|v| !v.is_empty()).count();
        if non_empty == 0 {
            return ParsedColumn {
                values: vec![None; trimmed.len()],
                non_empty: 0,
                failed: 0,
                strategy: ParseStrategy::Empty,
            };
        }

        let attempts = descriptor.map(|d| d.parse_attempts()).unwrap_or_default();
        let accepted = first_accepted(
            attempts,
            |attempt| parse_all(&trimmed, |v| attempt.parse(v)),
            |parsed| ratio(count_parsed(parsed), non_empty) > self.acceptance_threshold,
        );

        let (parsed, strategy) = match accepted {
            Some(accepted) => (accepted.output, ParseStrategy::Accepted(accepted.strategy.label())),
            None => {
                if let Some(descriptor) = descriptor {
                    debug!(
                        "No pattern of '{}' parsed most values; using best-effort parsing",
                        descriptor.name
                    );
                }
                (
                    parse_all(&trimmed, |v| self.best_effort(v)),
                    ParseStrategy::BestEffort,
                )
            }
        };

        let failed = non_empty - count_parsed(&parsed);
        if failed > 0 {
            warn!("{failed} of {non_empty} timestamp value(s) could not be parsed and were left empty");
        }
        ParsedColumn {
            values: parsed,
            non_empty,
            failed,
            strategy,
        }
    }

    /// Per-value fallback: RFC 3339, every configured pattern, then epoch
    /// numbers by digit count.
    pub fn best_effort(&self, value: &str) -> Option<NaiveDateTime> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
            return Some(parsed.naive_utc());
        }
        for format in &self.formats {
            if format.descriptor.kind != FormatKind::Strptime {
                continue;
            }
            for pattern in &format.descriptor.patterns {
                if let Some(parsed) = parse_with_pattern(value, pattern) {
                    return Some(parsed);
                }
            }
        }
        if value.bytes().all(|b| b.is_ascii_digit()) {
            return match value.len() {
                13 => parse_unix_millis(value),
                9 | 10 => parse_unix_seconds(value),
                _ => None,
            };
        }
        None
    }
}

fn parse_all<F>(values: &[&str], parse: F) -> Vec<Option<NaiveDateTime>>
where
    F: Fn(&str) -> Option<NaiveDateTime>,
{
    values
        .iter()
        .map(|v| if v.is_empty() { None } else { parse(v) })
        .collect()
}

fn count_parsed(values: &[Option<NaiveDateTime>]) -> usize {
    values.iter().filter(|v| v.is_some()).count()
}

fn has_offset(pattern: &str) -> bool {
    pattern.contains("%z") || pattern.contains("%:z") || pattern.contains("%#z")
}

pub fn parse_with_pattern(value: &str, pattern: &str) -> Option<NaiveDateTime> {
    if has_offset(pattern) {
        return DateTime::parse_from_str(value, pattern)
            .ok()
            .map(|parsed| parsed.naive_utc());
    }
    NaiveDateTime::parse_from_str(value, pattern)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, pattern)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

fn parse_unix_seconds(value: &str) -> Option<NaiveDateTime> {
    let seconds: f64 = value.parse().ok()?;
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos).map(|dt| dt.naive_utc())
}

fn parse_unix_millis(value: &str) -> Option<NaiveDateTime> {
    let millis: i64 = value.parse().ok()?;
    DateTime::from_timestamp_millis(millis).map(|dt| dt.naive_utc())
}

/// Formats a naive UTC value; offset specifiers render as UTC (`+00:00`).
pub fn format_with_pattern(value: &NaiveDateTime, pattern: &str) -> String {
    if has_offset(pattern) {
        value.and_utc().format(pattern).to_string()
    } else {
        value.format(pattern).to_string()
    }
}

pub fn to_epoch_millis(value: &NaiveDateTime) -> i64 {
    value.and_utc().timestamp_millis()
}

/// True when any sample carries the ISO `T` date/time separator.
pub fn is_iso_format<S: AsRef<str>>(samples: &[S]) -> bool {
    samples.iter().any(|s| s.as_ref().contains('T'))
}

/// Drops the last whitespace-separated word ("Main Road North" → "Main Road").
/// Single-word values are returned unchanged.
pub fn strip_trailing_word(value: &str) -> &str {
    let trimmed = value.trim_end();
    match trimmed.rsplit_once(char::is_whitespace) {
        Some((head, _)) if !head.trim().is_empty() => head.trim_end(),
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn normalizer() -> TimestampNormalizer {
        TimestampNormalizer::new(&TimestampConfig::default()).expect("default formats compile")
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn detects_zoned_iso_before_bare_iso() {
        let n = normalizer();
        let samples = ["2024-03-01T10:00:00+13:00", "2024-03-01T10:00:05+13:00"];
        assert_eq!(n.detect_format(&samples).unwrap().name, "iso8601_offset");
        let bare = ["2024-03-01T10:00:00", "2024-03-01T10:00:05"];
        assert_eq!(n.detect_format(&bare).unwrap().name, "iso8601");
    }

    #[test]
    fn detection_requires_eighty_percent() {
        let n = normalizer();
        let mostly = ["2024-03-01", "2024-03-02", "2024-03-03", "2024-03-04", "garbage"];
        assert_eq!(n.detect_format(&mostly).unwrap().name, "ymd");
        let split = ["2024-03-01", "2024-03-02", "x", "y"];
        assert!(n.detect_format(&split).is_none());
    }

    #[test]
    fn offset_values_are_normalised_to_utc() {
        let n = normalizer();
        let values = ["2024-03-01T10:00:00+13:00"];
        let descriptor = n.detect_format(&values).cloned();
        let parsed = n.parse_column(&values, descriptor.as_ref());
        assert_eq!(parsed.values[0], Some(at(2024, 2, 29, 21, 0, 0)));
    }

    #[test]
    fn day_first_pattern_wins_when_ambiguous() {
        let n = normalizer();
        let values = ["05/06/2024 14:30:00", "13/06/2024 09:00:00"];
        let descriptor = n.detect_format(&values).cloned();
        let parsed = n.parse_column(&values, descriptor.as_ref());
        assert_eq!(parsed.values[0], Some(at(2024, 6, 5, 14, 30, 0)));
        assert_eq!(parsed.failed, 0);
    }

    #[test]
    fn epoch_formats_bypass_patterns() {
        let n = normalizer();
        let millis = ["1700000000000", "1700000000500"];
        let descriptor = n.detect_format(&millis).cloned().unwrap();
        assert_eq!(descriptor.kind, FormatKind::UnixMilliseconds);
        let parsed = n.parse_column(&millis, Some(&descriptor));
        assert_eq!(parsed.epoch_millis(), vec![Some(1_700_000_000_000), Some(1_700_000_000_500)]);

        let seconds = ["1700000000", "1700000001.5"];
        let descriptor = n.detect_format(&seconds).cloned().unwrap();
        assert_eq!(descriptor.kind, FormatKind::UnixSeconds);
        let parsed = n.parse_column(&seconds, Some(&descriptor));
        assert_eq!(parsed.epoch_millis()[1], Some(1_700_000_001_500));
    }

    #[test]
    fn unparsable_values_become_none() {
        let n = normalizer();
        let values = ["2024-01-01 00:00:00", "", "not a date", "2024-01-02 00:00:00"];
        let descriptor = n.detect_format(&n.sample(&values)).cloned();
        let parsed = n.parse_column(&values, descriptor.as_ref());
        assert_eq!(parsed.non_empty, 3);
        assert_eq!(parsed.failed, 1);
        assert!(parsed.values[1].is_none());
        assert!(parsed.values[2].is_none());
    }

    #[test]
    fn falls_back_to_best_effort_when_no_pattern_is_accepted() {
        let n = normalizer();
        let values = ["2024-01-01T08:00:00", "02/01/2024 09:00:00", "2024-01-03"];
        let parsed = n.parse_column(&values, None);
        assert_eq!(parsed.strategy, ParseStrategy::BestEffort);
        assert_eq!(parsed.failed, 0);
        assert_eq!(parsed.values[1], Some(at(2024, 1, 2, 9, 0, 0)));
    }

    #[test]
    fn tally_is_critical_only_when_every_chunk_failed() {
        let n = normalizer();
        let mut tally = ParseTally::default();
        tally.record(&n.parse_column(&["soon", "later"], None));
        let err = tally.check("TestDateUTC").expect_err("all values fail");
        assert!(matches!(err, SurveyError::CriticalParse { failed: 2, .. }));

        tally.record(&n.parse_column(&["", "2024-01-01 00:00:00"], None));
        assert_eq!(tally, ParseTally { non_empty: 3, failed: 2 });
        assert!(tally.check("TestDateUTC").is_ok());
        assert!(ParseTally::default().check("TestDateUTC").is_ok());
    }

    #[test]
    fn offset_patterns_format_as_utc() {
        let value = at(2024, 6, 14, 14, 30, 15);
        assert_eq!(
            format_with_pattern(&value, "%Y-%m-%dT%H:%M:%S%.f%:z"),
            "2024-06-14T14:30:15+00:00"
        );
        assert_eq!(format_with_pattern(&value, "%d/%m/%Y %I:%M %p"), "14/06/2024 02:30 PM");
    }

    #[test]
    fn iso_detection_and_road_name_cleanup() {
        assert!(is_iso_format(&["2024-01-01T00:00:00"]));
        assert!(!is_iso_format(&["2024-01-01 00:00:00"]));
        assert_eq!(strip_trailing_word("Main Road North"), "Main Road");
        assert_eq!(strip_trailing_word("SH1"), "SH1");
        assert_eq!(strip_trailing_word(""), "");
    }
}
