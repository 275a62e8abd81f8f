//! Lane corrections: an asof join of survey records against time-ranged
//! lane-fix records.
//!
//! Each survey row's `TestDateUTC` is matched against `[From, To]` windows
//! (epoch milliseconds, UTC). A match rewrites the row's lane with
//! [`merge_lane`] and overwrites its `Ignore` flag, unless the fix carries
//! the `-1` sentinel lane, which leaves the row untouched but still counts
//! as a match.
//!
//! Timestamps are parsed chunk by chunk without failing; a `From`, `To` or
//! survey timestamp column is rejected only when none of its values in the
//! whole file parsed.

use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    chunked::{ChunkTransform, ReferenceJoin},
    columns::{ColumnResolver, FileKind, canonical},
    config::Config,
    error::SurveyError,
    frame::{Table, parse_bool, render_bool},
    interval::{AsofIndex, Interval, JoinResult},
    timestamp::{self, FormatDescriptor, ParseTally, ParsedColumn, TimestampNormalizer},
};

pub const SENTINEL_LANE: &str = "-1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneFix {
    pub lane: String,
    pub ignore: bool,
}

impl LaneFix {
    pub fn is_sentinel(&self) -> bool {
        self.lane.trim() == SENTINEL_LANE
    }
}

pub type LaneFixEntry = Interval<i64, LaneFix>;

/// Combines a row's lane with a fix lane.
///
/// A fix longer than two characters replaces the lane outright. Otherwise,
/// when the current lane has more than one character, the fix replaces the
/// second character (`"A5B"` + `"12"` → `"A12B"`). A one-character lane is
/// simply replaced.
pub fn merge_lane(current: &str, fix: &str) -> String {
    if fix.chars().count() > 2 {
        return fix.to_string();
    }
    if current.chars().count() > 1 {
        let mut merged = String::with_capacity(current.len() + fix.len());
        let mut chars = current.chars();
        if let Some(first) = chars.next() {
            merged.push(first);
        }
        merged.push_str(fix);
        merged.extend(chars.skip(1));
        return merged;
    }
    fix.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaneFixStats {
    pub rows: usize,
    pub matched: usize,
    pub sentinel: usize,
    pub lanes_changed: usize,
    pub unmatched: usize,
    pub unparsed_timestamps: usize,
    pub road_names_stripped: usize,
    pub skipped_fixes: usize,
}

#[derive(Debug, Clone, Copy)]
struct ReferenceColumns {
    from: usize,
    to: usize,
    lane: usize,
    ignore: usize,
}

#[derive(Debug, Clone, Copy)]
struct SurveyColumns {
    timestamp: usize,
    lane: usize,
    ignore: usize,
    road_name: Option<usize>,
}

/// Detection runs once, on the first chunk that has any timestamps.
#[derive(Debug, Clone, Default)]
enum Detection {
    #[default]
    Pending,
    Done {
        descriptor: Option<FormatDescriptor>,
        iso: bool,
    },
}

pub struct LaneFixJoin<'a> {
    config: &'a Config,
    resolver: ColumnResolver<'a>,
    normalizer: TimestampNormalizer,
    reference: Option<ReferenceColumns>,
    reference_detection: Detection,
    from_tally: ParseTally,
    to_tally: ParseTally,
    survey: Option<SurveyColumns>,
    survey_timestamp_name: String,
    survey_detection: Detection,
    survey_tally: ParseTally,
    index: AsofIndex<i64, LaneFix>,
    stats: LaneFixStats,
}

impl<'a> LaneFixJoin<'a> {
    pub fn new(config: &'a Config) -> Result<Self> {
        Ok(LaneFixJoin {
            config,
            resolver: ColumnResolver::new(&config.columns),
            normalizer: TimestampNormalizer::new(&config.timestamps)?,
            reference: None,
            reference_detection: Detection::Pending,
            from_tally: ParseTally::default(),
            to_tally: ParseTally::default(),
            survey: None,
            survey_timestamp_name: canonical::TEST_DATE_UTC.to_string(),
            survey_detection: Detection::Pending,
            survey_tally: ParseTally::default(),
            index: AsofIndex::new(Vec::new()),
            stats: LaneFixStats::default(),
        })
    }

    pub fn stats_snapshot(&self) -> &LaneFixStats {
        &self.stats
    }

    fn detect(&self, values: &[&str]) -> Detection {
        let sample = self.normalizer.sample(values);
        let descriptor = self.normalizer.detect_format(&sample).cloned();
        match &descriptor {
            Some(d) => info!("Detected timestamp format '{}'", d.name),
            None => warn!("No timestamp format reached the detection threshold; parsing best effort"),
        }
        Detection::Done {
            descriptor,
            iso: timestamp::is_iso_format(&sample),
        }
    }

    fn parse_keys(&self, values: &[&str], detection: &Detection) -> ParsedColumn {
        let descriptor = match detection {
            Detection::Done { descriptor, .. } => descriptor.as_ref(),
            Detection::Pending => None,
        };
        self.normalizer.parse_column(values, descriptor)
    }

    fn apply(&mut self, table: &mut Table, keys: &[Option<i64>]) {
        let Some(columns) = self.survey else {
            return;
        };
        let results = self.index.join(keys);
        for (row_idx, result) in results.into_iter().enumerate() {
            let row = &mut table.rows_mut()[row_idx];
            if let Some(flag) = parse_bool(&row[columns.ignore]) {
                row[columns.ignore] = render_bool(flag).to_string();
            }
            match result {
                JoinResult::Matched(idx) => {
                    self.stats.matched += 1;
                    let fix = &self.index.get(idx).payload;
                    if fix.is_sentinel() {
                        self.stats.sentinel += 1;
                        continue;
                    }
                    let merged = merge_lane(&row[columns.lane], &fix.lane);
                    if merged != row[columns.lane] {
                        self.stats.lanes_changed += 1;
                    }
                    row[columns.lane] = merged;
                    row[columns.ignore] = render_bool(fix.ignore).to_string();
                }
                JoinResult::Unmatched => self.stats.unmatched += 1,
            }
        }
    }
}

impl ReferenceJoin for LaneFixJoin<'_> {
    type Entry = LaneFixEntry;

    fn bind_reference(&mut self, file: &Path, headers: &[String]) -> Result<()> {
        let map = self
            .resolver
            .expect_kind(file, headers, FileKind::LaneFixes)?;
        let index = |name: &str| {
            map.index_in(headers, name)
                .ok_or_else(|| SurveyError::missing_columns(file, &[name.to_string()]))
        };
        self.reference = Some(ReferenceColumns {
            from: index(canonical::FROM)?,
            to: index(canonical::TO)?,
            lane: index(canonical::LANE)?,
            ignore: index(canonical::IGNORE)?,
        });
        Ok(())
    }

    fn extract_reference(&mut self, chunk: &Table) -> Result<Vec<Self::Entry>> {
        let Some(columns) = self.reference else {
            return Ok(Vec::new());
        };
        let from = chunk.column(columns.from);
        let to = chunk.column(columns.to);
        if matches!(self.reference_detection, Detection::Pending) {
            let mut combined = from.clone();
            combined.extend(to.iter().copied());
            if combined.iter().any(|v| !v.trim().is_empty()) {
                self.reference_detection = self.detect(&combined);
            }
        }
        let detection = self.reference_detection.clone();
        let starts = self.parse_keys(&from, &detection);
        let ends = self.parse_keys(&to, &detection);
        self.from_tally.record(&starts);
        self.to_tally.record(&ends);
        let (starts, ends) = (starts.epoch_millis(), ends.epoch_millis());

        let mut entries = Vec::with_capacity(chunk.len());
        for (row_idx, row) in chunk.rows().iter().enumerate() {
            let (Some(start), Some(end)) = (starts[row_idx], ends[row_idx]) else {
                self.stats.skipped_fixes += 1;
                continue;
            };
            entries.push(Interval::new(
                start,
                end,
                LaneFix {
                    lane: row[columns.lane].trim().to_string(),
                    ignore: parse_bool(&row[columns.ignore]).unwrap_or(false),
                },
            ));
        }
        Ok(entries)
    }

    fn finish_reference(&mut self) -> Result<()> {
        self.from_tally
            .check(canonical::FROM)
            .context("Parsing lane-fix windows")?;
        self.to_tally
            .check(canonical::TO)
            .context("Parsing lane-fix windows")?;
        Ok(())
    }

    fn install_index(&mut self, entries: Vec<Self::Entry>) -> Result<()> {
        if self.stats.skipped_fixes > 0 {
            warn!(
                "Skipped {} lane fix(es) with unparsable From/To",
                self.stats.skipped_fixes
            );
        }
        self.index = AsofIndex::new(entries);
        info!("Indexed {} lane fix interval(s)", self.index.len());
        Ok(())
    }
}

impl ChunkTransform for LaneFixJoin<'_> {
    fn bind(&mut self, file: &Path, headers: &[String]) -> Result<Vec<String>> {
        let map = self
            .resolver
            .expect_kind(file, headers, FileKind::CombinedSurvey)?;
        let timestamp = map
            .index_in(headers, canonical::TEST_DATE_UTC)
            .ok_or_else(|| SurveyError::missing_columns(file, &[canonical::TEST_DATE_UTC.into()]))?;
        let lane = map
            .index_in(headers, canonical::LANE)
            .ok_or_else(|| SurveyError::missing_columns(file, &[canonical::LANE.into()]))?;
        let mut output = headers.to_vec();
        let ignore = match map.index_in(headers, canonical::IGNORE) {
            Some(idx) => idx,
            None => {
                output.push(canonical::IGNORE.to_string());
                output.len() - 1
            }
        };
        self.survey_timestamp_name = headers[timestamp].clone();
        self.survey = Some(SurveyColumns {
            timestamp,
            lane,
            ignore,
            road_name: map.index_in(headers, canonical::ROAD_NAME),
        });
        Ok(output)
    }

    fn transform(&mut self, chunk: &mut Table) -> Result<()> {
        let Some(columns) = self.survey else {
            return Ok(());
        };
        if columns.ignore == chunk.headers().len() {
            chunk.ensure_column(canonical::IGNORE);
        }
        self.stats.rows += chunk.len();

        let values: Vec<String> = chunk
            .column(columns.timestamp)
            .into_iter()
            .map(str::to_string)
            .collect();
        let values: Vec<&str> = values.iter().map(String::as_str).collect();
        if matches!(self.survey_detection, Detection::Pending)
            && values.iter().any(|v| !v.trim().is_empty())
        {
            self.survey_detection = self.detect(&values);
            if let Detection::Done { iso: true, .. } = self.survey_detection {
                if self.config.timestamps.strip_road_name_on_iso && columns.road_name.is_some() {
                    warn!("ISO timestamps detected; trimming the trailing word of road names");
                }
            }
        }
        let detection = self.survey_detection.clone();
        let parsed = self.parse_keys(&values, &detection);
        self.survey_tally.record(&parsed);
        self.stats.unparsed_timestamps += parsed.failed;
        let keys = parsed.epoch_millis();

        if let (Detection::Done { iso: true, .. }, Some(road_name)) = (&detection, columns.road_name)
        {
            if self.config.timestamps.strip_road_name_on_iso {
                for row in chunk.rows_mut() {
                    let stripped = timestamp::strip_trailing_word(&row[road_name]);
                    if stripped.len() != row[road_name].len() {
                        row[road_name] = stripped.to_string();
                        self.stats.road_names_stripped += 1;
                    }
                }
            }
        }

        self.apply(chunk, &keys);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.survey_tally
            .check(&self.survey_timestamp_name)
            .context("Parsing survey timestamps")?;
        Ok(())
    }

    fn stats(&self) -> Vec<(String, String)> {
        let s = &self.stats;
        let mut rows = vec![
            ("matched".to_string(), s.matched.to_string()),
            ("sentinel matches".to_string(), s.sentinel.to_string()),
            ("lanes changed".to_string(), s.lanes_changed.to_string()),
            ("unmatched".to_string(), s.unmatched.to_string()),
        ];
        if let Detection::Done {
            descriptor: Some(d),
            ..
        } = &self.survey_detection
        {
            rows.push(("timestamp format".to_string(), d.name.clone()));
        }
        if s.unparsed_timestamps > 0 {
            rows.push((
                "unparsed timestamps".to_string(),
                s.unparsed_timestamps.to_string(),
            ));
        }
        if s.road_names_stripped > 0 {
            rows.push((
                "road names trimmed".to_string(),
                s.road_names_stripped.to_string(),
            ));
        }
        if s.skipped_fixes > 0 {
            rows.push(("skipped fixes".to_string(), s.skipped_fixes.to_string()));
        }
        rows
    }
}
