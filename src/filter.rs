//! Row-level quality filter for survey exports.
//!
//! Six steps run in a fixed order, each removing rows:
//!
//! 1. duplicates of the dedupe key (first occurrence kept),
//! 2. rows where both columns of the empty pair are blank,
//! 3. rows where a numeric column is below its threshold,
//! 4. rows where `|numerator| / denominator` is below its threshold or not a
//!    finite number,
//! 5. rows whose column contains a substring (case-sensitive),
//! 6. rows whose boolean column reads `true` in any casing.
//!
//! A step whose columns are missing from the input is skipped. The filter
//! never rewrites cells; boolean rendering happens where the output is
//! written.

use std::{collections::HashSet, fmt, path::Path};

use anyhow::Result;
use log::{info, warn};

use crate::{
    chunked::ChunkTransform,
    config::FilterConfig,
    frame::{BooleanColumns, Table},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterStep {
    Duplicate,
    EmptyPair,
    BelowMinimum,
    BelowRatio,
    Substring,
    FlaggedTrue,
}

impl FilterStep {
    pub const ALL: [FilterStep; 6] = [
        FilterStep::Duplicate,
        FilterStep::EmptyPair,
        FilterStep::BelowMinimum,
        FilterStep::BelowRatio,
        FilterStep::Substring,
        FilterStep::FlaggedTrue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FilterStep::Duplicate => "duplicate key",
            FilterStep::EmptyPair => "empty pair",
            FilterStep::BelowMinimum => "below minimum",
            FilterStep::BelowRatio => "below ratio",
            FilterStep::Substring => "substring match",
            FilterStep::FlaggedTrue => "flagged true",
        }
    }

    fn position(self) -> usize {
        FilterStep::ALL
            .iter()
            .position(|step| *step == self)
            .unwrap_or_default()
    }
}

impl fmt::Display for FilterStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column positions of each step that applies to the bound headers.
#[derive(Debug, Clone, Default)]
struct FilterPlan {
    dedupe: Option<usize>,
    empty_pair: Option<(usize, usize)>,
    min_value: Option<(usize, f64)>,
    ratio: Option<(usize, usize, f64)>,
    substring: Option<(usize, String)>,
    boolean_true: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub input_rows: usize,
    pub output_rows: usize,
    pub removed: [usize; 6],
}

impl FilterStats {
    pub fn removed_by(&self, step: FilterStep) -> usize {
        self.removed[step.position()]
    }
}

pub struct RecordFilter<'a> {
    config: &'a FilterConfig,
    plan: FilterPlan,
    seen: HashSet<String>,
    stats: FilterStats,
}

fn number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok()
}

impl<'a> RecordFilter<'a> {
    pub fn new(config: &'a FilterConfig) -> Self {
        RecordFilter {
            config,
            plan: FilterPlan::default(),
            seen: HashSet::new(),
            stats: FilterStats::default(),
        }
    }

    pub fn stats_snapshot(&self) -> &FilterStats {
        &self.stats
    }

    /// Resolves step columns against `headers`, logging every skipped step.
    pub fn bind_headers(&mut self, headers: &[String]) {
        let find = |name: &str| headers.iter().position(|h| h == name);
        let config = self.config;
        let mut plan = FilterPlan::default();

        if let Some(column) = &config.dedupe_column {
            plan.dedupe = find(column);
        }
        if let Some([a, b]) = &config.empty_pair {
            plan.empty_pair = find(a).zip(find(b));
        }
        if let Some(rule) = &config.min_value {
            plan.min_value = find(&rule.column).map(|idx| (idx, rule.threshold));
        }
        if let Some(rule) = &config.ratio {
            plan.ratio = find(&rule.numerator)
                .zip(find(&rule.denominator))
                .map(|(a, b)| (a, b, rule.threshold));
        }
        if let Some(rule) = &config.substring {
            plan.substring = find(&rule.column).map(|idx| (idx, rule.needle.clone()));
        }
        if let Some(column) = &config.boolean_true {
            plan.boolean_true = find(column);
        }

        let configured = [
            (FilterStep::Duplicate, config.dedupe_column.is_some(), plan.dedupe.is_some()),
            (FilterStep::EmptyPair, config.empty_pair.is_some(), plan.empty_pair.is_some()),
            (FilterStep::BelowMinimum, config.min_value.is_some(), plan.min_value.is_some()),
            (FilterStep::BelowRatio, config.ratio.is_some(), plan.ratio.is_some()),
            (FilterStep::Substring, config.substring.is_some(), plan.substring.is_some()),
            (FilterStep::FlaggedTrue, config.boolean_true.is_some(), plan.boolean_true.is_some()),
        ];
        for (step, wanted, bound) in configured {
            if wanted && !bound {
                info!("Filter step '{step}' skipped: column(s) not present");
            }
        }
        self.plan = plan;
    }

    /// First step that removes `row`, if any. Updates the dedupe state.
    fn rejecting_step(&mut self, row: &[String]) -> Option<FilterStep> {
        let plan = &self.plan;
        if let Some(idx) = plan.dedupe {
            if !self.seen.insert(row[idx].clone()) {
                return Some(FilterStep::Duplicate);
            }
        }
        if let Some((a, b)) = plan.empty_pair {
            if row[a].trim().is_empty() && row[b].trim().is_empty() {
                return Some(FilterStep::EmptyPair);
            }
        }
        if let Some((idx, threshold)) = plan.min_value {
            if number(&row[idx]).is_some_and(|v| v < threshold) {
                return Some(FilterStep::BelowMinimum);
            }
        }
        if let Some((a, b, threshold)) = plan.ratio {
            let ratio = number(&row[a])
                .zip(number(&row[b]))
                .map(|(num, den)| num.abs() / den);
            if !ratio.is_some_and(|r| r.is_finite() && r >= threshold) {
                return Some(FilterStep::BelowRatio);
            }
        }
        if let Some((idx, needle)) = &plan.substring {
            if row[*idx].contains(needle.as_str()) {
                return Some(FilterStep::Substring);
            }
        }
        if let Some(idx) = plan.boolean_true {
            if row[idx].trim().eq_ignore_ascii_case("true") {
                return Some(FilterStep::FlaggedTrue);
            }
        }
        None
    }

    /// Removes rejected rows from `table` in place, preserving order.
    pub fn apply(&mut self, table: &mut Table) {
        self.stats.input_rows += table.len();
        let rows = std::mem::take(table.rows_mut());
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            match self.rejecting_step(&row) {
                Some(step) => self.stats.removed[step.position()] += 1,
                None => kept.push(row),
            }
        }
        *table.rows_mut() = kept;
        self.stats.output_rows += table.len();
    }

    pub fn log_summary(&self) {
        for step in FilterStep::ALL {
            info!(
                "Filter step '{step}' removed {} row(s)",
                self.stats.removed_by(step)
            );
        }
        if self.stats.output_rows == 0 && self.stats.input_rows > 0 {
            warn!("Every row was removed by the filter");
        }
    }
}

/// Filters a whole table in memory and renders its boolean columns.
pub fn filter_table(config: &FilterConfig, mut table: Table) -> (Table, FilterStats) {
    let mut filter = RecordFilter::new(config);
    filter.bind_headers(table.headers());
    filter.apply(&mut table);
    BooleanColumns::new().render(&mut table);
    filter.log_summary();
    (table, filter.stats)
}

impl ChunkTransform for RecordFilter<'_> {
    fn bind(&mut self, _file: &Path, headers: &[String]) -> Result<Vec<String>> {
        self.bind_headers(headers);
        Ok(headers.to_vec())
    }

    fn transform(&mut self, chunk: &mut Table) -> Result<()> {
        self.apply(chunk);
        Ok(())
    }

    fn preserves_rows(&self) -> bool {
        false
    }

    fn stats(&self) -> Vec<(String, String)> {
        self.log_summary();
        FilterStep::ALL
            .iter()
            .map(|step| {
                (
                    format!("removed: {step}"),
                    self.stats.removed_by(*step).to_string(),
                )
            })
            .collect()
    }
}
