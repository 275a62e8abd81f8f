//! Range-join engine.
//!
//! Two join modes over a reference set of `[start, end]` intervals:
//!
//! * **Asof** ([`AsofIndex`]): each key takes the interval with the greatest
//!   `start <= key`, and matches only if `key <= end` of that same interval.
//!   An earlier interval that also covers the key is never consulted. Among
//!   equal starts the one appearing last in the reference table wins.
//! * **Containment** ([`ContainmentIndex`]): each probe takes the first
//!   interval, in reference table order, on the same normalized road whose
//!   `[start, end]` contains the chainage and whose optional lane, wheelpath
//!   and lanes filters all agree.
//!
//! Both produce exactly one [`JoinResult`] per input key, in input order.

use std::{cmp::Ordering, collections::HashMap};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::SurveyError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interval<K, P> {
    pub start: K,
    pub end: K,
    pub payload: P,
}

impl<K, P> Interval<K, P> {
    pub fn new(start: K, end: K, payload: P) -> Self {
        Interval {
            start,
            end,
            payload,
        }
    }
}

/// Outcome for one input key. `Matched` carries the position of the
/// interval inside the index that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinResult {
    Matched(usize),
    Unmatched,
}

impl JoinResult {
    pub fn matched(self) -> Option<usize> {
        match self {
            JoinResult::Matched(idx) => Some(idx),
            JoinResult::Unmatched => None,
        }
    }

    pub fn is_matched(self) -> bool {
        matches!(self, JoinResult::Matched(_))
    }
}

fn comparable<K: PartialOrd>(value: &K) -> bool {
    value.partial_cmp(value).is_some()
}

pub struct AsofIndex<K, P> {
    intervals: Vec<Interval<K, P>>,
}

impl<K, P> AsofIndex<K, P>
where
    K: PartialOrd + Copy,
{
    /// Intervals whose bounds do not compare with themselves (NaN) are
    /// dropped. The remaining ones are stably sorted by start.
    pub fn new(intervals: Vec<Interval<K, P>>) -> Self {
        let total = intervals.len();
        let mut intervals: Vec<_> = intervals
            .into_iter()
            .filter(|iv| comparable(&iv.start) && comparable(&iv.end))
            .collect();
        if intervals.len() < total {
            warn!(
                "Dropped {} interval(s) with unusable bounds",
                total - intervals.len()
            );
        }
        intervals.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(Ordering::Equal));
        AsofIndex { intervals }
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn get(&self, idx: usize) -> &Interval<K, P> {
        &self.intervals[idx]
    }

    pub fn intervals(&self) -> &[Interval<K, P>] {
        &self.intervals
    }

    pub fn lookup(&self, key: K) -> JoinResult {
        let pos = self.intervals.partition_point(|iv| iv.start <= key);
        if pos == 0 {
            return JoinResult::Unmatched;
        }
        let idx = pos - 1;
        if key <= self.intervals[idx].end {
            JoinResult::Matched(idx)
        } else {
            JoinResult::Unmatched
        }
    }

    /// One result per key; a missing key never matches.
    pub fn join(&self, keys: &[Option<K>]) -> Vec<JoinResult> {
        keys.iter()
            .map(|key| match key {
                Some(key) => self.lookup(*key),
                None => JoinResult::Unmatched,
            })
            .collect()
    }
}

/// Numeric road ids compare by value, so `"0011"`, `"11"` and `"11.0"` are
/// the same road. Anything else compares as its trimmed text.
pub fn normalize_road_id(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => {
            if value.fract() == 0.0 && value.abs() < 9.0e15 {
                format!("{}", value as i64)
            } else {
                format!("{value}")
            }
        }
        _ => trimmed.to_string(),
    }
}

/// Optional per-interval restrictions. An absent or empty filter accepts
/// every probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentFilters {
    pub lane: Option<String>,
    /// `Both` accepts any wheelpath.
    pub wheelpath: Option<String>,
    /// `All` accepts any lane; otherwise a list such as `L1,L2`.
    pub lanes: Option<String>,
}

impl SegmentFilters {
    fn accepts(&self, probe: &ContainmentProbe<'_>) -> bool {
        if let (Some(expected), Some(actual)) = (non_empty(&self.lane), probe.lane) {
            if !expected.eq_ignore_ascii_case(actual.trim()) {
                return false;
            }
        }
        if let (Some(expected), Some(actual)) = (non_empty(&self.wheelpath), probe.wheelpath) {
            if !expected.eq_ignore_ascii_case("both")
                && !expected.eq_ignore_ascii_case(actual.trim())
            {
                return false;
            }
        }
        if let (Some(expected), Some(actual)) = (non_empty(&self.lanes), probe.lane) {
            if !expected.eq_ignore_ascii_case("all")
                && !expected
                    .split([',', ';', '/', ' '])
                    .map(str::trim)
                    .filter(|lane| !lane.is_empty())
                    .any(|lane| lane.eq_ignore_ascii_case(actual.trim()))
            {
                return false;
            }
        }
        true
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment<P> {
    pub road: String,
    pub start: f64,
    pub end: f64,
    pub filters: SegmentFilters,
    pub payload: P,
}

/// One survey row as seen by the containment join.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainmentProbe<'a> {
    pub road: &'a str,
    pub chainage: Option<f64>,
    pub lane: Option<&'a str>,
    pub wheelpath: Option<&'a str>,
}

pub struct ContainmentIndex<P> {
    segments: Vec<Segment<P>>,
    by_road: HashMap<String, Vec<usize>>,
}

impl<P> ContainmentIndex<P> {
    /// Segments keep their table order; road keys are normalized here.
    pub fn new(segments: Vec<Segment<P>>) -> Self {
        let mut by_road: HashMap<String, Vec<usize>> = HashMap::new();
        let segments: Vec<Segment<P>> = segments
            .into_iter()
            .map(|mut segment| {
                segment.road = normalize_road_id(&segment.road);
                segment
            })
            .collect();
        for (idx, segment) in segments.iter().enumerate() {
            by_road.entry(segment.road.clone()).or_default().push(idx);
        }
        ContainmentIndex { segments, by_road }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn roads(&self) -> usize {
        self.by_road.len()
    }

    pub fn get(&self, idx: usize) -> &Segment<P> {
        &self.segments[idx]
    }

    pub fn lookup(&self, probe: &ContainmentProbe<'_>) -> JoinResult {
        let Some(chainage) = probe.chainage.filter(|c| c.is_finite()) else {
            return JoinResult::Unmatched;
        };
        let Some(candidates) = self.by_road.get(&normalize_road_id(probe.road)) else {
            return JoinResult::Unmatched;
        };
        candidates
            .iter()
            .copied()
            .find(|&idx| {
                let segment = &self.segments[idx];
                segment.start <= chainage
                    && chainage <= segment.end
                    && segment.filters.accepts(probe)
            })
            .map_or(JoinResult::Unmatched, JoinResult::Matched)
    }

    pub fn join(&self, probes: &[ContainmentProbe<'_>]) -> Vec<JoinResult> {
        probes.iter().map(|probe| self.lookup(probe)).collect()
    }
}

/// Outcome of [`preserve_input_row_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowCountCheck {
    Exact,
    Truncated { extra: usize },
}

/// Forces a join output back to the input's row count. Surplus rows are
/// dropped with a warning; a shortfall is an integrity error.
pub fn preserve_input_row_count<T>(
    expected: usize,
    rows: &mut Vec<T>,
) -> Result<RowCountCheck, SurveyError> {
    match rows.len().cmp(&expected) {
        Ordering::Equal => Ok(RowCountCheck::Exact),
        Ordering::Greater => {
            let extra = rows.len() - expected;
            warn!("Join produced {extra} surplus row(s); truncating to {expected}");
            rows.truncate(expected);
            Ok(RowCountCheck::Truncated { extra })
        }
        Ordering::Less => Err(SurveyError::RowCountShortfall {
            expected,
            actual: rows.len(),
        }),
    }
}
