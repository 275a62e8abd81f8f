//! Chainage containment joins: workbrief and client-feedback ranges.
//!
//! Reference rows describe `[StartChainage, EndChainage]` windows on a road.
//! Each survey row takes the first window, in reference order, on the same
//! road that contains its chainage and passes the optional lane, wheelpath
//! and lanes filters. Matched rows receive the window's payload columns;
//! unmatched rows keep their existing values.

use std::{collections::HashSet, fmt, path::Path};

use anyhow::Result;
use log::{info, warn};

use crate::{
    chunked::{ChunkTransform, ReferenceJoin},
    columns::{ColumnMap, ColumnResolver, canonical},
    config::{Config, ContainmentRole},
    error::SurveyError,
    frame::{Table, render_bool},
    interval::{ContainmentIndex, ContainmentProbe, JoinResult, Segment, SegmentFilters},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainmentKind {
    Workbrief,
    Feedback,
}

impl ContainmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainmentKind::Workbrief => "workbrief",
            ContainmentKind::Feedback => "feedback",
        }
    }

    pub fn role(self, config: &Config) -> &ContainmentRole {
        match self {
            ContainmentKind::Workbrief => &config.containment.workbrief,
            ContainmentKind::Feedback => &config.containment.feedback,
        }
    }
}

impl fmt::Display for ContainmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const KEY_COLUMNS: [&str; 6] = [
    canonical::ROAD_ID,
    canonical::START_CHAINAGE,
    canonical::END_CHAINAGE,
    canonical::LANE,
    canonical::WHEELPATH,
    canonical::LANES,
];

#[derive(Debug, Clone)]
struct ReferenceColumns {
    road: usize,
    start: usize,
    end: usize,
    lane: Option<usize>,
    wheelpath: Option<usize>,
    lanes: Option<usize>,
    payload: Vec<usize>,
}

#[derive(Debug, Clone)]
struct SurveyColumns {
    road: usize,
    chainage: usize,
    lane: Option<usize>,
    wheelpath: Option<usize>,
    /// Output position of each payload column.
    payload: Vec<usize>,
    flag: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainmentStats {
    pub rows: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub invalid_chainage: usize,
    pub skipped_ranges: usize,
    pub reversed_ranges: usize,
}

pub struct ContainmentJoin<'a> {
    kind: ContainmentKind,
    role: &'a ContainmentRole,
    resolver: ColumnResolver<'a>,
    payload_names: Vec<String>,
    reference: Option<ReferenceColumns>,
    survey: Option<SurveyColumns>,
    index: ContainmentIndex<Vec<String>>,
    stats: ContainmentStats,
}

fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn optional_cell(row: &[String], idx: Option<usize>) -> Option<String> {
    idx.map(|i| row[i].trim().to_string()).filter(|v| !v.is_empty())
}

impl<'a> ContainmentJoin<'a> {
    pub fn new(config: &'a Config, kind: ContainmentKind) -> Self {
        ContainmentJoin {
            kind,
            role: kind.role(config),
            resolver: ColumnResolver::new(&config.columns),
            payload_names: Vec::new(),
            reference: None,
            survey: None,
            index: ContainmentIndex::new(Vec::new()),
            stats: ContainmentStats::default(),
        }
    }

    pub fn stats_snapshot(&self) -> &ContainmentStats {
        &self.stats
    }

    pub fn payload_names(&self) -> &[String] {
        &self.payload_names
    }

    fn required(map: &ColumnMap, headers: &[String], file: &Path, name: &str) -> Result<usize, SurveyError> {
        map.index_in(headers, name)
            .ok_or_else(|| SurveyError::missing_columns(file, &[name.to_string()]))
    }
}

impl ReferenceJoin for ContainmentJoin<'_> {
    type Entry = Segment<Vec<String>>;

    fn bind_reference(&mut self, file: &Path, headers: &[String]) -> Result<()> {
        self.resolver
            .validate_required(
                headers,
                &[
                    canonical::ROAD_ID,
                    canonical::START_CHAINAGE,
                    canonical::END_CHAINAGE,
                ],
            )
            .into_result(file)?;
        let map = self.resolver.resolve(headers);
        let key_positions: HashSet<usize> = KEY_COLUMNS
            .iter()
            .filter_map(|name| map.index_in(headers, name))
            .collect();

        let payload: Vec<usize> = if self.role.payload_columns.is_empty() {
            (0..headers.len())
                .filter(|idx| !key_positions.contains(idx) && !headers[*idx].is_empty())
                .collect()
        } else {
            let missing: Vec<String> = self
                .role
                .payload_columns
                .iter()
                .filter(|name| !headers.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(SurveyError::missing_columns(file, &missing).into());
            }
            self.role
                .payload_columns
                .iter()
                .filter_map(|name| headers.iter().position(|h| h == name))
                .collect()
        };
        self.payload_names = payload.iter().map(|idx| headers[*idx].clone()).collect();
        info!(
            "{} payload columns: {}",
            self.kind,
            self.payload_names.join(", ")
        );

        self.reference = Some(ReferenceColumns {
            road: Self::required(&map, headers, file, canonical::ROAD_ID)?,
            start: Self::required(&map, headers, file, canonical::START_CHAINAGE)?,
            end: Self::required(&map, headers, file, canonical::END_CHAINAGE)?,
            lane: map.index_in(headers, canonical::LANE),
            wheelpath: map.index_in(headers, canonical::WHEELPATH),
            lanes: map.index_in(headers, canonical::LANES),
            payload,
        });
        Ok(())
    }

    fn extract_reference(&mut self, chunk: &Table) -> Result<Vec<Self::Entry>> {
        let Some(columns) = self.reference.as_ref() else {
            return Ok(Vec::new());
        };
        let scale = self.role.chainage_scale;
        let mut segments = Vec::with_capacity(chunk.len());
        for row in chunk.rows() {
            let (Some(start), Some(end)) = (parse_number(&row[columns.start]), parse_number(&row[columns.end])) else {
                self.stats.skipped_ranges += 1;
                continue;
            };
            if start > end {
                self.stats.reversed_ranges += 1;
            }
            segments.push(Segment {
                road: row[columns.road].clone(),
                start: start * scale,
                end: end * scale,
                filters: SegmentFilters {
                    lane: optional_cell(row, columns.lane),
                    wheelpath: optional_cell(row, columns.wheelpath),
                    lanes: optional_cell(row, columns.lanes),
                },
                payload: columns.payload.iter().map(|idx| row[*idx].clone()).collect(),
            });
        }
        Ok(segments)
    }

    fn install_index(&mut self, entries: Vec<Self::Entry>) -> Result<()> {
        if self.stats.skipped_ranges > 0 {
            warn!(
                "Skipped {} {} range(s) with non-numeric chainage",
                self.stats.skipped_ranges, self.kind
            );
        }
        if self.stats.reversed_ranges > 0 {
            warn!(
                "{} {} range(s) have start after end and will never match",
                self.stats.reversed_ranges, self.kind
            );
        }
        self.index = ContainmentIndex::new(entries);
        info!(
            "Indexed {} {} range(s) over {} road(s)",
            self.index.len(),
            self.kind,
            self.index.roads()
        );
        Ok(())
    }
}

impl ChunkTransform for ContainmentJoin<'_> {
    fn bind(&mut self, file: &Path, headers: &[String]) -> Result<Vec<String>> {
        self.resolver
            .validate_required(headers, &[canonical::ROAD_ID, canonical::CHAINAGE])
            .into_result(file)?;
        let map = self.resolver.resolve(headers);
        let mut output = headers.to_vec();
        let position = |name: &str, output: &mut Vec<String>| match output.iter().position(|h| h == name) {
            Some(idx) => idx,
            None => {
                output.push(name.to_string());
                output.len() - 1
            }
        };
        let payload = self
            .payload_names
            .iter()
            .map(|name| position(name.as_str(), &mut output))
            .collect();
        let flag = self
            .role
            .flag_column
            .as_deref()
            .map(|name| position(name, &mut output));
        self.survey = Some(SurveyColumns {
            road: Self::required(&map, headers, file, canonical::ROAD_ID)?,
            chainage: Self::required(&map, headers, file, canonical::CHAINAGE)?,
            lane: map.index_in(headers, canonical::LANE),
            wheelpath: map.index_in(headers, canonical::WHEELPATH),
            payload,
            flag,
        });
        Ok(output)
    }

    fn transform(&mut self, chunk: &mut Table) -> Result<()> {
        let Some(columns) = self.survey.clone() else {
            return Ok(());
        };
        for name in &self.payload_names {
            chunk.ensure_column(name);
        }
        if let Some(flag) = &self.role.flag_column {
            chunk.ensure_column(flag);
        }
        self.stats.rows += chunk.len();

        let results: Vec<JoinResult> = chunk
            .rows()
            .iter()
            .map(|row| {
                let chainage = parse_number(&row[columns.chainage]);
                if chainage.is_none() {
                    self.stats.invalid_chainage += 1;
                }
                self.index.lookup(&ContainmentProbe {
                    road: &row[columns.road],
                    chainage,
                    lane: columns.lane.map(|i| row[i].as_str()),
                    wheelpath: columns.wheelpath.map(|i| row[i].as_str()),
                })
            })
            .collect();

        for (row, result) in chunk.rows_mut().iter_mut().zip(results) {
            match result {
                JoinResult::Matched(idx) => {
                    self.stats.matched += 1;
                    let segment = self.index.get(idx);
                    for (value, target) in segment.payload.iter().zip(&columns.payload) {
                        row[*target] = value.clone();
                    }
                    if let Some(flag) = columns.flag {
                        row[flag] = render_bool(true).to_string();
                    }
                }
                JoinResult::Unmatched => {
                    self.stats.unmatched += 1;
                    if let Some(flag) = columns.flag {
                        row[flag] = render_bool(false).to_string();
                    }
                }
            }
        }
        Ok(())
    }

    fn stats(&self) -> Vec<(String, String)> {
        let s = &self.stats;
        let mut rows = vec![
            ("matched".to_string(), s.matched.to_string()),
            ("unmatched".to_string(), s.unmatched.to_string()),
        ];
        if s.invalid_chainage > 0 {
            rows.push(("invalid chainage".to_string(), s.invalid_chainage.to_string()));
        }
        if s.skipped_ranges > 0 {
            rows.push(("skipped ranges".to_string(), s.skipped_ranges.to_string()));
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn prepared(config: &Config, kind: ContainmentKind) -> (ContainmentJoin<'_>, Vec<String>) {
        let mut join = ContainmentJoin::new(config, kind);
        let file = PathBuf::from("reference.csv");
        let ref_headers = strings(&["Road ID", "Start", "End", "Lane", "Treatment"]);
        join.bind_reference(&file, &ref_headers).expect("bind reference");
        let reference = Table::new(
            ref_headers,
            vec![
                strings(&["11", "0", "100", "", "Reseal"]),
                strings(&["11", "50", "150", "", "Rehab"]),
                strings(&["12", "0", "50", "L1", "Patch"]),
                strings(&["12", "x", "50", "", "Broken"]),
            ],
        );
        let entries = join.extract_reference(&reference).expect("extract");
        join.install_index(entries).expect("install");
        let survey_headers = strings(&["RoadID", "Chainage", "Lane", "Treatment"]);
        let output = join.bind(Path::new("survey.csv"), &survey_headers).expect("bind survey");
        (join, output)
    }

    #[test]
    fn workbrief_adds_payload_and_flag() {
        let config = Config::default();
        let (mut join, output) = prepared(&config, ContainmentKind::Workbrief);
        assert_eq!(output, strings(&["RoadID", "Chainage", "Lane", "Treatment", "InWorkbrief"]));

        let mut chunk = Table::new(
            strings(&["RoadID", "Chainage", "Lane", "Treatment"]),
            vec![
                strings(&["0011", "75", "L2", "old"]),
                strings(&["11", "120", "L2", ""]),
                strings(&["12", "10", "L2", "keep"]),
                strings(&["12", "10", "L1", ""]),
                strings(&["11", "n/a", "L1", ""]),
            ],
        );
        join.transform(&mut chunk).expect("transform");
        assert_eq!(chunk.headers(), output.as_slice());
        assert_eq!(chunk.rows()[0][3..], strings(&["Reseal", "True"])[..]);
        assert_eq!(chunk.rows()[1][3..], strings(&["Rehab", "True"])[..]);
        assert_eq!(chunk.rows()[2][3..], strings(&["keep", "False"])[..]);
        assert_eq!(chunk.rows()[3][3..], strings(&["Patch", "True"])[..]);
        assert_eq!(chunk.rows()[4][4], "False");

        let stats = join.stats_snapshot();
        assert_eq!(stats.matched, 3);
        assert_eq!(stats.unmatched, 2);
        assert_eq!(stats.invalid_chainage, 1);
        assert_eq!(stats.skipped_ranges, 1);
    }

    #[test]
    fn feedback_has_no_flag_column() {
        let config = Config::default();
        let (_, output) = prepared(&config, ContainmentKind::Feedback);
        assert_eq!(output, strings(&["RoadID", "Chainage", "Lane", "Treatment"]));
    }

    #[test]
    fn configured_payload_must_exist() {
        let mut config = Config::default();
        config.containment.feedback.payload_columns = vec!["Comment".to_string()];
        let mut join = ContainmentJoin::new(&config, ContainmentKind::Feedback);
        let err = join
            .bind_reference(
                Path::new("feedback.csv"),
                &strings(&["RoadID", "StartChainage", "EndChainage"]),
            )
            .expect_err("missing payload column");
        assert!(err.to_string().contains("Comment"));
    }

    #[test]
    fn chainage_scale_applies_to_reference() {
        let mut config = Config::default();
        config.containment.feedback.chainage_scale = 1000.0;
        let mut join = ContainmentJoin::new(&config, ContainmentKind::Feedback);
        let headers = strings(&["RoadID", "StartChainage", "EndChainage", "Note"]);
        join.bind_reference(Path::new("fb.csv"), &headers).expect("bind");
        let entries = join
            .extract_reference(&Table::new(headers, vec![strings(&["5", "1.2", "1.5", "check"])]))
            .expect("extract");
        assert_eq!(entries[0].start, 1200.0);
        assert_eq!(entries[0].end, 1500.0);
    }
}
