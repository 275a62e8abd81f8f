//! Column-name resolution and file-kind detection.
//!
//! Survey exports name the same column many ways ("Road ID", "RoadID",
//! "road_id"). The [`ColumnResolver`] maps those variants onto canonical names
//! using the configured alias table, and classifies a header set into one of
//! the [`FileKind`] roles the processing commands expect.
//!
//! Matching is literal: a header resolves only when it equals the canonical
//! name or one of the listed variants exactly. The canonical spelling is
//! checked before any variant, so a file carrying both `RoadID` and
//! `Road ID` resolves to `RoadID` even when `Road ID` is listed first among
//! the variants; after that, variants win in their configured order.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    config::ColumnConfig,
    error::{SurveyError, ValidationKind, display_name},
};

/// Canonical column names used throughout the crate.
pub mod canonical {
    pub const ROAD_ID: &str = "RoadID";
    pub const ROAD_NAME: &str = "RoadName";
    pub const CHAINAGE: &str = "Chainage";
    pub const START_CHAINAGE: &str = "StartChainage";
    pub const END_CHAINAGE: &str = "EndChainage";
    pub const LANE: &str = "Lane";
    pub const LANES: &str = "Lanes";
    pub const WHEELPATH: &str = "Wheelpath";
    pub const IGNORE: &str = "Ignore";
    pub const FROM: &str = "From";
    pub const TO: &str = "To";
    pub const PLATE: &str = "Plate";
    pub const TEST_DATE_UTC: &str = "TestDateUTC";
    pub const LONGITUDE: &str = "Longitude";
    pub const LATITUDE: &str = "Latitude";
    pub const WKT: &str = "WKT";
    pub const POLYGON_ID: &str = "id";
    pub const POLYGON_NAME: &str = "CouncilName";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnAlias {
    pub canonical: String,
    /// Accepted spellings in priority order.
    pub variants: Vec<String>,
}

impl ColumnAlias {
    fn new(canonical: &str, variants: &[&str]) -> Self {
        ColumnAlias {
            canonical: canonical.to_string(),
            variants: variants.iter().map(|v| v.to_string()).collect(),
        }
    }
}

pub fn default_aliases() -> Vec<ColumnAlias> {
    use canonical::*;
    vec![
        ColumnAlias::new(
            ROAD_ID,
            &["RoadID", "Road ID", "RoadId", "Road_ID", "road_id", "ROAD_ID", "roadid"],
        ),
        ColumnAlias::new(ROAD_NAME, &["RoadName", "Road Name", "Road_Name", "road_name"]),
        ColumnAlias::new(
            CHAINAGE,
            &["Chainage", "chainage", "Chainage (m)", "Chainage_m", "Location", "LocationM"],
        ),
        ColumnAlias::new(
            START_CHAINAGE,
            &[
                "StartChainage",
                "Start Chainage",
                "Start_Chainage",
                "start_chainage",
                "From Chainage",
                "StartM",
                "Start",
            ],
        ),
        ColumnAlias::new(
            END_CHAINAGE,
            &[
                "EndChainage",
                "End Chainage",
                "End_Chainage",
                "end_chainage",
                "To Chainage",
                "EndM",
                "End",
            ],
        ),
        ColumnAlias::new(LANE, &["Lane", "lane", "LANE", "Lane Code"]),
        ColumnAlias::new(LANES, &["Lanes", "lanes", "Applicable Lanes"]),
        ColumnAlias::new(WHEELPATH, &["Wheelpath", "WheelPath", "Wheel Path", "wheelpath"]),
        ColumnAlias::new(IGNORE, &["Ignore", "ignore", "IGNORE"]),
        ColumnAlias::new(FROM, &["From", "from", "Start Time", "StartTime"]),
        ColumnAlias::new(TO, &["To", "to", "End Time", "EndTime"]),
        ColumnAlias::new(PLATE, &["Plate", "plate", "Vehicle", "Registration"]),
        ColumnAlias::new(
            TEST_DATE_UTC,
            &["TestDateUTC", "Test Date UTC", "TestDateUtc", "testdateutc", "TestDate"],
        ),
        ColumnAlias::new(LONGITUDE, &["Longitude", "longitude", "Lon", "lon", "Long", "lng"]),
        ColumnAlias::new(LATITUDE, &["Latitude", "latitude", "Lat", "lat"]),
        ColumnAlias::new(WKT, &["WKT", "wkt", "Wkt", "geometry"]),
        ColumnAlias::new(POLYGON_ID, &["id", "ID", "Id", "PolygonId"]),
        ColumnAlias::new(POLYGON_NAME, &["CouncilName", "Council Name", "Name", "name"]),
    ]
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    LaneFixes,
    CombinedSurvey,
    Workbrief,
    Unknown,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::LaneFixes => "lane_fixes",
            FileKind::CombinedSurvey => "combined_survey",
            FileKind::Workbrief => "workbrief",
            FileKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileKindSignature {
    pub kind: FileKind,
    /// Canonical names that must all resolve for the signature to match.
    pub required: Vec<String>,
}

/// Lane fixes come first: their column set also satisfies looser signatures.
pub fn default_signatures() -> Vec<FileKindSignature> {
    use canonical::*;
    let signature = |kind, required: &[&str]| FileKindSignature {
        kind,
        required: required.iter().map(|r| r.to_string()).collect(),
    };
    vec![
        signature(FileKind::LaneFixes, &[FROM, TO, LANE, IGNORE, PLATE]),
        signature(FileKind::CombinedSurvey, &[TEST_DATE_UTC, LANE]),
        signature(FileKind::Workbrief, &[ROAD_ID, START_CHAINAGE, END_CHAINAGE]),
    ]
}

/// Canonical name → actual header found in a file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMap {
    entries: HashMap<String, String>,
}

impl ColumnMap {
    pub fn actual(&self, canonical: &str) -> Option<&str> {
        self.entries.get(canonical).map(String::as_str)
    }

    pub fn contains(&self, canonical: &str) -> bool {
        self.entries.contains_key(canonical)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position of the canonical column within `headers`.
    pub fn index_in(&self, headers: &[String], canonical: &str) -> Option<usize> {
        let actual = self.actual(canonical)?;
        headers.iter().position(|header| header == actual)
    }
}

/// Outcome of checking a header set for required canonical columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validation {
    pub missing: Vec<String>,
}

impl Validation {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn into_result(self, file: &Path) -> Result<(), SurveyError> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(SurveyError::missing_columns(file, &self.missing))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnResolver<'a> {
    aliases: &'a [ColumnAlias],
    signatures: &'a [FileKindSignature],
}

impl<'a> ColumnResolver<'a> {
    pub fn new(config: &'a ColumnConfig) -> Self {
        ColumnResolver {
            aliases: &config.aliases,
            signatures: &config.signatures,
        }
    }

    /// Maps each canonical name to the first of its variants present in
    /// `columns`. The canonical spelling itself always has top priority.
    pub fn resolve<S: AsRef<str>>(&self, columns: &[S]) -> ColumnMap {
        let present: HashSet<&str> = columns.iter().map(|c| c.as_ref()).collect();
        let mut entries = HashMap::new();
        for alias in self.aliases {
            let found = std::iter::once(&alias.canonical)
                .chain(alias.variants.iter())
                .find(|variant| present.contains(variant.as_str()));
            if let Some(actual) = found {
                entries.insert(alias.canonical.clone(), actual.clone());
            }
        }
        ColumnMap { entries }
    }

    /// Renames every resolved column to its canonical name, preserving order.
    ///
    /// Only the winning variant of each canonical name is renamed; columns
    /// already spelled as some canonical name are never renamed, which keeps
    /// the result free of duplicates and makes the operation idempotent.
    pub fn standardize<S: AsRef<str>>(&self, columns: &[S]) -> Vec<String> {
        let resolved = self.resolve(columns);
        let canonical_names: HashSet<&str> =
            self.aliases.iter().map(|a| a.canonical.as_str()).collect();
        let mut renames: HashMap<&str, &str> = HashMap::new();
        for alias in self.aliases {
            if let Some(actual) = resolved.actual(&alias.canonical) {
                renames.entry(actual).or_insert(alias.canonical.as_str());
            }
        }
        columns
            .iter()
            .map(|column| {
                let column = column.as_ref();
                if canonical_names.contains(column) {
                    return column.to_string();
                }
                renames
                    .get(column)
                    .map(|canonical| canonical.to_string())
                    .unwrap_or_else(|| column.to_string())
            })
            .collect()
    }

    pub fn detect_kind<S: AsRef<str>>(&self, columns: &[S]) -> FileKind {
        self.matching_kinds(columns)
            .into_iter()
            .next()
            .unwrap_or(FileKind::Unknown)
    }

    /// Every signature satisfied by `columns`, in priority order.
    pub fn matching_kinds<S: AsRef<str>>(&self, columns: &[S]) -> Vec<FileKind> {
        let resolved = self.resolve(columns);
        self.signatures
            .iter()
            .filter(|signature| signature.required.iter().all(|r| resolved.contains(r)))
            .map(|signature| signature.kind)
            .collect()
    }

    pub fn validate_required<S: AsRef<str>>(&self, columns: &[S], required: &[&str]) -> Validation {
        let resolved = self.resolve(columns);
        Validation {
            missing: required
                .iter()
                .filter(|name| !resolved.contains(name))
                .map(|name| name.to_string())
                .collect(),
        }
    }

    /// Rejects a file whose detected role is not `expected`, then checks the
    /// columns `expected` itself requires.
    pub fn expect_kind(
        &self,
        file: &Path,
        columns: &[String],
        expected: FileKind,
    ) -> Result<ColumnMap, SurveyError> {
        let detected = self.detect_kind(columns);
        if detected != expected {
            return Err(SurveyError::validation(
                ValidationKind::WrongFileKind,
                format!(
                    "'{}' looks like {} but {} was expected",
                    display_name(file),
                    detected,
                    expected
                ),
            ));
        }
        Ok(self.resolve(columns))
    }
}

/// Case-insensitive header lookup.
pub fn find_case_insensitive(headers: &[String], name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|header| header.trim().eq_ignore_ascii_case(name))
}
