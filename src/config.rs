//! Static run configuration.
//!
//! A single [`Config`] is built once at process start (defaults, optionally
//! overlaid by a YAML file) and handed by reference to every component. Nothing
//! in here is reloaded mid-run.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    columns::{self, ColumnAlias, FileKindSignature},
    error::{SurveyError, ValidationKind},
    timestamp::{self, FormatDescriptor, FormatKind},
    yaml_provider,
};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub columns: ColumnConfig,
    pub timestamps: TimestampConfig,
    pub processing: ProcessingConfig,
    pub output: OutputConfig,
    pub filter: FilterConfig,
    pub containment: ContainmentConfig,
    pub polygons: PolygonConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config: Config = yaml_provider::load_from_path(path)
            .with_context(|| format!("Loading configuration from {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        yaml_provider::save_to_path(path, self)
            .with_context(|| format!("Writing configuration to {path:?}"))
    }

    pub fn validate(&self) -> std::result::Result<(), SurveyError> {
        let invalid = |message: String| SurveyError::validation(ValidationKind::InvalidConfig, message);

        let processing = &self.processing;
        if processing.chunk_size == 0 {
            return Err(invalid("processing.chunk_size must be greater than zero".into()));
        }
        for (name, ratio) in [
            ("processing.hybrid_ratio", processing.hybrid_ratio),
            ("processing.streaming_ratio", processing.streaming_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(invalid(format!("{name} must be within (0, 1], got {ratio}")));
            }
        }
        if processing.hybrid_ratio > processing.streaming_ratio {
            return Err(invalid(
                "processing.hybrid_ratio must not exceed processing.streaming_ratio".into(),
            ));
        }
        if processing.memory_multiplier <= 0.0 {
            return Err(invalid("processing.memory_multiplier must be positive".into()));
        }

        let timestamps = &self.timestamps;
        if timestamps.formats.is_empty() {
            return Err(invalid("timestamps.formats must list at least one format".into()));
        }
        for descriptor in &timestamps.formats {
            Regex::new(&descriptor.regex).map_err(|err| {
                invalid(format!(
                    "timestamp format '{}' has an invalid regex: {err}",
                    descriptor.name
                ))
            })?;
            if descriptor.kind == FormatKind::Strptime && descriptor.patterns.is_empty() {
                return Err(invalid(format!(
                    "timestamp format '{}' lists no parse patterns",
                    descriptor.name
                )));
            }
        }
        for (name, ratio) in [
            ("timestamps.detection_threshold", timestamps.detection_threshold),
            ("timestamps.acceptance_threshold", timestamps.acceptance_threshold),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(invalid(format!("{name} must be within [0, 1], got {ratio}")));
            }
        }
        if timestamps.sample_size == 0 {
            return Err(invalid("timestamps.sample_size must be greater than zero".into()));
        }

        for alias in &self.columns.aliases {
            if alias.variants.is_empty() {
                return Err(invalid(format!(
                    "column alias '{}' lists no variants",
                    alias.canonical
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    pub aliases: Vec<ColumnAlias>,
    pub signatures: Vec<FileKindSignature>,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        ColumnConfig {
            aliases: columns::default_aliases(),
            signatures: columns::default_signatures(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampConfig {
    pub formats: Vec<FormatDescriptor>,
    /// Number of leading non-empty values inspected by format detection.
    pub sample_size: usize,
    pub detection_threshold: f64,
    pub acceptance_threshold: f64,
    /// Strip the trailing word of the road name column when the survey uses
    /// ISO-8601 timestamps.
    pub strip_road_name_on_iso: bool,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        TimestampConfig {
            formats: timestamp::default_formats(),
            sample_size: 100,
            detection_threshold: 0.8,
            acceptance_threshold: 0.5,
            strip_road_name_on_iso: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub chunk_size: usize,
    pub memory_multiplier: f64,
    pub hybrid_ratio: f64,
    pub streaming_ratio: f64,
    pub large_file_threshold: u64,
    pub cancel_check_rows: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        ProcessingConfig {
            chunk_size: 100_000,
            memory_multiplier: 2.5,
            hybrid_ratio: 0.6,
            streaming_ratio: 0.8,
            large_file_threshold: 20 * GIB,
            cancel_check_rows: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LineEnding {
    #[default]
    Crlf,
    Lf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quoting {
    #[default]
    Necessary,
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub line_ending: LineEnding,
    pub quoting: Quoting,
    pub backups: bool,
    pub backup_retention: usize,
    pub lock_timeout_secs: u64,
    pub lock_poll_millis: u64,
    pub suffixes: OutputSuffixes,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            line_ending: LineEnding::Crlf,
            quoting: Quoting::Necessary,
            backups: true,
            backup_retention: 3,
            lock_timeout_secs: 30,
            lock_poll_millis: 100,
            suffixes: OutputSuffixes::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSuffixes {
    pub lane_fix: String,
    pub workbrief: String,
    pub feedback: String,
    pub filter: String,
}

impl Default for OutputSuffixes {
    fn default() -> Self {
        OutputSuffixes {
            lane_fix: "lane_fixed".to_string(),
            workbrief: "workbrief".to_string(),
            feedback: "feedback".to_string(),
            filter: "filtered".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdRule {
    pub column: String,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatioRule {
    pub numerator: String,
    pub denominator: String,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubstringRule {
    pub column: String,
    pub needle: String,
}

/// Columns and thresholds used by the record filter. Any rule may be omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub dedupe_column: Option<String>,
    pub empty_pair: Option<[String; 2]>,
    pub min_value: Option<ThresholdRule>,
    pub ratio: Option<RatioRule>,
    pub substring: Option<SubstringRule>,
    pub boolean_true: Option<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            dedupe_column: Some(columns::canonical::TEST_DATE_UTC.to_string()),
            empty_pair: Some(["RawSlope170".to_string(), "RawSlope270".to_string()]),
            min_value: Some(ThresholdRule {
                column: "TrailingFactor".to_string(),
                threshold: 0.15,
            }),
            ratio: Some(RatioRule {
                numerator: "tsdSlopeMinY".to_string(),
                denominator: "tsdSlopeMaxY".to_string(),
                threshold: 0.15,
            }),
            substring: Some(SubstringRule {
                column: columns::canonical::LANE.to_string(),
                needle: "SK".to_string(),
            }),
            boolean_true: Some(columns::canonical::IGNORE.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContainmentRole {
    /// Reference columns copied onto matched rows. Empty means every
    /// reference column that is not a matching key.
    pub payload_columns: Vec<String>,
    /// Optional `True`/`False` column recording whether a row matched.
    pub flag_column: Option<String>,
    /// Factor applied to reference chainage values before matching.
    pub chainage_scale: f64,
}

impl Default for ContainmentRole {
    fn default() -> Self {
        ContainmentRole {
            payload_columns: Vec::new(),
            flag_column: None,
            chainage_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainmentConfig {
    pub workbrief: ContainmentRole,
    pub feedback: ContainmentRole,
}

impl Default for ContainmentConfig {
    fn default() -> Self {
        ContainmentConfig {
            workbrief: ContainmentRole {
                flag_column: Some("InWorkbrief".to_string()),
                ..ContainmentRole::default()
            },
            feedback: ContainmentRole::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolygonConfig {
    /// Leading polygon rows whose WKT must parse before a run starts.
    pub validate_rows: usize,
    pub full_validate: bool,
}

impl Default for PolygonConfig {
    fn default() -> Self {
        PolygonConfig {
            validate_rows: 10,
            full_validate: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().expect("defaults validate");
    }

    #[test]
    fn save_and_load_round_trips_overrides() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("survey.yml");
        let mut config = Config::default();
        config.processing.chunk_size = 5;
        config.output.backup_retention = 7;
        config.save(&path).expect("save config");

        let loaded = Config::load(&path).expect("load config");
        assert_eq!(loaded.processing.chunk_size, 5);
        assert_eq!(loaded.output.backup_retention, 7);
        assert_eq!(loaded.timestamps.formats.len(), config.timestamps.formats.len());
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("partial.yml");
        std::fs::write(&path, "processing:\n  chunk_size: 42\n").expect("write yaml");
        let loaded = Config::load(&path).expect("load config");
        assert_eq!(loaded.processing.chunk_size, 42);
        assert_eq!(loaded.processing.memory_multiplier, 2.5);
        assert!(!loaded.columns.aliases.is_empty());
    }

    #[test]
    fn rejects_inverted_memory_ratios() {
        let mut config = Config::default();
        config.processing.hybrid_ratio = 0.9;
        config.processing.streaming_ratio = 0.7;
        let err = config.validate().expect_err("inverted ratios rejected");
        assert!(err.to_string().contains("hybrid_ratio"));
    }

    #[test]
    fn rejects_broken_timestamp_regex() {
        let mut config = Config::default();
        config.timestamps.formats[0].regex = "([".to_string();
        let err = config.validate().expect_err("bad regex rejected");
        assert!(err.to_string().contains("invalid regex"));
    }
}
