use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::strategy::ProcessingStrategy;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Clean, correct and merge road-survey CSV files",
    long_about = None
)]
pub struct Cli {
    /// YAML configuration file (defaults are used when omitted)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Write the full diagnostic log to this file instead of stderr
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Report the detected role and missing columns of one or more files
    Detect(DetectArgs),
    /// Remove low-quality rows from a survey export
    Filter(FilterArgs),
    /// Correct survey lanes from a lane-fix time-range table
    LaneFix(LaneFixArgs),
    /// Mark survey rows that fall inside a workbrief chainage range
    Workbrief(WorkbriefArgs),
    /// Attach client feedback to survey rows by chainage range
    Feedback(FeedbackArgs),
    /// Split survey rows by the polygon containing their coordinates
    Polygon(PolygonArgs),
    /// Write the default configuration to a YAML file
    InitConfig(InitConfigArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default)]
pub enum StrategyChoice {
    /// Decide from file sizes and available memory
    #[default]
    Auto,
    InMemory,
    Hybrid,
    Streaming,
}

impl StrategyChoice {
    pub fn to_strategy(self) -> Option<ProcessingStrategy> {
        match self {
            StrategyChoice::Auto => None,
            StrategyChoice::InMemory => Some(ProcessingStrategy::InMemory),
            StrategyChoice::Hybrid => Some(ProcessingStrategy::Hybrid),
            StrategyChoice::Streaming => Some(ProcessingStrategy::StreamingIndexed),
        }
    }
}

/// Options shared by every processing command.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Processing strategy override
    #[arg(long, value_enum, default_value = "auto")]
    pub strategy: StrategyChoice,
    /// Rows per chunk for chunked strategies
    #[arg(long = "chunk-size")]
    pub chunk_size: Option<usize>,
    /// Do not back up an existing output file before replacing it
    #[arg(long = "no-backup")]
    pub no_backup: bool,
    /// Rename written headers to their canonical spelling
    #[arg(long = "standardize-headers")]
    pub standardize_headers: bool,
    /// Character encoding of the input files (detected when omitted)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct DetectArgs {
    /// Files to inspect
    #[arg(short = 'i', long = "input", required = true, num_args = 1..)]
    pub inputs: Vec<PathBuf>,
    /// Character encoding of the input files (detected when omitted)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct FilterArgs {
    /// Survey export to filter
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Output file (derived from the input name when omitted)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Args)]
pub struct LaneFixArgs {
    /// Combined survey file
    #[arg(long)]
    pub survey: PathBuf,
    /// Lane-fix file with From/To time ranges
    #[arg(long)]
    pub fixes: PathBuf,
    /// Output file (derived from the survey name when omitted)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Args)]
pub struct WorkbriefArgs {
    /// Combined survey file
    #[arg(long)]
    pub survey: PathBuf,
    /// Workbrief file with chainage ranges
    #[arg(long)]
    pub workbrief: PathBuf,
    /// Output file (derived from the survey name when omitted)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Args)]
pub struct FeedbackArgs {
    /// Combined survey file
    #[arg(long)]
    pub survey: PathBuf,
    /// Client feedback file with chainage ranges
    #[arg(long)]
    pub feedback: PathBuf,
    /// Output file (derived from the survey name when omitted)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Args)]
pub struct PolygonArgs {
    /// Polygon file with a WKT column
    #[arg(long)]
    pub polygons: PathBuf,
    /// Survey file, or a folder of survey files
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Directory receiving the per-polygon files
    #[arg(long = "output-dir")]
    pub output_dir: PathBuf,
    /// Validate the WKT of every polygon row, not just the leading rows
    #[arg(long = "full-validate")]
    pub full_validate: bool,
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Debug, Args)]
pub struct InitConfigArgs {
    /// Destination YAML file
    #[arg(short = 'o', long = "output")]
    pub output: PathBuf,
    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}
