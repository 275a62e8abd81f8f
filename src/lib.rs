pub mod attempt;
pub mod chunked;
pub mod cli;
pub mod columns;
pub mod config;
pub mod containment;
pub mod error;
pub mod filter;
pub mod frame;
pub mod index;
pub mod interval;
pub mod io_utils;
pub mod lane_fix;
pub mod output;
pub mod polygon;
pub mod progress;
pub mod strategy;
pub mod table;
pub mod timestamp;
pub mod wkt;
pub mod yaml_provider;

use std::{
    env,
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use itertools::Itertools;
use log::{LevelFilter, debug, info};

use crate::{
    chunked::{ChunkedFileProcessor, RunOptions, RunSummary},
    cli::{Cli, CommonArgs, Commands},
    columns::{ColumnResolver, FileKind},
    config::Config,
    containment::{ContainmentJoin, ContainmentKind},
    error::{SurveyError, ValidationKind, display_name},
    filter::RecordFilter,
    lane_fix::LaneFixJoin,
    progress::{LogProgress, Worker},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<()> {
    let mut failure = None;
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            let level = match verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            };
            builder.filter_module("survey_merge", level);
        }
        if let Some(path) = log_file {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(err) => {
                    failure = Some(
                        anyhow::Error::new(err).context(format!("Opening log file {path:?}")),
                    );
                }
            }
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref())?;
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    debug!("Configuration: {config:?}");

    match cli.command {
        Commands::Detect(args) => {
            let encoding = io_utils::resolve_encoding(args.input_encoding.as_deref())?;
            handle_detect(&config, &args.inputs, encoding)
        }
        Commands::InitConfig(args) => handle_init_config(&config, &args.output, args.force),
        Commands::Filter(args) => {
            let output = resolve_output(&args.output, &args.input, &config.output.suffixes.filter);
            let options = run_options(&args.common)?;
            let summary = on_worker("filter", config, move |config, token| {
                let mut filter = RecordFilter::new(&config.filter);
                ChunkedFileProcessor::new(config, &LogProgress, token).run(
                    "filter",
                    &mut filter,
                    &args.input,
                    &output,
                    &options,
                )
            })?;
            report(&summary);
            Ok(())
        }
        Commands::LaneFix(args) => {
            let output =
                resolve_output(&args.output, &args.survey, &config.output.suffixes.lane_fix);
            let options = run_options(&args.common)?;
            let summary = on_worker("lane-fix", config, move |config, token| {
                let mut join = LaneFixJoin::new(config)?;
                ChunkedFileProcessor::new(config, &LogProgress, token).run_join(
                    "lane-fix",
                    &mut join,
                    &args.survey,
                    &args.fixes,
                    &output,
                    &options,
                )
            })?;
            report(&summary);
            Ok(())
        }
        Commands::Workbrief(args) => {
            let suffix = config.output.suffixes.workbrief.clone();
            run_containment(
                config,
                ContainmentKind::Workbrief,
                args.survey,
                args.workbrief,
                args.output,
                &suffix,
                &args.common,
            )
        }
        Commands::Feedback(args) => {
            let suffix = config.output.suffixes.feedback.clone();
            run_containment(
                config,
                ContainmentKind::Feedback,
                args.survey,
                args.feedback,
                args.output,
                &suffix,
                &args.common,
            )
        }
        Commands::Polygon(args) => {
            let mut config = config;
            config.polygons.full_validate |= args.full_validate;
            let options = run_options(&args.common)?;
            let summary = on_worker("polygon", config, move |config, token| {
                polygon::run_polygon(
                    config,
                    &args.polygons,
                    &args.input,
                    &args.output_dir,
                    &options,
                    &LogProgress,
                    token,
                )
            })?;
            let rows = summary.rows();
            log_rows(&rows);
            table::print_summary("polygon", &rows);
            Ok(())
        }
    }
}

fn run_options(common: &CommonArgs) -> Result<RunOptions> {
    Ok(RunOptions {
        strategy: common.strategy.to_strategy(),
        chunk_size: common.chunk_size,
        backups: !common.no_backup,
        standardize_headers: common.standardize_headers,
        encoding: io_utils::resolve_encoding(common.input_encoding.as_deref())?,
    })
}

fn resolve_output(explicit: &Option<PathBuf>, input: &Path, suffix: &str) -> PathBuf {
    explicit.clone().unwrap_or_else(|| {
        output::derived_output_path(input, None, suffix, Local::now().date_naive())
    })
}

/// Runs `job` on a named worker thread with its own copy of the config.
fn on_worker<T, F>(name: &str, config: Config, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Config, progress::CancellationToken) -> Result<T> + Send + 'static,
{
    let worker = Worker::spawn(name, move |token| job(&config, token))?;
    worker.join()
}

fn run_containment(
    config: Config,
    kind: ContainmentKind,
    survey: PathBuf,
    reference: PathBuf,
    output: Option<PathBuf>,
    suffix: &str,
    common: &CommonArgs,
) -> Result<()> {
    let output = resolve_output(&output, &survey, suffix);
    let options = run_options(common)?;
    let summary = on_worker(kind.as_str(), config, move |config, token| {
        let mut join = ContainmentJoin::new(config, kind);
        ChunkedFileProcessor::new(config, &LogProgress, token).run_join(
            kind.as_str(),
            &mut join,
            &survey,
            &reference,
            &output,
            &options,
        )
    })?;
    report(&summary);
    Ok(())
}

fn log_rows(rows: &[(String, String)]) {
    for (key, value) in rows {
        info!("{key}: {value}");
    }
}

fn report(summary: &RunSummary) {
    let rows = summary.rows();
    log_rows(&rows);
    table::print_summary(&summary.operation, &rows);
}

fn handle_detect(
    config: &Config,
    inputs: &[PathBuf],
    encoding: Option<&'static encoding_rs::Encoding>,
) -> Result<()> {
    let resolver = ColumnResolver::new(&config.columns);
    let headers = vec![
        "file".to_string(),
        "kind".to_string(),
        "also matches".to_string(),
        "missing".to_string(),
    ];
    let mut rows = Vec::with_capacity(inputs.len());
    for input in inputs {
        let encoding = io_utils::sniff_encoding(input, encoding)?;
        let columns = io_utils::read_headers(input, encoding)?;
        let kind = resolver.detect_kind(&columns);
        let others = resolver
            .matching_kinds(&columns)
            .into_iter()
            .filter(|other| *other != kind)
            .map(FileKind::as_str)
            .join(", ");
        let missing = closest_signature_gap(config, &resolver, &columns, kind);
        info!(
            "'{}' detected as {kind} ({} column(s))",
            display_name(input),
            columns.len()
        );
        rows.push(vec![
            display_name(input),
            kind.to_string(),
            if others.is_empty() { "-".to_string() } else { others },
            if missing.is_empty() { "-".to_string() } else { missing.join(", ") },
        ]);
    }
    table::print_table(&headers, &rows);
    Ok(())
}

/// Missing canonical columns of the detected kind, or of the nearest kind
/// when nothing matched.
fn closest_signature_gap(
    config: &Config,
    resolver: &ColumnResolver<'_>,
    columns: &[String],
    kind: FileKind,
) -> Vec<String> {
    config
        .columns
        .signatures
        .iter()
        .filter(|signature| kind == FileKind::Unknown || signature.kind == kind)
        .map(|signature| {
            let required = signature.required.iter().map(String::as_str).collect::<Vec<_>>();
            resolver.validate_required(columns, &required).missing
        })
        .min_by_key(Vec::len)
        .unwrap_or_default()
}

fn handle_init_config(config: &Config, output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(SurveyError::validation(
            ValidationKind::InvalidConfig,
            format!(
                "'{}' already exists; pass --force to overwrite it",
                display_name(output)
            ),
        ))
        .with_context(|| format!("Writing configuration to {output:?}"));
    }
    config.save(output)?;
    info!("Configuration written to {output:?}");
    println!("Configuration written to {}", output.display());
    Ok(())
}
