//! Chunked file processing.
//!
//! [`ChunkedFileProcessor`] owns the run loop shared by every file operation:
//! strategy selection, resource checks, reference loading, chunk iteration
//! with cancellation and progress, boolean rendering, the row-count check
//! and the output commit.
//!
//! Under the streaming strategy the reference entries are spilled to an
//! [`IndexWriter`] one chunk at a time while the reference is read, so the
//! raw reference rows and the growing entry list are never held together;
//! the compact entries are reloaded once, just before the primary pass.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use log::{debug, info, warn};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    columns::ColumnResolver,
    config::Config,
    error::{SurveyError, display_name},
    frame::{BooleanColumns, Chunk, ChunkReader, Table},
    index::IndexWriter,
    interval::{RowCountCheck, preserve_input_row_count},
    io_utils,
    output::PendingOutput,
    progress::{CancellationToken, ProgressSink, percent},
    strategy::{self, ProcessingStrategy},
};

/// Per-run overrides collected from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub strategy: Option<ProcessingStrategy>,
    pub chunk_size: Option<usize>,
    /// `false` disables backups even when the configuration enables them.
    pub backups: bool,
    pub standardize_headers: bool,
    pub encoding: Option<&'static Encoding>,
}

impl RunOptions {
    pub fn new() -> Self {
        RunOptions {
            backups: true,
            ..RunOptions::default()
        }
    }
}

/// Row-level work applied to each chunk of the primary file.
pub trait ChunkTransform {
    /// Validates the primary headers and returns the output headers.
    fn bind(&mut self, file: &Path, headers: &[String]) -> Result<Vec<String>>;

    /// Rewrites `chunk` in place. On return its headers must equal the
    /// output headers returned by [`bind`](Self::bind).
    fn transform(&mut self, chunk: &mut Table) -> Result<()>;

    /// Whether every input row must appear in the output.
    fn preserves_rows(&self) -> bool {
        true
    }

    /// Called once after the last chunk, before the output is committed.
    /// An error here discards the output.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> Vec<(String, String)>;
}

/// A transform that first needs a lookup structure built from a reference
/// file.
pub trait ReferenceJoin: ChunkTransform {
    /// Compact form of one reference row; this is what gets persisted.
    type Entry: Serialize + DeserializeOwned;

    fn bind_reference(&mut self, file: &Path, headers: &[String]) -> Result<()>;

    fn extract_reference(&mut self, chunk: &Table) -> Result<Vec<Self::Entry>>;

    /// Called once after the last reference chunk.
    fn finish_reference(&mut self) -> Result<()> {
        Ok(())
    }

    fn install_index(&mut self, entries: Vec<Self::Entry>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub operation: String,
    pub strategy: ProcessingStrategy,
    pub input_rows: usize,
    pub output_rows: usize,
    pub chunks: usize,
    pub skipped_chunks: usize,
    pub skipped_rows: usize,
    pub truncated_rows: usize,
    pub reference_entries: Option<usize>,
    pub output: PathBuf,
    pub backup: Option<PathBuf>,
    pub stats: Vec<(String, String)>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn rows(&self) -> Vec<(String, String)> {
        let mut rows = vec![
            ("operation".to_string(), self.operation.clone()),
            ("strategy".to_string(), self.strategy.to_string()),
            ("input rows".to_string(), self.input_rows.to_string()),
            ("output rows".to_string(), self.output_rows.to_string()),
            ("chunks".to_string(), self.chunks.to_string()),
        ];
        if let Some(entries) = self.reference_entries {
            rows.push(("reference entries".to_string(), entries.to_string()));
        }
        if self.skipped_chunks > 0 {
            rows.push(("skipped chunks".to_string(), self.skipped_chunks.to_string()));
            rows.push(("skipped rows".to_string(), self.skipped_rows.to_string()));
        }
        if self.truncated_rows > 0 {
            rows.push(("truncated rows".to_string(), self.truncated_rows.to_string()));
        }
        rows.extend(self.stats.iter().cloned());
        rows.push(("output".to_string(), display_name(&self.output)));
        if let Some(backup) = &self.backup {
            rows.push(("backup".to_string(), display_name(backup)));
        }
        rows.push((
            "elapsed".to_string(),
            format!("{:.2}s", self.elapsed.as_secs_f64()),
        ));
        rows
    }
}

#[derive(Debug, Default)]
struct PumpCounts {
    output_rows: usize,
    chunks: usize,
    skipped_chunks: usize,
    skipped_rows: usize,
    truncated_rows: usize,
}

pub struct ChunkedFileProcessor<'a> {
    config: &'a Config,
    progress: &'a dyn ProgressSink,
    cancel: CancellationToken,
}

impl<'a> ChunkedFileProcessor<'a> {
    pub fn new(config: &'a Config, progress: &'a dyn ProgressSink, cancel: CancellationToken) -> Self {
        ChunkedFileProcessor {
            config,
            progress,
            cancel,
        }
    }

    fn chunk_size(&self, options: &RunOptions) -> usize {
        options
            .chunk_size
            .unwrap_or(self.config.processing.chunk_size)
            .max(1)
    }

    /// Applies `transform` to `input` and commits the result to `output`.
    pub fn run<T: ChunkTransform>(
        &self,
        operation: &str,
        transform: &mut T,
        input: &Path,
        output: &Path,
        options: &RunOptions,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let (strategy, _) = strategy::plan(&[input], options.strategy, &self.config.processing)?;
        let mut summary = self.process_primary(operation, strategy, transform, input, output, options)?;
        summary.elapsed = started.elapsed();
        Ok(summary)
    }

    /// Loads `reference` into `join`, then applies it to `primary`.
    pub fn run_join<J: ReferenceJoin>(
        &self,
        operation: &str,
        join: &mut J,
        primary: &Path,
        reference: &Path,
        output: &Path,
        options: &RunOptions,
    ) -> Result<RunSummary> {
        let started = Instant::now();
        let (strategy, estimate) =
            strategy::plan(&[primary, reference], options.strategy, &self.config.processing)?;
        if strategy == ProcessingStrategy::StreamingIndexed {
            let reference_bytes = strategy::file_sizes(&[reference])?[0];
            strategy::ensure_reference_fits(
                reference_bytes,
                estimate.available,
                &self.config.processing,
            )?;
        }

        let entries = if strategy == ProcessingStrategy::StreamingIndexed {
            let mut spill = IndexWriter::create(output.parent().filter(|p| p.is_dir()))?;
            self.load_reference(join, reference, options, |batch| spill.append(&batch))?;
            let index = spill.finish()?;
            self.cancel.check()?;
            index.load()?
        } else {
            let mut entries = Vec::new();
            self.load_reference(join, reference, options, |batch| {
                entries.extend(batch);
                Ok(())
            })?;
            entries
        };
        let count = entries.len();
        if count == 0 {
            warn!(
                "Reference file '{}' produced no usable entries; every row will be unmatched",
                display_name(reference)
            );
        }
        join.install_index(entries)?;

        let mut summary = self.process_primary(operation, strategy, join, primary, output, options)?;
        summary.reference_entries = Some(count);
        summary.elapsed = started.elapsed();
        Ok(summary)
    }

    /// Reads `reference` chunk by chunk, handing each chunk's entries to
    /// `sink`. Returns the number of entries produced.
    fn load_reference<J, F>(
        &self,
        join: &mut J,
        reference: &Path,
        options: &RunOptions,
        mut sink: F,
    ) -> Result<usize>
    where
        J: ReferenceJoin,
        F: FnMut(Vec<J::Entry>) -> Result<()>,
    {
        self.progress.report(
            &format!("Loading reference '{}'", display_name(reference)),
            None,
        );
        let encoding = io_utils::sniff_encoding(reference, options.encoding)?;
        let mut reader = ChunkReader::open(reference, encoding, self.chunk_size(options))?;
        join.bind_reference(reference, reader.headers())?;
        let mut entries = 0usize;
        for chunk in reader.by_ref() {
            self.cancel.check()?;
            match chunk? {
                Chunk::Rows { table, .. } => {
                    let batch = join.extract_reference(&table)?;
                    entries += batch.len();
                    sink(batch)?;
                }
                Chunk::Malformed {
                    first_row,
                    rows,
                    error,
                } => warn!(
                    "Skipping {rows} malformed reference row(s) from row {} of '{}': {error}",
                    first_row + 1,
                    display_name(reference)
                ),
            }
        }
        join.finish_reference()?;
        debug!(
            "Read {} reference rows into {entries} entries",
            reader.rows_read()
        );
        Ok(entries)
    }

    fn process_primary<T: ChunkTransform>(
        &self,
        operation: &str,
        strategy: ProcessingStrategy,
        transform: &mut T,
        input: &Path,
        output: &Path,
        options: &RunOptions,
    ) -> Result<RunSummary> {
        let input_bytes = strategy::file_sizes(&[input])?[0];
        strategy::ensure_disk_space(output, input_bytes)?;

        let encoding = io_utils::sniff_encoding(input, options.encoding)?;
        let total = io_utils::count_records(
            input,
            encoding,
            &self.cancel,
            self.config.processing.cancel_check_rows,
        )?;
        let chunk_size = if strategy.is_chunked() {
            self.chunk_size(options)
        } else {
            total.max(1)
        };
        let mut reader = ChunkReader::open(input, encoding, chunk_size)?;
        let headers = transform.bind(input, reader.headers())?;
        let written_headers = if options.standardize_headers {
            ColumnResolver::new(&self.config.columns).standardize(&headers)
        } else {
            headers.clone()
        };

        let pending = PendingOutput::begin(output, &self.config.output, options.backups)?;
        let outcome = {
            let mut writer = pending.csv_writer()?;
            writer
                .write_record(&written_headers)
                .context("Writing output header")?;
            let counts = self.pump(&mut reader, total, chunk_size, &headers, transform, &mut writer);
            let flushed = writer.flush().context("Flushing output");
            counts.and_then(|counts| flushed.map(|_| counts))
        };

        let counts = match outcome {
            Ok(counts) => counts,
            Err(err) => {
                let cancelled = err
                    .downcast_ref::<SurveyError>()
                    .is_some_and(SurveyError::is_cancelled);
                if cancelled {
                    pending.keep_partial()?;
                }
                return Err(err);
            }
        };
        transform.finish()?;
        let committed = pending.commit()?;
        info!(
            "{operation}: wrote {} row(s) to '{}'",
            counts.output_rows,
            display_name(&committed.path)
        );
        Ok(RunSummary {
            operation: operation.to_string(),
            strategy,
            input_rows: total,
            output_rows: counts.output_rows,
            chunks: counts.chunks,
            skipped_chunks: counts.skipped_chunks,
            skipped_rows: counts.skipped_rows,
            truncated_rows: counts.truncated_rows,
            reference_entries: None,
            output: committed.path,
            backup: committed.backup,
            stats: transform.stats(),
            elapsed: Duration::ZERO,
        })
    }

    fn pump<T: ChunkTransform, W: std::io::Write>(
        &self,
        reader: &mut ChunkReader,
        total: usize,
        chunk_size: usize,
        headers: &[String],
        transform: &mut T,
        writer: &mut csv::Writer<W>,
    ) -> Result<PumpCounts> {
        let expected_chunks = total.div_ceil(chunk_size).max(1);
        let mut counts = PumpCounts::default();
        let mut booleans = BooleanColumns::new();
        while let Some(chunk) = reader.next() {
            self.cancel.check()?;
            counts.chunks += 1;
            match chunk? {
                Chunk::Rows {
                    first_row,
                    mut table,
                } => {
                    let expected = table.len();
                    transform.transform(&mut table).with_context(|| {
                        format!("Processing rows {}..{}", first_row + 1, first_row + expected)
                    })?;
                    if table.headers() != headers {
                        return Err(anyhow::anyhow!(
                            "Chunk headers diverged from the output headers"
                        ));
                    }
                    if transform.preserves_rows() {
                        if let RowCountCheck::Truncated { extra } =
                            preserve_input_row_count(expected, table.rows_mut())?
                        {
                            counts.truncated_rows += extra;
                        }
                    }
                    booleans.render(&mut table);
                    table.write_rows(writer)?;
                    counts.output_rows += table.len();
                }
                Chunk::Malformed {
                    first_row,
                    rows,
                    error,
                } => {
                    warn!(
                        "Skipping chunk of {rows} row(s) starting at row {}: {error}",
                        first_row + 1
                    );
                    counts.skipped_chunks += 1;
                    counts.skipped_rows += rows;
                }
            }
            self.progress.report(
                &format!("Chunk {}/{}", counts.chunks, expected_chunks),
                percent(reader.rows_read(), total),
            );
        }
        Ok(counts)
    }
}
