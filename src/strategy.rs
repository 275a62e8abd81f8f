//! Processing strategy selection and resource pre-flight checks.
//!
//! Memory use of a run is predicted as `input bytes × multiplier`. Nothing
//! here can stop an allocation failure mid-run; the checks only refuse work
//! that is predicted not to fit.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

use crate::{
    config::ProcessingConfig,
    error::{SurveyError, display_name},
};

/// Headroom added to the input size when checking free disk space.
const DISK_HEADROOM: f64 = 1.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStrategy {
    /// Both tables fully loaded; one pass.
    InMemory,
    /// Reference table in memory; primary read in chunks.
    Hybrid,
    /// Compact reference index persisted to a temporary file and reloaded;
    /// primary read in chunks.
    StreamingIndexed,
}

impl ProcessingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStrategy::InMemory => "in-memory",
            ProcessingStrategy::Hybrid => "hybrid",
            ProcessingStrategy::StreamingIndexed => "streaming",
        }
    }

    pub fn is_chunked(self) -> bool {
        !matches!(self, ProcessingStrategy::InMemory)
    }
}

impl fmt::Display for ProcessingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sizes and memory figures a strategy decision was made from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryEstimate {
    pub input_bytes: u64,
    pub largest_file: u64,
    pub required: u64,
    pub available: u64,
}

impl MemoryEstimate {
    pub fn new(file_sizes: &[u64], available: u64, config: &ProcessingConfig) -> Self {
        let input_bytes: u64 = file_sizes.iter().sum();
        MemoryEstimate {
            input_bytes,
            largest_file: file_sizes.iter().copied().max().unwrap_or(0),
            required: scaled(input_bytes, config.memory_multiplier),
            available,
        }
    }
}

fn scaled(bytes: u64, factor: f64) -> u64 {
    (bytes as f64 * factor).ceil() as u64
}

/// Chooses a strategy from the predicted memory requirement.
///
/// Any single file above the large-file threshold forces streaming. So does
/// an unknown (zero) amount of available memory.
pub fn select_strategy(estimate: &MemoryEstimate, config: &ProcessingConfig) -> ProcessingStrategy {
    if estimate.largest_file > config.large_file_threshold || estimate.available == 0 {
        return ProcessingStrategy::StreamingIndexed;
    }
    let required = estimate.required as f64;
    let available = estimate.available as f64;
    if required > available * config.streaming_ratio {
        ProcessingStrategy::StreamingIndexed
    } else if required > available * config.hybrid_ratio {
        ProcessingStrategy::Hybrid
    } else {
        ProcessingStrategy::InMemory
    }
}

pub fn file_sizes(paths: &[&Path]) -> Result<Vec<u64>> {
    paths
        .iter()
        .map(|path| {
            std::fs::metadata(path)
                .map(|meta| meta.len())
                .with_context(|| format!("Reading size of {path:?}"))
        })
        .collect()
}

pub fn available_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    let available = system.available_memory();
    debug!(
        "Memory: {} bytes available of {} total",
        available,
        system.total_memory()
    );
    available
}

/// Free space on the disk holding `path`, or `None` when no mounted disk
/// contains it.
pub fn available_disk_space(path: &Path) -> Option<u64> {
    let directory = existing_ancestor(path)?;
    let directory = directory.canonicalize().unwrap_or(directory);
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| directory.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    loop {
        if current.is_dir() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Refuses to start when the destination disk cannot hold an output about
/// the size of the input plus headroom. An undeterminable disk is let
/// through with a warning.
pub fn ensure_disk_space(target: &Path, input_bytes: u64) -> Result<(), SurveyError> {
    let required = scaled(input_bytes, DISK_HEADROOM);
    match available_disk_space(target) {
        Some(available) if available < required => Err(SurveyError::InsufficientDisk {
            file: display_name(target),
            required,
            available,
        }),
        Some(_) => Ok(()),
        None => {
            warn!(
                "Could not determine free disk space for '{}'; continuing",
                display_name(target)
            );
            Ok(())
        }
    }
}

/// The reference index is always held in memory, even when streaming.
pub fn ensure_reference_fits(
    reference_bytes: u64,
    available: u64,
    config: &ProcessingConfig,
) -> Result<(), SurveyError> {
    if available == 0 {
        return Ok(());
    }
    let required = scaled(reference_bytes, config.memory_multiplier);
    let budget = (available as f64 * config.streaming_ratio) as u64;
    if required > budget {
        return Err(SurveyError::MemoryRisk {
            required,
            available,
        });
    }
    Ok(())
}

/// Resolves the strategy for a run, honouring an explicit override.
pub fn plan(
    paths: &[&Path],
    requested: Option<ProcessingStrategy>,
    config: &ProcessingConfig,
) -> Result<(ProcessingStrategy, MemoryEstimate)> {
    let sizes = file_sizes(paths)?;
    let estimate = MemoryEstimate::new(&sizes, available_memory(), config);
    let strategy = match requested {
        Some(strategy) => strategy,
        None => select_strategy(&estimate, config),
    };
    info!(
        "Using {} strategy ({} input bytes, ~{} bytes predicted, {} available)",
        strategy, estimate.input_bytes, estimate.required, estimate.available
    );
    Ok((strategy, estimate))
}
