//! Output commit protocol.
//!
//! An output file is never written in place. A run:
//!
//! 1. takes an exclusive `<output>.lock` file, waiting up to the configured
//!    timeout for another holder to let go;
//! 2. writes into a temporary file in the destination directory;
//! 3. on success, copies any existing output to
//!    `<stem>_backup_<YYYYMMDD_HHMMSS>.csv`, prunes old backups and renames
//!    the temporary file over the target;
//! 4. on cancellation, keeps what was written as `<output>.partial`;
//! 5. on failure, drops the temporary file.
//!
//! The lock is released in every case.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use log::{debug, info, warn};
use tempfile::NamedTempFile;

use crate::{
    config::OutputConfig,
    error::{SurveyError, display_name},
    io_utils,
};

const BACKUP_MARKER: &str = "_backup_";

/// `<stem>_<suffix>_<YYYYMMDD>.csv` next to `input`, or inside `output_dir`.
pub fn derived_output_path(
    input: &Path,
    output_dir: Option<&Path>,
    suffix: &str,
    date: NaiveDate,
) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = format!("{stem}_{suffix}_{}.csv", date.format("%Y%m%d"));
    let dir = output_dir
        .map(Path::to_path_buf)
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    dir.join(name)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

pub fn partial_path(target: &Path) -> PathBuf {
    sibling_with_suffix(target, ".partial")
}

/// Exclusive lock on an output path, held as a `<output>.lock` file.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(target: &Path, timeout: Duration, poll: Duration) -> Result<Self> {
        let path = sibling_with_suffix(target, ".lock");
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    debug!("Acquired lock {path:?}");
                    return Ok(FileLock { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(SurveyError::LockTimeout {
                            file: display_name(target),
                            waited,
                        }
                        .into());
                    }
                    thread::sleep(poll.min(timeout - waited));
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("Creating lock file {path:?}"));
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!("Could not remove lock file {:?}: {err}", self.path);
        }
    }
}

/// Result of committing an output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub path: PathBuf,
    pub backup: Option<PathBuf>,
}

/// An output being written. Dropping it without [`commit`](Self::commit) or
/// [`keep_partial`](Self::keep_partial) discards the data.
pub struct PendingOutput {
    target: PathBuf,
    temp: NamedTempFile,
    config: OutputConfig,
    backups: bool,
    _lock: FileLock,
}

impl PendingOutput {
    pub fn begin(target: &Path, config: &OutputConfig, backups: bool) -> Result<Self> {
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Creating output directory {dir:?}"))?;
        let lock = FileLock::acquire(
            target,
            Duration::from_secs(config.lock_timeout_secs),
            Duration::from_millis(config.lock_poll_millis.max(1)),
        )?;
        let temp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("Creating temporary output in {dir:?}"))?;
        Ok(PendingOutput {
            target: target.to_path_buf(),
            temp,
            config: config.clone(),
            backups: backups && config.backups,
            _lock: lock,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// CSV writer over the temporary file.
    pub fn csv_writer(&self) -> Result<csv::Writer<BufWriter<File>>> {
        let handle = self
            .temp
            .as_file()
            .try_clone()
            .context("Opening temporary output")?;
        Ok(io_utils::open_csv_writer(BufWriter::new(handle), &self.config))
    }

    pub fn commit(self) -> Result<Committed> {
        self.temp
            .as_file()
            .sync_all()
            .context("Flushing temporary output")?;
        let backup = if self.backups && self.target.exists() {
            let backup = backup_path(&self.target, Local::now().naive_local());
            std::fs::copy(&self.target, &backup)
                .with_context(|| format!("Backing up {:?}", self.target))?;
            info!("Backed up existing output to '{}'", display_name(&backup));
            prune_backups(&self.target, self.config.backup_retention)?;
            Some(backup)
        } else {
            None
        };
        self.temp
            .persist(&self.target)
            .map_err(|err| err.error)
            .with_context(|| format!("Replacing {:?}", self.target))?;
        Ok(Committed {
            path: self.target,
            backup,
        })
    }

    /// Keeps the rows written so far as `<output>.partial`. The target
    /// itself is never touched.
    pub fn keep_partial(self) -> Result<PathBuf> {
        let partial = partial_path(&self.target);
        self.temp
            .persist(&partial)
            .map_err(|err| err.error)
            .with_context(|| format!("Saving partial output {partial:?}"))?;
        warn!("Partial output kept at '{}'", display_name(&partial));
        Ok(partial)
    }
}

fn backup_prefix(target: &Path) -> String {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{stem}{BACKUP_MARKER}")
}

/// `<stem>_backup_<YYYYMMDD_HHMMSS>.csv`, with a counter when two backups
/// land in the same second.
pub fn backup_path(target: &Path, now: chrono::NaiveDateTime) -> PathBuf {
    let base = format!("{}{}", backup_prefix(target), now.format("%Y%m%d_%H%M%S"));
    let mut candidate = target.with_file_name(format!("{base}.csv"));
    let mut counter = 1;
    while candidate.exists() {
        candidate = target.with_file_name(format!("{base}_{counter}.csv"));
        counter += 1;
    }
    candidate
}

/// Deletes all but the newest `retention` backups of `target`.
pub fn prune_backups(target: &Path, retention: usize) -> Result<Vec<PathBuf>> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = backup_prefix(target);
    let mut backups: Vec<PathBuf> = std::fs::read_dir(&dir)
        .with_context(|| format!("Listing {dir:?}"))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(&prefix) && name.ends_with(".csv"))
        })
        .collect();
    // Timestamps sort lexically.
    backups.sort();
    let excess = backups.len().saturating_sub(retention);
    let removed: Vec<PathBuf> = backups.into_iter().take(excess).collect();
    for path in &removed {
        std::fs::remove_file(path).with_context(|| format!("Removing old backup {path:?}"))?;
        debug!("Removed old backup {path:?}");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn quick_config() -> OutputConfig {
        OutputConfig {
            lock_timeout_secs: 0,
            lock_poll_millis: 5,
            ..OutputConfig::default()
        }
    }

    #[test]
    fn derived_names_carry_suffix_and_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let path = derived_output_path(Path::new("/data/survey.csv"), None, "lane_fixed", date);
        assert_eq!(path, PathBuf::from("/data/survey_lane_fixed_20240309.csv"));
        let path = derived_output_path(
            Path::new("/data/survey.csv"),
            Some(Path::new("/out")),
            "filtered",
            date,
        );
        assert_eq!(path, PathBuf::from("/out/survey_filtered_20240309.csv"));
    }

    #[test]
    fn second_writer_times_out_on_lock() {
        let dir = tempdir().expect("temp dir");
        let target = dir.path().join("out.csv");
        let config = quick_config();
        let first = PendingOutput::begin(&target, &config, true).expect("first lock");
        let err = PendingOutput::begin(&target, &config, true)
            .err()
            .expect("second lock times out");
        assert!(matches!(
            err.downcast_ref::<SurveyError>(),
            Some(SurveyError::LockTimeout { .. })
        ));
        drop(first);
        assert!(!dir.path().join("out.csv.lock").exists());
        PendingOutput::begin(&target, &config, true).expect("lock released");
    }

    #[test]
    fn commit_backs_up_existing_output() {
        let dir = tempdir().expect("temp dir");
        let target = dir.path().join("out.csv");
        std::fs::write(&target, "old\r\n").expect("seed output");

        let pending = PendingOutput::begin(&target, &quick_config(), true).expect("begin");
        {
            let mut writer = pending.csv_writer().expect("writer");
            writer.write_record(["new"]).expect("write");
            writer.flush().expect("flush");
        }
        let committed = pending.commit().expect("commit");
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "new\r\n");
        let backup = committed.backup.expect("backup made");
        assert_eq!(std::fs::read_to_string(backup).unwrap(), "old\r\n");
    }

    #[test]
    fn no_backup_flag_skips_backup() {
        let dir = tempdir().expect("temp dir");
        let target = dir.path().join("out.csv");
        std::fs::write(&target, "old\r\n").expect("seed output");
        let pending = PendingOutput::begin(&target, &quick_config(), false).expect("begin");
        assert_eq!(pending.commit().expect("commit").backup, None);
    }

    #[test]
    fn dropped_output_leaves_target_untouched() {
        let dir = tempdir().expect("temp dir");
        let target = dir.path().join("out.csv");
        std::fs::write(&target, "keep\r\n").expect("seed output");
        {
            let pending = PendingOutput::begin(&target, &quick_config(), true).expect("begin");
            let mut writer = pending.csv_writer().expect("writer");
            writer.write_record(["discard"]).expect("write");
            writer.flush().expect("flush");
        }
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "keep\r\n");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn partial_output_is_kept_beside_target() {
        let dir = tempdir().expect("temp dir");
        let target = dir.path().join("out.csv");
        let pending = PendingOutput::begin(&target, &quick_config(), true).expect("begin");
        {
            let mut writer = pending.csv_writer().expect("writer");
            writer.write_record(["half"]).expect("write");
            writer.flush().expect("flush");
        }
        let partial = pending.keep_partial().expect("partial");
        assert_eq!(partial, dir.path().join("out.csv.partial"));
        assert!(!target.exists());
    }

    #[test]
    fn retention_keeps_newest_backups() {
        let dir = tempdir().expect("temp dir");
        let target = dir.path().join("out.csv");
        for stamp in ["20240101_000000", "20240102_000000", "20240103_000000"] {
            std::fs::write(dir.path().join(format!("out_backup_{stamp}.csv")), "x").unwrap();
        }
        let removed = prune_backups(&target, 2).expect("prune");
        assert_eq!(removed, vec![dir.path().join("out_backup_20240101_000000.csv")]);
        assert!(dir.path().join("out_backup_20240103_000000.csv").exists());
    }
}
