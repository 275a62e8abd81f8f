//! Disk-backed reference index used by the streaming strategy.
//!
//! Compact entries extracted from a reference table are appended with
//! bincode to a temporary file in batches (one per reference chunk) and read
//! back just before the join. The file is removed when the [`IndexWriter`] or
//! [`IndexFile`] owning it is dropped, whether the run succeeded or not.
//!
//! Layout: a version header, then `count, entry * count` batches, closed by a
//! zero count.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use log::debug;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tempfile::NamedTempFile;

const INDEX_VERSION: u32 = 2;

#[derive(Serialize, Deserialize)]
struct IndexHeader {
    version: u32,
}

pub struct IndexWriter {
    file: NamedTempFile,
    writer: BufWriter<File>,
    entries: usize,
}

impl IndexWriter {
    /// Creates a new temporary index inside `dir` (or the system temp
    /// directory).
    pub fn create(dir: Option<&Path>) -> Result<Self> {
        let file = match dir {
            Some(dir) => NamedTempFile::new_in(dir),
            None => NamedTempFile::new(),
        }
        .context("Creating temporary index file")?;
        let handle = file
            .as_file()
            .try_clone()
            .context("Opening temporary index file")?;
        let mut writer = BufWriter::new(handle);
        let header = IndexHeader {
            version: INDEX_VERSION,
        };
        bincode::serde::encode_into_std_write(&header, &mut writer, bincode::config::standard())
            .context("Writing index header")?;
        Ok(IndexWriter {
            file,
            writer,
            entries: 0,
        })
    }

    pub fn append<T: Serialize>(&mut self, batch: &[T]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let config = bincode::config::standard();
        bincode::serde::encode_into_std_write(batch.len() as u64, &mut self.writer, config)
            .context("Writing index batch")?;
        for entry in batch {
            bincode::serde::encode_into_std_write(entry, &mut self.writer, config)
                .context("Writing index entry")?;
        }
        self.entries += batch.len();
        Ok(())
    }

    /// Writes the closing marker and hands the file over for reading.
    pub fn finish(self) -> Result<IndexFile> {
        let IndexWriter {
            file,
            mut writer,
            entries,
        } = self;
        bincode::serde::encode_into_std_write(0u64, &mut writer, bincode::config::standard())
            .context("Closing index file")?;
        writer.flush().context("Flushing index file")?;
        debug!("Persisted {entries} reference entries to {:?}", file.path());
        Ok(IndexFile { file, entries })
    }
}

pub struct IndexFile {
    file: NamedTempFile,
    entries: usize,
}

impl IndexFile {
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let handle = File::open(self.file.path())
            .with_context(|| format!("Opening index file {:?}", self.file.path()))?;
        let mut reader = BufReader::new(handle);
        let config = bincode::config::standard();
        let header: IndexHeader = bincode::serde::decode_from_std_read(&mut reader, config)
            .context("Reading index header")?;
        if header.version != INDEX_VERSION {
            return Err(anyhow!(
                "Unsupported index version {} (expected {INDEX_VERSION})",
                header.version
            ));
        }
        let mut entries = Vec::with_capacity(self.entries);
        loop {
            let batch: u64 = bincode::serde::decode_from_std_read(&mut reader, config)
                .context("Reading index batch")?;
            if batch == 0 {
                break;
            }
            for _ in 0..batch {
                let entry: T = bincode::serde::decode_from_std_read(&mut reader, config)
                    .context("Reading index entry")?;
                entries.push(entry);
            }
        }
        if entries.len() != self.entries {
            return Err(anyhow!(
                "Index file holds {} entries, expected {}",
                entries.len(),
                self.entries
            ));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;

    #[test]
    fn batches_survive_the_round_trip_and_file_is_removed() {
        let first = vec![
            Interval::new(10i64, 20i64, "L1".to_string()),
            Interval::new(30i64, 40i64, "-1".to_string()),
        ];
        let second = vec![Interval::new(50i64, 60i64, "R2".to_string())];
        let mut writer = IndexWriter::create(None).expect("create index");
        writer.append(&first).expect("append first");
        writer.append::<Interval<i64, String>>(&[]).expect("append empty");
        writer.append(&second).expect("append second");
        let index = writer.finish().expect("finish index");
        assert_eq!(index.len(), 3);
        let path = index.path().to_path_buf();
        assert!(path.exists());
        let loaded: Vec<Interval<i64, String>> = index.load().expect("load index");
        assert_eq!(loaded, [first, second].concat());
        drop(index);
        assert!(!path.exists());
    }

    #[test]
    fn empty_index_loads_no_entries() {
        let index = IndexWriter::create(None)
            .expect("create index")
            .finish()
            .expect("finish index");
        let loaded: Vec<Interval<i64, String>> = index.load().expect("load index");
        assert!(loaded.is_empty());
    }
}
