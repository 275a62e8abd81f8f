//! In-memory table model and the chunked record reader.
//!
//! Every cell is kept as the raw string read from disk. Typed views
//! (timestamps, chainage numbers, booleans) are derived per operation and
//! never written back unless the operation says so.

use std::{io::Read, path::Path};

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use log::debug;

use crate::{
    error::display_name,
    io_utils::{self, decode_record},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Rows shorter than the header are padded with empty cells and longer
    /// rows are cut, so every row has exactly one cell per column.
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();
        Table { headers, rows }
    }

    /// Reads the whole file into memory.
    pub fn read(path: &Path, encoding: &'static Encoding) -> Result<Self> {
        let mut reader = io_utils::open_csv_reader_from_path(path, encoding)?;
        let headers = io_utils::reader_headers(&mut reader, path)?;
        let mut rows = Vec::new();
        for (idx, record) in reader.byte_records().enumerate() {
            let record = record.with_context(|| {
                format!("Reading row {} of '{}'", idx + 2, display_name(path))
            })?;
            rows.push(decode_record(&record));
        }
        Ok(Table::new(headers, rows))
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut Vec<Vec<String>> {
        &mut self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Exact header match.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn column(&self, index: usize) -> Vec<&str> {
        self.rows.iter().map(|row| row[index].as_str()).collect()
    }

    pub fn cell(&self, row: usize, column: usize) -> &str {
        &self.rows[row][column]
    }

    /// Index of `name`, appending it as an empty column when absent.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.push(String::new());
        }
        self.headers.len() - 1
    }

    pub fn write_rows<W: std::io::Write>(&self, writer: &mut csv::Writer<W>) -> Result<()> {
        for row in &self.rows {
            writer.write_record(row).context("Writing output row")?;
        }
        Ok(())
    }
}

/// Parses the boolean spellings that appear in survey exports.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

pub fn render_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// Columns whose non-empty values are all `true`/`false` in some casing.
pub fn boolean_like_columns(table: &Table) -> Vec<usize> {
    (0..table.headers().len())
        .filter(|&idx| {
            let mut seen = false;
            let all_bool = table.rows().iter().all(|row| {
                let value = row[idx].trim();
                if value.is_empty() {
                    return true;
                }
                seen = true;
                value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false")
            });
            all_bool && seen
        })
        .collect()
}

/// Rewrites `true`/`false` cells of `columns` as `True`/`False`. Other values
/// are left as they are.
pub fn render_boolean_columns(table: &mut Table, columns: &[usize]) {
    for row in table.rows_mut() {
        for &idx in columns {
            let value = row[idx].trim();
            if value.eq_ignore_ascii_case("true") {
                row[idx] = render_bool(true).to_string();
            } else if value.eq_ignore_ascii_case("false") {
                row[idx] = render_bool(false).to_string();
            }
        }
    }
}

/// Boolean rendering that stays consistent across the chunks of one file.
///
/// The column set is decided from the first chunk that has rows; every chunk
/// after that is rendered with the same columns.
#[derive(Debug, Default)]
pub struct BooleanColumns {
    columns: Option<Vec<usize>>,
}

impl BooleanColumns {
    pub fn new() -> Self {
        BooleanColumns::default()
    }

    pub fn render(&mut self, table: &mut Table) {
        if self.columns.is_none() {
            if table.is_empty() {
                return;
            }
            let detected = boolean_like_columns(table);
            if !detected.is_empty() {
                let names: Vec<&str> = detected.iter().map(|&idx| table.headers()[idx].as_str()).collect();
                debug!("Rendering boolean column(s) {names:?} as True/False");
            }
            self.columns = Some(detected);
        }
        if let Some(columns) = &self.columns {
            render_boolean_columns(table, columns);
        }
    }
}

/// One slice of an input file produced by [`ChunkReader`].
#[derive(Debug)]
pub enum Chunk {
    Rows {
        /// Zero-based ordinal of the first data row in this chunk.
        first_row: usize,
        table: Table,
    },
    /// A chunk with at least one record the parser rejected. The whole chunk
    /// is skipped so the output never contains half a chunk.
    Malformed {
        first_row: usize,
        rows: usize,
        error: String,
    },
}

/// Reads a CSV file in fixed-size chunks of data rows.
pub struct ChunkReader {
    reader: csv::Reader<Box<dyn Read>>,
    headers: Vec<String>,
    chunk_size: usize,
    next_row: usize,
    record: csv::ByteRecord,
    finished: bool,
}

impl ChunkReader {
    pub fn open(path: &Path, encoding: &'static Encoding, chunk_size: usize) -> Result<Self> {
        let mut reader = io_utils::open_csv_reader_from_path(path, encoding)?;
        let headers = io_utils::reader_headers(&mut reader, path)?;
        Ok(ChunkReader {
            reader,
            headers,
            chunk_size: chunk_size.max(1),
            next_row: 0,
            record: csv::ByteRecord::new(),
            finished: false,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows_read(&self) -> usize {
        self.next_row
    }

    fn read_chunk(&mut self) -> Result<Option<Chunk>> {
        let first_row = self.next_row;
        let mut rows = Vec::new();
        let mut error: Option<String> = None;
        let mut count = 0usize;
        while count < self.chunk_size {
            match self.reader.read_byte_record(&mut self.record) {
                Ok(true) => {
                    if error.is_none() {
                        rows.push(decode_record(&self.record));
                    }
                }
                Ok(false) => {
                    self.finished = true;
                    break;
                }
                Err(err) if err.is_io_error() => {
                    return Err(err).context("Reading input records");
                }
                Err(err) => {
                    if error.is_none() {
                        error = Some(err.to_string());
                        rows.clear();
                    }
                }
            }
            count += 1;
        }
        self.next_row += count;
        if count == 0 {
            return Ok(None);
        }
        Ok(Some(match error {
            Some(error) => Chunk::Malformed {
                first_row,
                rows: count,
                error,
            },
            None => Chunk::Rows {
                first_row,
                table: Table::new(self.headers.clone(), rows),
            },
        }))
    }
}

impl Iterator for ChunkReader {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        self.read_chunk().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::UTF_8;
    use tempfile::tempdir;

    fn table(headers: &[&str], rows: &[&[&str]]) -> Table {
        Table::new(
            headers.iter().map(|h| h.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn ensure_column_appends_empty_cells() {
        let mut t = table(&["a"], &[&["1"], &["2"]]);
        let idx = t.ensure_column("b");
        assert_eq!(idx, 1);
        assert_eq!(t.rows()[1], vec!["2".to_string(), String::new()]);
        assert_eq!(t.ensure_column("a"), 0);
    }

    #[test]
    fn boolean_detection_ignores_numeric_flags() {
        let t = table(
            &["Ignore", "Count", "Empty"],
            &[&["false", "1", ""], &["TRUE", "0", ""]],
        );
        assert_eq!(boolean_like_columns(&t), vec![0]);
    }

    #[test]
    fn renders_booleans_in_title_case() {
        let mut t = table(&["Ignore"], &[&["false"], &["TRUE"], &[""]]);
        render_boolean_columns(&mut t, &[0]);
        assert_eq!(t.column(0), vec!["False", "True", ""]);
    }

    #[test]
    fn boolean_columns_are_decided_by_the_first_non_empty_chunk() {
        let mut booleans = BooleanColumns::new();
        let mut empty = table(&["Checked", "Note"], &[]);
        booleans.render(&mut empty);
        let mut first = table(&["Checked", "Note"], &[&["true", "x"], &["", "false"]]);
        booleans.render(&mut first);
        assert_eq!(first.column(0), vec!["True", ""]);
        assert_eq!(first.column(1), vec!["x", "false"]);
        let mut second = table(&["Checked", "Note"], &[&["FALSE", "true"], &["maybe", "y"]]);
        booleans.render(&mut second);
        assert_eq!(second.column(0), vec!["False", "maybe"]);
        assert_eq!(second.column(1), vec!["true", "y"]);
    }

    #[test]
    fn chunk_reader_skips_whole_malformed_chunk() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("input.csv");
        std::fs::write(&path, "a,b\n1,2\n3,4\n5\n7,8\n9,10\n").expect("write csv");
        let chunks: Vec<Chunk> = ChunkReader::open(&path, UTF_8, 2)
            .expect("open")
            .collect::<Result<_>>()
            .expect("read chunks");
        assert_eq!(chunks.len(), 3);
        assert!(matches!(&chunks[0], Chunk::Rows { first_row: 0, table } if table.len() == 2));
        assert!(matches!(&chunks[1], Chunk::Malformed { first_row: 2, rows: 2, .. }));
        match &chunks[2] {
            Chunk::Rows { first_row, table } => {
                assert_eq!(*first_row, 4);
                assert_eq!(table.cell(0, 1), "10");
            }
            other => panic!("unexpected chunk {other:?}"),
        }
    }

    #[test]
    fn leading_zeros_survive_reading() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("zeros.csv");
        std::fs::write(&path, "RoadID\n0011\n").expect("write csv");
        let t = Table::read(&path, UTF_8).expect("read");
        assert_eq!(t.cell(0, 0), "0011");
    }
}
