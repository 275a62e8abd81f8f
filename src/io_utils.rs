//! I/O utilities for CSV reading and writing.
//!
//! All file I/O flows through this module:
//!
//! - **Decoding**: UTF-8 with or without BOM is the default. When no encoding
//!   is given, a sample of the file is decoded strictly as UTF-8 and then as
//!   Windows-1252, keeping the first that decodes cleanly.
//! - **Reading**: every cell is read as a raw string so leading zeros and
//!   literal casing survive a round trip.
//! - **Writing**: CRLF terminators and the configured quoting style.
//! - **Counting**: exact record counts for progress and chunk arithmetic.

use std::{
    fs::File,
    io::{BufReader, Read, Write},
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use csv::{QuoteStyle, Terminator};
use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use encoding_rs_io::DecodeReaderBytesBuilder;
use log::debug;

use crate::{
    attempt::first_accepted,
    config::{LineEnding, OutputConfig, Quoting},
    error::{SurveyError, ValidationKind, display_name},
    progress::CancellationToken,
};

const ENCODING_SNIFF_BYTES: usize = 64 * 1024;
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

pub fn resolve_encoding(label: Option<&str>) -> Result<Option<&'static Encoding>> {
    match label {
        Some(value) => Encoding::for_label(value.trim().as_bytes())
            .map(Some)
            .ok_or_else(|| anyhow!("Unknown encoding '{value}'")),
        None => Ok(None),
    }
}

/// Picks the input encoding: an explicit label wins, otherwise the first of
/// UTF-8 and Windows-1252 that decodes the leading bytes without errors.
pub fn sniff_encoding(path: &Path, explicit: Option<&'static Encoding>) -> Result<&'static Encoding> {
    if let Some(encoding) = explicit {
        return Ok(encoding);
    }
    let mut file = File::open(path).with_context(|| format!("Opening input file {path:?}"))?;
    let mut buffer = Vec::with_capacity(ENCODING_SNIFF_BYTES);
    Read::by_ref(&mut file)
        .take(ENCODING_SNIFF_BYTES as u64)
        .read_to_end(&mut buffer)
        .with_context(|| format!("Reading {path:?}"))?;
    if buffer.starts_with(UTF8_BOM) {
        return Ok(UTF_8);
    }
    // Cut at the last newline so a multi-byte sequence is never split.
    let sample = if buffer.len() == ENCODING_SNIFF_BYTES {
        match buffer.iter().rposition(|b| *b == b'\n') {
            Some(pos) => &buffer[..=pos],
            None => &buffer[..],
        }
    } else {
        &buffer[..]
    };
    let accepted = first_accepted(
        [UTF_8, WINDOWS_1252],
        |encoding| {
            encoding
                .decode_without_bom_handling_and_without_replacement(sample)
                .is_some()
        },
        |decoded| *decoded,
    );
    let encoding = accepted.map(|a| a.strategy).unwrap_or(UTF_8);
    debug!("Using {} for {:?}", encoding.name(), path);
    Ok(encoding)
}

pub fn open_csv_reader<R>(reader: R, has_headers: bool) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(has_headers)
        .delimiter(b',')
        .double_quote(true)
        .flexible(false);
    builder.from_reader(reader)
}

/// Opens `path` as a CSV reader that yields UTF-8 with any BOM stripped.
pub fn open_csv_reader_from_path(
    path: &Path,
    encoding: &'static Encoding,
) -> Result<csv::Reader<Box<dyn Read>>> {
    if !path.is_file() {
        return Err(SurveyError::validation(
            ValidationKind::MissingFile,
            format!("'{}' does not exist or is not a file", display_name(path)),
        )
        .into());
    }
    let file = File::open(path).with_context(|| format!("Opening input file {path:?}"))?;
    let label = if encoding == UTF_8 { None } else { Some(encoding) };
    let decoded = DecodeReaderBytesBuilder::new()
        .encoding(label)
        .bom_sniffing(true)
        .build(file);
    let reader: Box<dyn Read> = Box::new(BufReader::new(decoded));
    Ok(open_csv_reader(reader, true))
}

pub fn open_csv_writer<W: Write>(writer: W, config: &OutputConfig) -> csv::Writer<W> {
    let mut builder = csv::WriterBuilder::new();
    builder
        .delimiter(b',')
        .double_quote(true)
        .terminator(match config.line_ending {
            LineEnding::Crlf => Terminator::CRLF,
            LineEnding::Lf => Terminator::Any(b'\n'),
        })
        .quote_style(match config.quoting {
            Quoting::Necessary => QuoteStyle::Necessary,
            Quoting::Always => QuoteStyle::Always,
        });
    builder.from_writer(writer)
}

pub fn decode_record(record: &csv::ByteRecord) -> Vec<String> {
    record
        .iter()
        .map(|field| String::from_utf8_lossy(field).into_owned())
        .collect()
}

/// Header names with surrounding whitespace removed. Fails on a file with no
/// header row.
pub fn reader_headers<R>(reader: &mut csv::Reader<R>, path: &Path) -> Result<Vec<String>>
where
    R: Read,
{
    let headers = reader
        .byte_headers()
        .with_context(|| format!("Reading headers from {path:?}"))?
        .clone();
    let decoded: Vec<String> = decode_record(&headers)
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();
    if decoded.is_empty() || decoded.iter().all(|h| h.is_empty()) {
        return Err(SurveyError::validation(
            ValidationKind::EmptyInput,
            format!("'{}' has no header row", display_name(path)),
        )
        .into());
    }
    Ok(decoded)
}

pub fn read_headers(path: &Path, encoding: &'static Encoding) -> Result<Vec<String>> {
    let mut reader = open_csv_reader_from_path(path, encoding)?;
    reader_headers(&mut reader, path)
}

/// Exact number of data records (quoted newlines included), excluding the
/// header. Malformed records still count so chunk arithmetic stays aligned.
pub fn count_records(
    path: &Path,
    encoding: &'static Encoding,
    cancel: &CancellationToken,
    check_every: usize,
) -> Result<usize> {
    let mut reader = open_csv_reader_from_path(path, encoding)?;
    reader_headers(&mut reader, path)?;
    let mut record = csv::ByteRecord::new();
    let mut count = 0usize;
    loop {
        match reader.read_byte_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) if err.is_io_error() => {
                return Err(err).with_context(|| format!("Counting rows in {path:?}"));
            }
            Err(_) => {}
        }
        count += 1;
        if check_every > 0 && count % check_every == 0 {
            cancel.check()?;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bom_is_stripped_from_first_header() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("bom.csv");
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"RoadID,Lane\r\n0011,L1\r\n");
        std::fs::write(&path, bytes).expect("write csv");
        let encoding = sniff_encoding(&path, None).expect("sniff");
        assert_eq!(encoding, UTF_8);
        let headers = read_headers(&path, encoding).expect("headers");
        assert_eq!(headers, vec!["RoadID".to_string(), "Lane".to_string()]);
    }

    #[test]
    fn latin1_bytes_fall_back_to_windows_1252() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("latin.csv");
        std::fs::write(&path, b"RoadName\nS\xE9vign\xE9 Road\n").expect("write csv");
        let encoding = sniff_encoding(&path, None).expect("sniff");
        assert_eq!(encoding, WINDOWS_1252);
        let mut reader = open_csv_reader_from_path(&path, encoding).expect("reader");
        reader_headers(&mut reader, &path).expect("headers");
        let record = reader.byte_records().next().unwrap().unwrap();
        assert_eq!(decode_record(&record), vec!["Sévigné Road".to_string()]);
    }

    #[test]
    fn sniff_reads_only_the_leading_window_of_large_files() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("large.csv");
        let mut text = String::from("RoadName,Lane\n");
        while text.len() < ENCODING_SNIFF_BYTES * 2 {
            text.push_str("Ōtaki Gorge Road,L1\n");
        }
        std::fs::write(&path, text).expect("write csv");
        let encoding = sniff_encoding(&path, None).expect("sniff");
        assert_eq!(encoding, UTF_8);
    }

    #[test]
    fn count_records_handles_quoted_newlines() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("quoted.csv");
        std::fs::write(&path, "a,b\n1,\"two\nlines\"\n3,4\n").expect("write csv");
        let count = count_records(&path, UTF_8, &CancellationToken::new(), 1).expect("count");
        assert_eq!(count, 2);
    }

    #[test]
    fn writer_uses_crlf_and_minimal_quoting() {
        let config = OutputConfig::default();
        let mut writer = open_csv_writer(Vec::new(), &config);
        writer.write_record(["0011", "a,b"]).unwrap();
        let bytes = writer.into_inner().unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "0011,\"a,b\"\r\n");
    }

    #[test]
    fn missing_file_is_a_validation_error() {
        let err = read_headers(Path::new("/definitely/not/here.csv"), UTF_8)
            .expect_err("missing file");
        let survey = err.downcast_ref::<SurveyError>().expect("typed error");
        assert!(matches!(
            survey,
            SurveyError::Validation {
                kind: ValidationKind::MissingFile,
                ..
            }
        ));
    }
}
