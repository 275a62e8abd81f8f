#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::{TempDir, tempdir};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dir");
        }
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }

    /// Writes a CSV from a header line and data lines.
    pub fn write_csv(&self, name: &str, header: &str, rows: &[&str]) -> PathBuf {
        let mut contents = String::from(header);
        contents.push('\n');
        for row in rows {
            contents.push_str(row);
            contents.push('\n');
        }
        self.write(name, &contents)
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// File names in `dir` (relative to the workspace), sorted.
    pub fn list(&self, dir: &str) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.temp_dir.path().join(dir))
            .expect("read dir")
            .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

/// Parses a CSV file written by the tool into `(headers, rows)`.
pub fn read_csv(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).expect("open output csv");
    let headers = reader
        .headers()
        .expect("output headers")
        .iter()
        .map(str::to_string)
        .collect();
    let rows = reader
        .records()
        .map(|record| {
            record
                .expect("output record")
                .iter()
                .map(str::to_string)
                .collect()
        })
        .collect();
    (headers, rows)
}

pub fn column<'a>(headers: &[String], rows: &'a [Vec<String>], name: &str) -> Vec<&'a str> {
    let idx = headers
        .iter()
        .position(|h| h == name)
        .unwrap_or_else(|| panic!("column {name} present"));
    rows.iter().map(|row| row[idx].as_str()).collect()
}

pub const SURVEY_HEADER: &str = "TestDateUTC,RoadID,RoadName,Chainage,Lane,Ignore";

pub const FIXES_HEADER: &str = "From,To,Lane,Ignore,Plate";

/// Three survey rows around two lane-fix windows, one of them a sentinel.
pub fn lane_fix_inputs(workspace: &TestWorkspace) -> (PathBuf, PathBuf) {
    let survey = workspace.write_csv(
        "survey.csv",
        SURVEY_HEADER,
        &[
            "2024-03-01 10:15:00,0011,Main Street,120,A5B,true",
            "2024-03-01 10:45:00,0011,Main Street,130,L1,False",
            "2024-03-01 11:05:00,0012,High Road,10,L2,FALSE",
        ],
    );
    let fixes = workspace.write_csv(
        "fixes.csv",
        FIXES_HEADER,
        &[
            "2024-03-01 10:00:00,2024-03-01 10:30:00,12,False,ABC123",
            "2024-03-01 11:00:00,2024-03-01 11:10:00,-1,True,ABC123",
        ],
    );
    (survey, fixes)
}

pub const QUALITY_HEADER: &str =
    "RawSlope170,RawSlope270,TrailingFactor,tsdSlopeMinY,tsdSlopeMaxY,Lane,Ignore,TestDateUTC";

pub const QUALITY_ROWS: [&str; 4] = [
    "0.5,0.6,0.3,-20,100,L1,False,2024-01-01T00:00:00",
    "0.4,0.5,0.25,30,100,L2,False,2024-01-01T00:00:01",
    "0.4,0.5,0.05,30,100,SK1,False,2024-01-01T00:00:02",
    "0.4,0.5,0.3,30,100,L1,True,2024-01-01T00:00:03",
];

pub const POLYGONS_HEADER: &str = "id,CouncilName,WKT";

/// Two unit-ish squares side by side and a third overlapping the first.
pub fn polygon_file(workspace: &TestWorkspace) -> PathBuf {
    workspace.write_csv(
        "polygons.csv",
        POLYGONS_HEADER,
        &[
            "1,North Council,\"POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0))\"",
            "2,South Council,\"POLYGON ((10 0, 20 0, 20 10, 10 10, 10 0))\"",
            "3,Overlap,\"POLYGON ((5 5, 15 5, 15 15, 5 15, 5 5))\"",
        ],
    )
}
