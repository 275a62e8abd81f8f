//! YAML persistence used for configuration files.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

fn read_to_string(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Opening YAML file {path:?}"))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    Ok(buf)
}

fn write_string(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Creating directory {parent:?}"))?;
    }
    let mut file = File::create(path).with_context(|| format!("Creating YAML file {path:?}"))?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(())
}

/// An empty document is read as an empty mapping so every `#[serde(default)]`
/// field falls back to its default.
pub fn from_str<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let document = if raw.trim().is_empty() { "{}" } else { raw };
    serde_yaml::from_str(document).context("Parsing YAML document")
}

pub fn load_from_path<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = read_to_string(path)?;
    from_str(&raw).with_context(|| format!("Reading {path:?}"))
}

pub fn save_to_path<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let serialized = to_string(data)?;
    write_string(path, &serialized)
}

pub fn to_string<T: Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value).context("Serializing YAML document")
}
