//! Typed failures surfaced to callers, plus the user-facing rendering used by
//! the binary.
//!
//! Internal plumbing propagates `anyhow::Error` with context. Anything the
//! caller must be able to distinguish (validation, critical parse, resource
//! and integrity failures) is raised as a [`SurveyError`] somewhere in that
//! chain. [`user_facing`] digs it back out, logs the full chain under a fresh
//! correlation id and returns a short message that never contains a full path.

use std::{fmt, path::Path, time::Duration};

use log::error;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    MissingFile,
    MissingColumns,
    WrongFileKind,
    EmptyInput,
    InvalidWkt,
    InvalidConfig,
}

impl ValidationKind {
    fn as_str(self) -> &'static str {
        match self {
            ValidationKind::MissingFile => "missing file",
            ValidationKind::MissingColumns => "missing columns",
            ValidationKind::WrongFileKind => "wrong file kind",
            ValidationKind::EmptyInput => "empty input",
            ValidationKind::InvalidWkt => "invalid WKT",
            ValidationKind::InvalidConfig => "invalid configuration",
        }
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SurveyError {
    #[error("{kind}: {message}")]
    Validation {
        kind: ValidationKind,
        message: String,
    },
    #[error("timestamp column '{column}' could not be parsed ({failed} value(s) failed)")]
    CriticalParse { column: String, failed: usize },
    #[error("output '{file}' is locked by another run (waited {}s)", waited.as_secs())]
    LockTimeout { file: String, waited: Duration },
    #[error(
        "insufficient disk space for '{file}': need about {required} bytes, {available} available"
    )]
    InsufficientDisk {
        file: String,
        required: u64,
        available: u64,
    },
    #[error("predicted memory use of {required} bytes exceeds the {available} bytes available")]
    MemoryRisk { required: u64, available: u64 },
    #[error("row count integrity violation: expected {expected} row(s), produced {actual}")]
    RowCountShortfall { expected: usize, actual: usize },
    #[error("operation cancelled")]
    Cancelled,
}

impl SurveyError {
    pub fn validation(kind: ValidationKind, message: impl Into<String>) -> Self {
        SurveyError::Validation {
            kind,
            message: message.into(),
        }
    }

    pub fn missing_columns(file: &Path, missing: &[String]) -> Self {
        SurveyError::validation(
            ValidationKind::MissingColumns,
            format!(
                "'{}' is missing required column(s): {}",
                display_name(file),
                missing.join(", ")
            ),
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SurveyError::Cancelled)
    }
}

/// File name only; used in every caller-visible message.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "<input>".to_string())
}

#[derive(Debug, Clone)]
pub struct UserFacingError {
    pub correlation_id: Uuid,
    pub message: String,
}

impl fmt::Display for UserFacingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (correlation id {})",
            self.message, self.correlation_id
        )
    }
}

pub fn user_facing(err: &anyhow::Error) -> UserFacingError {
    let correlation_id = Uuid::new_v4();
    error!("[{correlation_id}] {err:?}");
    let message = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SurveyError>())
        .map(|survey| survey.to_string())
        .unwrap_or_else(|| "unexpected failure; see the log for details".to_string());
    UserFacingError {
        correlation_id,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use std::path::PathBuf;

    #[test]
    fn user_facing_prefers_typed_error_over_context() {
        let err = Err::<(), _>(SurveyError::CriticalParse {
            column: "TestDateUTC".to_string(),
            failed: 4,
        })
        .context("Parsing chunk 1 of /very/secret/path/survey.csv")
        .unwrap_err();
        let rendered = user_facing(&err);
        assert!(rendered.message.contains("TestDateUTC"));
        assert!(!rendered.message.contains("/very/secret"));
    }

    #[test]
    fn user_facing_hides_untyped_failures() {
        let err = anyhow::anyhow!("Opening input file \"/home/me/data.csv\"");
        let rendered = user_facing(&err);
        assert!(!rendered.message.contains("/home/me"));
        assert!(rendered.to_string().contains("correlation id"));
    }

    #[test]
    fn missing_columns_names_only_the_file() {
        let err = SurveyError::missing_columns(
            &PathBuf::from("/data/in/fixes.csv"),
            &["From".to_string(), "To".to_string()],
        );
        let text = err.to_string();
        assert!(text.contains("'fixes.csv'"));
        assert!(text.contains("From, To"));
        assert!(!text.contains("/data/in"));
    }
}
