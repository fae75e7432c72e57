//! Classified backup errors.
//!
//! Library functions return `anyhow::Result` and attach IO context as usual;
//! failures that carry a meaning for the orchestrator are raised as
//! `BackupError` and recovered with `classify()` (downcast through the chain).

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    /// Compression map or CFM absent where required.
    #[error("missing metadata: {what} not found at {}", .path.display())]
    MissingMetadata { what: &'static str, path: PathBuf },

    #[error("malformed CFM {}: {reason}", .path.display())]
    MalformedCfm { path: PathBuf, reason: String },

    #[error("{}", fmt_corruption(.file, .chunk, .reason))]
    Corruption {
        file: PathBuf,
        chunk: Option<usize>,
        reason: String,
    },

    #[error("change tracking unavailable: {0}")]
    ChangeTrackingUnavailable(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("instance '{0}' already has a running backup")]
    InstanceBusy(String),

    #[error("backup cancelled")]
    Cancelled,
}

fn fmt_corruption(file: &Path, chunk: &Option<usize>, reason: &str) -> String {
    match *chunk {
        Some(i) => format!("corruption in {} (chunk {}): {}", file.display(), i, reason),
        None => format!("corruption in {}: {}", file.display(), reason),
    }
}

impl BackupError {
    pub fn missing(what: &'static str, path: &Path) -> Self {
        BackupError::MissingMetadata {
            what,
            path: path.to_path_buf(),
        }
    }

    pub fn malformed_cfm(path: &Path, reason: impl Into<String>) -> Self {
        BackupError::MalformedCfm {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn corruption(file: &Path, chunk: Option<usize>, reason: impl Into<String>) -> Self {
        BackupError::Corruption {
            file: file.to_path_buf(),
            chunk,
            reason: reason.into(),
        }
    }

    /// Detector findings on existing bytes (CORRUPT status). A missing file is
    /// a metadata failure and ends as ERROR.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            BackupError::MalformedCfm { .. } | BackupError::Corruption { .. }
        )
    }
}

/// Find the classified error anywhere in an anyhow chain.
pub fn classify(err: &anyhow::Error) -> Option<&BackupError> {
    err.chain().find_map(|e| e.downcast_ref::<BackupError>())
}
