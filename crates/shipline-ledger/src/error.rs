//! Error types for shipline-ledger

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the audit storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying file I/O failed
    #[error("audit log I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An entry could not be encoded
    #[error("audit entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted line could not be decoded
    #[error("audit log corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    /// No entries exist for the requested run
    #[error("run not found in audit log: {run_id}")]
    RunNotFound { run_id: String },

    /// Append attempted on a log opened for queries only
    #[error("audit log opened read-only: {path}")]
    ReadOnly { path: PathBuf },

    /// A digest string was not 64 hex characters
    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}
