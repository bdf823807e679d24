use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the checkpoint store, the engine setup and the watcher
#[derive(Debug, Error)]
pub enum BatchError {
    /// Stored checkpoint was written by a differently configured run
    #[error("checkpoint does not match the requested run: {0}")]
    ConfigMismatch(String),

    #[error("no active checkpoint")]
    NoActiveCheckpoint,

    /// A job may hold at most one terminal classification
    #[error("{0} already has a recorded outcome")]
    AlreadyRecorded(String),

    #[error("checkpoint I/O failed for {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode checkpoint {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("cannot watch {path}: {source}")]
    WatchSetup {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("cannot read directory {path}: {source}")]
    DirectoryUnreadable {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

pub type BatchResult<T> = std::result::Result<T, BatchError>;

/// Failure reported by a per-file operation
#[derive(Debug, Error)]
pub enum OperationError {
    /// Nothing to do for this file; classified as skipped, never as a failure
    #[error("{0}")]
    NoEligibleWork(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl OperationError {
    pub fn no_work(reason: impl Into<String>) -> Self {
        OperationError::NoEligibleWork(reason.into())
    }
}
