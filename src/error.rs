use std::io;
use std::path::PathBuf;

use crate::downloader::hasher::HashAlgorithm;

/// Every way a single download execution can end without a verified file.
#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("path traversal detected: {} escapes the storage root", .0.display())]
    PathTraversal(PathBuf),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Transport(String),

    #[error("{algorithm} hash verification failed: expected {expected}, got {actual}")]
    HashVerification {
        algorithm: HashAlgorithm,
        expected: String,
        actual: String,
    },

    #[error("{algorithm} hash verification failed: {detail}")]
    Unverifiable {
        algorithm: HashAlgorithm,
        detail: String,
    },

    #[error("metadata unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("download cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl DownloadError {
    /// Only timeouts are retried by the executor; everything else is final for
    /// this execution.
    pub fn is_transient(&self) -> bool {
        matches!(self, DownloadError::Timeout(_))
    }

    /// Text carried in the `reason` field of the terminal progress event.
    pub fn reason(&self) -> String {
        match self {
            DownloadError::Timeout(_) => "timeout".to_string(),
            DownloadError::HashVerification { algorithm, .. } => {
                format!("{algorithm} hash verification failed")
            }
            DownloadError::Unverifiable { algorithm, detail } => {
                format!("{algorithm} hash verification failed: {detail}")
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DownloadError::Timeout(err.to_string())
        } else {
            DownloadError::Transport(err.to_string())
        }
    }
}

/// Admission and lookup failures of the task queue.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("a download into {0} is already queued or running")]
    DuplicateDestination(String),

    #[error("unknown task {0}")]
    UnknownTask(String),
}
