//! Error taxonomy for index operations.
//!
//! Conditions that only affect one file or one chunk are not errors: they
//! are reported as [`ScanWarning`](crate::scan::ScanWarning)s and
//! [`UpdateIssue`](crate::coordinator::UpdateIssue)s inside the update
//! report. Everything here either aborts the operation or was never started.

use std::path::PathBuf;

use repo_index_core::dense::DenseIndexError;
use repo_index_core::embedding::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The scan root could not be read. Fatal to that update.
    #[error("cannot scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persisted state was written by an incompatible version.
    #[error("{what} has schema version {found}, expected {expected}; run an explicit migration")]
    SchemaVersion {
        what: String,
        found: u32,
        expected: u32,
    },

    /// Persisted state is unreadable or violates index invariants.
    #[error("corrupt {what}: {reason}")]
    Corrupt { what: String, reason: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("index at {0} is busy: another update holds the lock")]
    IndexBusy(PathBuf),

    #[error("index has no persisted snapshot yet; run an update first")]
    NotReady,

    #[error("update cancelled")]
    Cancelled,

    /// Writing the next snapshot failed; the previous one is intact.
    #[error("failed to persist snapshot to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Dense(#[from] DenseIndexError),

    #[error("embedding cache error: {0}")]
    Cache(#[from] sqlx::Error),

    #[error("embedding task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = IndexError> = std::result::Result<T, E>;

impl IndexError {
    pub(crate) fn corrupt(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupt {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}
