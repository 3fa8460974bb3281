//! Error types for the log crate.

use reef_store::StoreError;

/// Errors that can occur during log operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// An entry failed hash, signature or policy checks, or could not be built.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The operation requires an open log.
    #[error("log is closed")]
    Closed,

    /// `open` was called on a log that is already open.
    #[error("log is already open")]
    AlreadyOpen,

    /// Block store error.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Entry index error.
    #[error("index error: {0}")]
    Index(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<postcard::Error> for LogError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
