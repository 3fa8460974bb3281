//! Error types for shared-log coordination.

use reef_log::LogError;
use reef_placement::PlacementError;

/// Errors raised by [`crate::SharedLog`] and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum SharedLogError {
    /// Replication was requested but nobody else subscribes to the log.
    #[error("no peers subscribed to {topic}")]
    NoPeers {
        /// Topic that has no other subscribers.
        topic: String,
    },

    /// A remote request got no answer in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The shared log is closed.
    #[error("shared log is closed")]
    Closed,

    /// The underlying log failed.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// Placement rejected an advertisement.
    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),

    /// The pub/sub collaborator failed.
    #[error("network error: {0}")]
    Network(String),

    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}
