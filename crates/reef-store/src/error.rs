//! Error types for block storage operations.

use reef_types::Hash;

/// Errors that can occur during block storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Block bytes on disk do not match their content address.
    ///
    /// The block is treated as missing by callers and may be fetched again
    /// from a peer.
    #[error("block corruption detected: expected {expected}, actual hash {actual}")]
    Corrupt {
        /// The address that was requested.
        expected: Hash,
        /// The address computed from the bytes actually stored.
        actual: Hash,
    },

    /// The store was closed or its backing directory vanished.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
