//! Error types for placement.

use reef_types::PeerId;

/// Errors that can occur while managing replication ranges.
#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    /// A capacity factor was NaN or infinite.
    #[error("invalid capacity factor {factor} from {peer}")]
    InvalidFactor {
        /// Advertising peer.
        peer: PeerId,
        /// Rejected factor.
        factor: f64,
    },
}
