//! Core trait for content-addressed block storage.

use bytes::Bytes;
use reef_types::Hash;

use crate::error::StoreError;

/// Content-addressed byte store shared by every log on a peer.
///
/// Implementations must be `Send + Sync` for use across async tasks.
/// `put` is idempotent: storing the same bytes twice yields the same
/// address and leaves one copy.
#[async_trait::async_trait]
pub trait BlockStore: Send + Sync {
    /// Store bytes and return their address.
    async fn put(&self, data: Bytes) -> Result<Hash, StoreError>;

    /// Retrieve a block by address. Returns `None` if not found.
    async fn get(&self, hash: &Hash) -> Result<Option<Bytes>, StoreError>;

    /// Check whether a block exists.
    async fn has(&self, hash: &Hash) -> Result<bool, StoreError>;

    /// Remove a block. Removing an absent block is not an error.
    async fn rm(&self, hash: &Hash) -> Result<(), StoreError>;

    /// List the addresses of all stored blocks.
    async fn list(&self) -> Result<Vec<Hash>, StoreError>;

    /// Whether blocks survive a process restart.
    fn persisted(&self) -> bool;
}
