//! In-memory block storage backend.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use reef_types::Hash;
use tracing::trace;

use crate::error::StoreError;
use crate::traits::BlockStore;

/// In-memory block store backed by a `RwLock<HashMap>`.
///
/// Useful for tests and for peers that run without a data directory.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Hash, Bytes>>,
}

impl MemoryBlockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.blocks.read().expect("lock poisoned").len()
    }

    /// Whether the store holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a block without rehashing (for corruption tests).
    #[doc(hidden)]
    pub fn insert_raw(&self, hash: Hash, data: Bytes) {
        self.blocks.write().expect("lock poisoned").insert(hash, data);
    }
}

#[async_trait::async_trait]
impl BlockStore for MemoryBlockStore {
    async fn put(&self, data: Bytes) -> Result<Hash, StoreError> {
        let hash = Hash::from_data(&data);
        let mut map = self.blocks.write().expect("lock poisoned");
        map.entry(hash).or_insert_with(|| {
            trace!(%hash, size = data.len(), "storing block in memory");
            data
        });
        Ok(hash)
    }

    async fn get(&self, hash: &Hash) -> Result<Option<Bytes>, StoreError> {
        let map = self.blocks.read().expect("lock poisoned");
        Ok(map.get(hash).cloned())
    }

    async fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        let map = self.blocks.read().expect("lock poisoned");
        Ok(map.contains_key(hash))
    }

    async fn rm(&self, hash: &Hash) -> Result<(), StoreError> {
        let mut map = self.blocks.write().expect("lock poisoned");
        if map.remove(hash).is_some() {
            trace!(%hash, "removed block from memory");
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Hash>, StoreError> {
        let map = self.blocks.read().expect("lock poisoned");
        Ok(map.keys().copied().collect())
    }

    fn persisted(&self) -> bool {
        false
    }
}
