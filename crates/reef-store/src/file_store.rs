//! File-based block storage backend.
//!
//! Stores one file per block with a 2-level fan-out directory structure:
//! `{base_dir}/{hex[0..2]}/{hex[2..4]}/{hex}`.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use reef_types::Hash;
use tracing::{debug, error};

use crate::error::StoreError;
use crate::traits::BlockStore;

/// File-based block store with 2-level fan-out directory layout.
///
/// Writes are atomic: data is written to a temporary file first, then
/// renamed into place, so a crash never leaves a half-written block that
/// would fail verification on the next read.
pub struct FileBlockStore {
    base_dir: PathBuf,
}

impl FileBlockStore {
    /// Create a new file store rooted at the given directory.
    ///
    /// The directory is created if it does not exist.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Compute the full file path for a block address.
    fn block_path(&self, hash: &Hash) -> PathBuf {
        let hex = hash.to_string();
        self.base_dir.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }
}

#[async_trait::async_trait]
impl BlockStore for FileBlockStore {
    async fn put(&self, data: Bytes) -> Result<Hash, StoreError> {
        let hash = Hash::from_data(&data);
        let path = self.block_path(&hash);

        if tokio::fs::try_exists(&path).await? {
            return Ok(hash);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(%hash, size = data.len(), "stored block to file");
        Ok(hash)
    }

    async fn get(&self, hash: &Hash) -> Result<Option<Bytes>, StoreError> {
        let path = self.block_path(hash);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                // Verify-on-read: a corrupt block is an error, never returned.
                let actual = Hash::from_data(&data);
                if actual != *hash {
                    error!(expected = %hash, %actual, "block corruption detected on read");
                    return Err(StoreError::Corrupt {
                        expected: *hash,
                        actual,
                    });
                }
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn has(&self, hash: &Hash) -> Result<bool, StoreError> {
        let path = self.block_path(hash);
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn rm(&self, hash: &Hash) -> Result<(), StoreError> {
        let path = self.block_path(hash);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%hash, "deleted block file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn list(&self) -> Result<Vec<Hash>, StoreError> {
        let mut hashes = Vec::new();

        // Walk the 2-level fan-out: base/XX/YY/<hex>
        let mut level0 = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(d0) = level0.next_entry().await? {
            if !d0.file_type().await?.is_dir() {
                continue;
            }
            let mut level1 = tokio::fs::read_dir(d0.path()).await?;
            while let Some(d1) = level1.next_entry().await? {
                if !d1.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = tokio::fs::read_dir(d1.path()).await?;
                while let Some(entry) = files.next_entry().await? {
                    if !entry.file_type().await?.is_file() {
                        continue;
                    }
                    if let Some(name) = entry.file_name().to_str()
                        && let Ok(hash) = name.parse::<Hash>()
                    {
                        hashes.push(hash);
                    }
                }
            }
        }
        Ok(hashes)
    }

    fn persisted(&self) -> bool {
        true
    }
}
