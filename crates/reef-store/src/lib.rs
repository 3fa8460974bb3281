//! Content-addressed block storage.
//!
//! This crate defines the [`BlockStore`] trait consumed by the log layer,
//! along with two concrete backends:
//!
//! - [`MemoryBlockStore`] — volatile storage backed by a `RwLock<HashMap>`.
//! - [`FileBlockStore`] — one file per block with a 2-level fan-out layout.
//!
//! Blocks are addressed by `blake3(bytes)`, so `put` is idempotent and a
//! single store can be shared by every log on a peer.

mod error;
mod file_store;
mod memory_store;
mod traits;

pub use error::StoreError;
pub use file_store::FileBlockStore;
pub use memory_store::MemoryBlockStore;
pub use traits::BlockStore;
