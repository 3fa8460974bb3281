//! Append-only, hash-linked, causally ordered CRDT log.
//!
//! Each [`Entry`] is signed, content-addressed and links to its parents,
//! forming a DAG. A [`Log`] materializes a set of entries and tracks its
//! frontier (the heads). Merging two logs is a [`Log::join`]: idempotent,
//! commutative and associative, so replicas converge regardless of
//! delivery order or duplication.
//!
//! Entry bytes are kept in a shared [`reef_store::BlockStore`]; per-log
//! metadata is kept in an [`Indexer`] ([`EntryIndex`] provides a fjall and
//! an in-memory backend).

pub mod clock;
pub mod dag;
pub mod entry;
pub mod error;
pub mod heads;
pub mod identity;
pub mod index;
pub mod log;
mod pending;

#[cfg(test)]
mod tests;

pub use clock::{Clock, LamportClock};
pub use entry::{CreateEntry, Entry, EntryCipher, EntryType, Meta, Payload, Seal, SignatureRecord};
pub use error::LogError;
pub use heads::HeadsIndex;
pub use identity::{Ed25519Identity, Identity, verify_signature};
pub use index::{EntryIndex, IndexQuery, IndexedEntry, Indexer};
pub use log::{AppendOptions, Appended, CanAppend, JoinOutcome, LoadOptions, Log, LogChange, LogOptions};
