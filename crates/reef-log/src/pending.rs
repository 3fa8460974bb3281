//! Buffer for entries awaiting missing parents.
//!
//! When a joined entry references parents that are neither materialized
//! nor present in the block store, it is parked here. Every later join
//! drains the buffer so the entry is applied as soon as its ancestry is
//! complete.

use std::collections::{BTreeSet, HashMap};

use reef_types::Hash;
use tracing::trace;

use crate::entry::Entry;

/// Entries deferred until their parents arrive.
#[derive(Debug, Default)]
pub(crate) struct PendingEntries {
    entries: HashMap<Hash, Entry>,
}

impl PendingEntries {
    /// Park an entry.
    pub fn insert(&mut self, entry: Entry) {
        trace!(hash = %entry.hash(), "deferring entry with incomplete ancestry");
        self.entries.insert(entry.hash(), entry);
    }

    /// Take every parked entry out of the buffer.
    pub fn drain(&mut self) -> Vec<Entry> {
        self.entries.drain().map(|(_, e)| e).collect()
    }

    /// Number of parked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Parent hashes referenced by parked entries that are not parked themselves.
    pub fn frontier(&self) -> BTreeSet<Hash> {
        self.entries
            .values()
            .flat_map(|e| e.next().iter().copied())
            .filter(|h| !self.entries.contains_key(h))
            .collect()
    }

    /// Forget every parked entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
