//! In-memory view of the DAG frontier.

use std::collections::HashMap;

use reef_types::Hash;

use crate::entry::Entry;

/// Entries with no known child.
///
/// Keeps a cached sorted view (newest clock first) that is invalidated on
/// every insert or remove.
#[derive(Debug, Default)]
pub struct HeadsIndex {
    heads: HashMap<Hash, Entry>,
    sorted: Option<Vec<Hash>>,
}

impl HeadsIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a head. Returns `false` if it was already present.
    pub fn insert(&mut self, entry: Entry) -> bool {
        let inserted = self.heads.insert(entry.hash(), entry).is_none();
        if inserted {
            self.sorted = None;
        }
        inserted
    }

    /// Remove a head (it gained a child or was dropped).
    pub fn remove(&mut self, hash: &Hash) -> Option<Entry> {
        let removed = self.heads.remove(hash);
        if removed.is_some() {
            self.sorted = None;
        }
        removed
    }

    /// Whether `hash` is currently a head.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.heads.contains_key(hash)
    }

    /// Look up a head entry.
    pub fn get(&self, hash: &Hash) -> Option<&Entry> {
        self.heads.get(hash)
    }

    /// Number of heads.
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    /// Whether there are no heads.
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Drop every head.
    pub fn clear(&mut self) {
        self.heads.clear();
        self.sorted = None;
    }

    /// Head hashes, newest clock first.
    pub fn hashes(&mut self) -> &[Hash] {
        let heads = &self.heads;
        self.sorted.get_or_insert_with(|| {
            let mut entries: Vec<&Entry> = heads.values().collect();
            entries.sort_by(|a, b| b.clock().cmp(a.clock()).then_with(|| b.hash().cmp(&a.hash())));
            entries.into_iter().map(|e| e.hash()).collect()
        })
    }

    /// Head entries, newest clock first.
    pub fn entries(&mut self) -> Vec<Entry> {
        let order = self.hashes().to_vec();
        order
            .iter()
            .filter_map(|h| self.heads.get(h).cloned())
            .collect()
    }

    /// Largest Lamport timestamp among the heads.
    pub fn max_timestamp(&self) -> u64 {
        self.heads
            .values()
            .map(|e| e.clock().timestamp)
            .max()
            .unwrap_or(0)
    }
}
