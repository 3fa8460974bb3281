//! Lamport clocks for causal ordering.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use reef_types::PeerId;
use serde::{Deserialize, Serialize};

/// Logical timestamp attached to every entry.
///
/// Ordered by `(timestamp, id)`: the timestamp carries causality and the
/// peer id breaks ties deterministically between concurrent entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clock {
    /// Peer that authored the entry.
    pub id: PeerId,
    /// Lamport counter.
    pub timestamp: u64,
}

impl Clock {
    /// Create a clock value.
    pub fn new(id: PeerId, timestamp: u64) -> Self {
        Self { id, timestamp }
    }

    /// Clock for a new entry: one past the local counter and every parent.
    pub fn advance<'a>(id: PeerId, local: u64, parents: impl IntoIterator<Item = &'a Clock>) -> Self {
        let max_parent = parents.into_iter().map(|c| c.timestamp).max().unwrap_or(0);
        Self {
            id,
            timestamp: local.max(max_parent) + 1,
        }
    }
}

impl Ord for Clock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Clock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The local Lamport counter of a log.
///
/// `witness` folds in timestamps seen on remote entries so the next local
/// append sorts after everything already known.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    /// Create a clock starting at `start`.
    pub fn new(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    /// Current counter value.
    pub fn current(&self) -> u64 {
        self.counter.load(AtomicOrdering::Acquire)
    }

    /// Advance to at least `timestamp`.
    pub fn witness(&self, timestamp: u64) {
        self.counter.fetch_max(timestamp, AtomicOrdering::AcqRel);
    }
}
