//! Bookkeeping of which remote peers hold which entries.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use reef_types::{Hash, PeerId};
use tokio::sync::watch;
use tokio::time::Instant;

/// Outcome of waiting for remote replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationStatus {
    /// No wait was requested.
    NotRequested,
    /// Enough peers acknowledged the entry.
    Acknowledged {
        /// Peers that acknowledged.
        peers: Vec<PeerId>,
    },
    /// The wait ran out before enough peers acknowledged. The entry is
    /// still durable locally.
    TimedOut {
        /// Acknowledgements received.
        acknowledged: usize,
        /// Acknowledgements requested.
        required: usize,
    },
}

#[derive(Default)]
struct Acks {
    holders: HashMap<Hash, HashSet<PeerId>>,
    /// Insertion order of hashes, oldest first. May hold hashes already
    /// forgotten; compacted when it outgrows the map.
    order: VecDeque<Hash>,
}

impl Acks {
    fn compact(&mut self, capacity: usize) {
        if self.order.len() > capacity.saturating_mul(2) {
            let holders = &self.holders;
            let mut seen = HashSet::new();
            self.order.retain(|h| holders.contains_key(h) && seen.insert(*h));
        }
    }
}

/// Acknowledgements received per entry, with a change signal for waiters.
///
/// Holds at most `capacity` hashes; the oldest are evicted first. An
/// evicted entry counts as unacknowledged, so it is never pruned on stale
/// evidence.
pub struct AckRegistry {
    capacity: usize,
    acks: Mutex<Acks>,
    changed: watch::Sender<u64>,
}

/// Hashes remembered when no capacity is given.
pub const DEFAULT_ACK_CAPACITY: usize = 65_536;

impl Default for AckRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_CAPACITY)
    }
}

impl AckRegistry {
    /// Create an empty registry remembering up to `capacity` hashes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            acks: Mutex::new(Acks::default()),
            changed: watch::Sender::new(0),
        }
    }

    /// Record that `peer` holds `hash`. Returns whether this is news.
    pub fn record(&self, hash: Hash, peer: PeerId) -> bool {
        let mut acks = self.acks.lock().expect("lock poisoned");
        if !acks.holders.contains_key(&hash) {
            while acks.holders.len() >= self.capacity {
                let Some(old) = acks.order.pop_front() else {
                    break;
                };
                acks.holders.remove(&old);
            }
            acks.order.push_back(hash);
            acks.compact(self.capacity);
        }
        let added = acks.holders.entry(hash).or_default().insert(peer);
        drop(acks);

        if added {
            self.changed.send_modify(|v| *v += 1);
        }
        added
    }

    /// Number of peers holding `hash`.
    pub fn count(&self, hash: &Hash) -> usize {
        self.acks
            .lock()
            .expect("lock poisoned")
            .holders
            .get(hash)
            .map_or(0, HashSet::len)
    }

    /// Peers holding `hash`.
    pub fn peers(&self, hash: &Hash) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .acks
            .lock()
            .expect("lock poisoned")
            .holders
            .get(hash)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Number of hashes with at least one acknowledgement.
    pub fn len(&self) -> usize {
        self.acks.lock().expect("lock poisoned").holders.len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget a departed peer's acknowledgements.
    pub fn remove_peer(&self, peer: &PeerId) {
        let mut acks = self.acks.lock().expect("lock poisoned");
        for holders in acks.holders.values_mut() {
            holders.remove(peer);
        }
        acks.holders.retain(|_, holders| !holders.is_empty());
        acks.compact(self.capacity);
    }

    /// Forget everything about `hash`.
    pub fn forget(&self, hash: &Hash) {
        let mut acks = self.acks.lock().expect("lock poisoned");
        acks.holders.remove(hash);
        acks.compact(self.capacity);
    }

    /// Wait until at least `min` peers hold `hash`, or `timeout` elapses.
    pub async fn wait_for(&self, hash: &Hash, min: usize, timeout: Duration) -> ReplicationStatus {
        let deadline = Instant::now() + timeout;
        // Subscribe before the first check so no ack slips in between.
        let mut changes = self.changed.subscribe();
        loop {
            let acknowledged = self.count(hash);
            if acknowledged >= min {
                return ReplicationStatus::Acknowledged {
                    peers: self.peers(hash),
                };
            }
            tokio::select! {
                res = changes.changed() => {
                    if res.is_err() {
                        return ReplicationStatus::TimedOut { acknowledged, required: min };
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return ReplicationStatus::TimedOut {
                        acknowledged: self.count(hash),
                        required: min,
                    };
                }
            }
        }
    }
}
