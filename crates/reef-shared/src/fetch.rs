//! Remote entry fetching: request correlation, retry policy and route
//! hints.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reef_log::Entry;
use reef_types::{Hash, PeerId};
use tokio::sync::oneshot;

use crate::config::SyncSection;

/// In-flight [`crate::LogMessage::EntryRequest`]s awaiting a response.
#[derive(Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<u64, oneshot::Sender<Vec<Entry>>>>,
}

impl PendingRequests {
    /// Allocate a request ID and the receiver its response is delivered to.
    pub fn register(&self) -> (u64, oneshot::Receiver<Vec<Entry>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().expect("lock poisoned").insert(id, tx);
        (id, rx)
    }

    /// Deliver a response. Returns `false` when nobody waits for `id`
    /// (late or unsolicited).
    pub fn complete(&self, id: u64, entries: Vec<Entry>) -> bool {
        let waiter = self.waiting.lock().expect("lock poisoned").remove(&id);
        match waiter {
            Some(tx) => tx.send(entries).is_ok(),
            None => false,
        }
    }

    /// Stop waiting for `id`.
    pub fn cancel(&self, id: u64) {
        self.waiting.lock().expect("lock poisoned").remove(&id);
    }

    /// Number of requests in flight.
    pub fn len(&self) -> usize {
        self.waiting.lock().expect("lock poisoned").len()
    }

    /// Whether no request is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-attempt timeout and exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long one attempt waits for a response.
    pub timeout: Duration,
    /// Attempts after the first.
    pub retries: u32,
    /// Delay after the first failed attempt.
    pub backoff: Duration,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Total number of attempts.
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

impl From<&SyncSection> for RetryPolicy {
    fn from(sync: &SyncSection) -> Self {
        Self {
            timeout: Duration::from_millis(sync.fetch_timeout_ms),
            retries: sync.fetch_retries,
            backoff: Duration::from_millis(sync.fetch_backoff_ms),
            max_backoff: Duration::from_millis(sync.max_backoff_ms),
        }
    }
}

/// Bounded memory of which peers announced or acknowledged which hashes.
pub struct RouteHints {
    capacity: usize,
    peers: HashMap<Hash, Vec<PeerId>>,
    order: VecDeque<Hash>,
}

/// Peers remembered per hash.
const PEERS_PER_HASH: usize = 8;

impl RouteHints {
    /// Create with room for `capacity` hashes; the oldest are evicted first.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            peers: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Remember that `peer` can serve `hash`.
    pub fn add(&mut self, hash: Hash, peer: PeerId) {
        match self.peers.get_mut(&hash) {
            Some(known) => {
                if !known.contains(&peer) {
                    if known.len() >= PEERS_PER_HASH {
                        known.remove(0);
                    }
                    known.push(peer);
                }
            }
            None => {
                while self.order.len() >= self.capacity {
                    if let Some(old) = self.order.pop_front() {
                        self.peers.remove(&old);
                    }
                }
                self.order.push_back(hash);
                self.peers.insert(hash, vec![peer]);
            }
        }
    }

    /// Peers that may serve any of `hashes`, most recently seen first,
    /// without duplicates.
    pub fn lookup(&self, hashes: &[Hash]) -> Vec<PeerId> {
        let mut out = Vec::new();
        for hash in hashes {
            for peer in self.peers.get(hash).into_iter().flatten().rev() {
                if !out.contains(peer) {
                    out.push(*peer);
                }
            }
        }
        out
    }

    /// Forget a departed peer.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        for known in self.peers.values_mut() {
            known.retain(|p| p != peer);
        }
    }

    /// Number of hashes remembered.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Order in which to ask peers for missing entries: the announcer first,
/// then hinted peers. `local` is never included.
pub fn fetch_candidates(preferred: Option<PeerId>, hinted: Vec<PeerId>, local: PeerId) -> Vec<PeerId> {
    let mut out: Vec<PeerId> = Vec::new();
    for peer in preferred.into_iter().chain(hinted) {
        if peer != local && !out.contains(&peer) {
            out.push(peer);
        }
    }
    out
}
