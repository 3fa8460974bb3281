//! Coalescing of bursts of work into batches.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

struct Batch<V> {
    first: Instant,
    last: Instant,
    items: Vec<V>,
}

/// Collects items per key and releases them as one batch once the key has
/// been quiet for `delay`, or once `max_wait` has passed since its first
/// item so a steady trickle cannot starve it.
pub struct DebounceAccumulator<K, V> {
    delay: Duration,
    max_wait: Duration,
    batches: HashMap<K, Batch<V>>,
}

impl<K: Eq + Hash + Clone, V> DebounceAccumulator<K, V> {
    /// Create an accumulator. `max_wait` is raised to at least `delay`.
    pub fn new(delay: Duration, max_wait: Duration) -> Self {
        Self {
            delay,
            max_wait: max_wait.max(delay),
            batches: HashMap::new(),
        }
    }

    /// Add items under `key` at `now`.
    pub fn push(&mut self, key: K, items: impl IntoIterator<Item = V>, now: Instant) {
        let batch = self.batches.entry(key).or_insert_with(|| Batch {
            first: now,
            last: now,
            items: Vec::new(),
        });
        batch.last = now;
        batch.items.extend(items);
    }

    /// Remove and return every batch that is due at `now`.
    pub fn take_ready(&mut self, now: Instant) -> Vec<(K, Vec<V>)> {
        let due: Vec<K> = self
            .batches
            .iter()
            .filter(|(_, b)| {
                now.saturating_duration_since(b.last) >= self.delay
                    || now.saturating_duration_since(b.first) >= self.max_wait
            })
            .map(|(k, _)| k.clone())
            .collect();

        due.into_iter()
            .filter_map(|k| self.batches.remove(&k).map(|b| (k, b.items)))
            .collect()
    }

    /// Remove and return everything regardless of timing.
    pub fn drain(&mut self) -> Vec<(K, Vec<V>)> {
        self.batches.drain().map(|(k, b)| (k, b.items)).collect()
    }

    /// Earliest instant at which some batch becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.batches
            .values()
            .map(|b| (b.last + self.delay).min(b.first + self.max_wait))
            .min()
    }

    /// Number of keys with a pending batch.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_burst_is_coalesced() {
        let mut acc = DebounceAccumulator::new(100 * MS, 1000 * MS);
        let t0 = Instant::now();
        for i in 0..10u32 {
            acc.push("peer", [i], t0 + i * 10 * MS);
        }
        assert!(acc.take_ready(t0 + 150 * MS).is_empty());
        assert_eq!(acc.next_due(), Some(t0 + 190 * MS));

        let ready = acc.take_ready(t0 + 190 * MS);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].1, (0..10).collect::<Vec<_>>());
        assert!(acc.is_empty());
    }

    #[test]
    fn test_max_wait_bounds_starvation() {
        let mut acc = DebounceAccumulator::new(100 * MS, 300 * MS);
        let t0 = Instant::now();
        let mut flushed = Vec::new();
        for step in 0..40u32 {
            let now = t0 + step * 50 * MS;
            acc.push(1u8, [step], now);
            flushed.extend(acc.take_ready(now));
        }
        assert!(!flushed.is_empty(), "steady trickle must still flush");
    }

    #[test]
    fn test_keys_flush_independently() {
        let mut acc = DebounceAccumulator::new(100 * MS, 1000 * MS);
        let t0 = Instant::now();
        acc.push('a', [1], t0);
        acc.push('b', [2], t0 + 80 * MS);
        let ready = acc.take_ready(t0 + 100 * MS);
        assert_eq!(ready, vec![('a', vec![1])]);
        assert_eq!(acc.len(), 1);
        assert_eq!(acc.drain(), vec![('b', vec![2])]);
    }
}
