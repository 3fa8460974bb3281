//! Range assignment and replicator selection.

use std::collections::HashMap;
use std::sync::Arc;

use reef_types::{COORDINATE_SPACE, Coordinate, PeerId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{DomainArgs, ReplicationDomain};
use crate::error::PlacementError;
use crate::range::ReplicationRange;

/// A peer's advertised replication capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerCapacity {
    /// Advertising peer.
    pub peer: PeerId,
    /// Share of the space offered, clamped to `[0, 1]`. Zero means observer.
    pub factor: f64,
    /// Advertisement version; older advertisements are ignored.
    pub timestamp: u64,
}

/// Result of [`ReplicatorSet::responsible_replicators`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// Covering peers (nearest range start first), then the nearest
    /// non-covering peers used to fill up to the requested count.
    pub peers: Vec<PeerId>,
    /// How many of `peers` actually cover the coordinate.
    pub covering: usize,
    /// Set when fewer peers cover the coordinate than requested.
    pub gap: Option<ReplicationGap>,
}

impl Selection {
    /// Whether `peer` covers the coordinate.
    pub fn is_covering(&self, peer: &PeerId) -> bool {
        self.peers[..self.covering].contains(peer)
    }
}

/// Under-replication of a single coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationGap {
    /// Peers covering the coordinate.
    pub covered: usize,
    /// Peers requested.
    pub required: usize,
}

/// An arc covered by fewer peers than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageGap {
    /// First coordinate of the arc.
    pub start: Coordinate,
    /// Length of the arc.
    pub width: u64,
    /// Peers covering every coordinate of the arc.
    pub covered: usize,
}

/// Width of the arc for a capacity factor. Rounded up so the total width
/// is never less than the sum of factors times the space.
fn width_for(factor: f64) -> u64 {
    let factor = factor.clamp(0.0, 1.0);
    ((factor * COORDINATE_SPACE as f64).ceil() as u64).min(COORDINATE_SPACE)
}

/// Compute ranges for a set of advertisements.
///
/// Pure: every peer computing this over the same inputs gets the same
/// ranges. Participants are ordered by their domain point (ties broken by
/// peer hash) and their arcs are laid end to end starting at the first
/// point, so when the total width is at least `k` times the space every
/// coordinate is covered by at least `k` distinct peers.
pub fn assign(
    domain: &dyn ReplicationDomain,
    epoch: u64,
    peers: &[PeerCapacity],
) -> Vec<ReplicationRange> {
    let mut points: Vec<(Coordinate, PeerId, u64)> = peers
        .iter()
        .filter_map(|p| {
            let width = width_for(p.factor);
            (width > 0).then(|| {
                let point = domain.from_args(&DomainArgs {
                    peer: p.peer,
                    epoch,
                });
                (point, p.peer, width)
            })
        })
        .collect();
    points.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.hash().cmp(&b.1.hash())));

    let Some(&(first, ..)) = points.first() else {
        return Vec::new();
    };

    let mut cursor = first as u64;
    points
        .into_iter()
        .map(|(_, owner, width)| {
            let range = ReplicationRange {
                start: (cursor % COORDINATE_SPACE) as Coordinate,
                width,
                owner,
                epoch,
            };
            cursor += width;
            range
        })
        .collect()
}

/// Smallest circular distance between two coordinates.
fn circular_distance(a: Coordinate, b: Coordinate) -> u64 {
    let d = a.wrapping_sub(b) as u64;
    d.min(COORDINATE_SPACE - d)
}

/// The set of replicating peers for one log and their current ranges.
///
/// Ranges are recomputed whenever an advertisement, removal or epoch
/// change alters the inputs; readers always see a complete assignment.
pub struct ReplicatorSet {
    domain: Arc<dyn ReplicationDomain>,
    epoch: u64,
    peers: HashMap<PeerId, PeerCapacity>,
    ranges: Vec<ReplicationRange>,
}

impl ReplicatorSet {
    /// Create an empty set.
    pub fn new(domain: Arc<dyn ReplicationDomain>, epoch: u64) -> Self {
        Self {
            domain,
            epoch,
            peers: HashMap::new(),
            ranges: Vec::new(),
        }
    }

    /// The domain used for placement.
    pub fn domain(&self) -> &Arc<dyn ReplicationDomain> {
        &self.domain
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Change the epoch; every peer gets a new point.
    pub fn set_epoch(&mut self, epoch: u64) {
        if self.epoch != epoch {
            self.epoch = epoch;
            self.recompute();
        }
    }

    /// Record an advertisement. Returns `true` if the assignment changed.
    ///
    /// Advertisements no newer than the one already held for the peer are
    /// ignored, so the first of two same-timestamp advertisements wins
    /// everywhere it arrives first. Peers never reuse a timestamp.
    pub fn advertise(&mut self, capacity: PeerCapacity) -> Result<bool, PlacementError> {
        if !capacity.factor.is_finite() {
            return Err(PlacementError::InvalidFactor {
                peer: capacity.peer,
                factor: capacity.factor,
            });
        }

        if let Some(existing) = self.peers.get(&capacity.peer) {
            if existing.timestamp >= capacity.timestamp {
                if *existing != capacity {
                    debug!(
                        peer = %capacity.peer.short(),
                        held = existing.timestamp,
                        got = capacity.timestamp,
                        "ignoring stale advertisement"
                    );
                }
                return Ok(false);
            }
        }

        self.peers.insert(capacity.peer, capacity);
        self.recompute();
        Ok(true)
    }

    /// Forget a peer. Returns `true` if it was known.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let removed = self.peers.remove(peer).is_some();
        if removed {
            self.recompute();
        }
        removed
    }

    fn recompute(&mut self) {
        let peers: Vec<PeerCapacity> = self.peers.values().copied().collect();
        self.ranges = assign(self.domain.as_ref(), self.epoch, &peers);
        debug!(
            epoch = self.epoch,
            peers = self.peers.len(),
            replicators = self.ranges.len(),
            "recomputed replication ranges"
        );
    }

    /// Advertisement held for a peer.
    pub fn capacity(&self, peer: &PeerId) -> Option<&PeerCapacity> {
        self.peers.get(peer)
    }

    /// Every known peer, observers included.
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Current ranges, in layout order.
    pub fn ranges(&self) -> &[ReplicationRange] {
        &self.ranges
    }

    /// Range of a peer, if it replicates.
    pub fn range_of(&self, peer: &PeerId) -> Option<&ReplicationRange> {
        self.ranges.iter().find(|r| r.owner == *peer)
    }

    /// Sum of all range widths.
    pub fn total_width(&self) -> u64 {
        self.ranges.iter().map(|r| r.width).sum()
    }

    /// Peers responsible for `coordinate`.
    ///
    /// Returns fewer than `min_replicas` peers only when fewer replicators
    /// exist; a shortfall in actual coverage is reported through `gap`.
    pub fn responsible_replicators(&self, coordinate: Coordinate, min_replicas: usize) -> Selection {
        let mut covering: Vec<&ReplicationRange> =
            self.ranges.iter().filter(|r| r.covers(coordinate)).collect();
        covering.sort_by(|a, b| {
            a.distance_from_start(coordinate)
                .cmp(&b.distance_from_start(coordinate))
                .then_with(|| a.owner.hash().cmp(&b.owner.hash()))
        });

        let covered = covering.len();
        let mut peers: Vec<PeerId> = covering.iter().map(|r| r.owner).collect();

        if covered < min_replicas {
            let mut others: Vec<&ReplicationRange> =
                self.ranges.iter().filter(|r| !r.covers(coordinate)).collect();
            others.sort_by(|a, b| {
                circular_distance(a.start, coordinate)
                    .cmp(&circular_distance(b.start, coordinate))
                    .then_with(|| a.owner.hash().cmp(&b.owner.hash()))
            });
            peers.extend(others.iter().take(min_replicas - covered).map(|r| r.owner));
        }

        let gap = (covered < min_replicas).then_some(ReplicationGap {
            covered,
            required: min_replicas,
        });

        Selection {
            peers,
            covering: covered,
            gap,
        }
    }

    /// Arcs covered by fewer than `min_replicas` peers.
    pub fn coverage_gaps(&self, min_replicas: usize) -> Vec<CoverageGap> {
        if min_replicas == 0 {
            return Vec::new();
        }

        let mut bounds: Vec<Coordinate> = self
            .ranges
            .iter()
            .filter(|r| r.width < COORDINATE_SPACE)
            .flat_map(|r| [r.start, r.end()])
            .collect();
        bounds.sort_unstable();
        bounds.dedup();

        if bounds.is_empty() {
            // Every range is either empty or spans the whole space.
            let covered = self.ranges.iter().filter(|r| r.covers(0)).count();
            return if covered < min_replicas {
                vec![CoverageGap {
                    start: 0,
                    width: COORDINATE_SPACE,
                    covered,
                }]
            } else {
                Vec::new()
            };
        }

        let mut gaps: Vec<CoverageGap> = Vec::new();
        for (i, &start) in bounds.iter().enumerate() {
            let width = match bounds.get(i + 1) {
                Some(&next) => (next - start) as u64,
                None => COORDINATE_SPACE - start as u64 + bounds[0] as u64,
            };
            let covered = self.ranges.iter().filter(|r| r.covers(start)).count();
            if covered >= min_replicas {
                continue;
            }

            match gaps.last_mut() {
                Some(last)
                    if last.covered == covered
                        && (last.start as u64 + last.width) % COORDINATE_SPACE == start as u64 =>
                {
                    last.width += width;
                }
                _ => gaps.push(CoverageGap {
                    start,
                    width,
                    covered,
                }),
            }
        }
        gaps
    }

    /// Peers whose ranges overlap `range`, excluding its owner.
    ///
    /// Used to bound gossip fan-out to the peers that care about an arc.
    pub fn discovery_group(&self, range: &ReplicationRange) -> Vec<PeerId> {
        let mut group: Vec<PeerId> = self
            .ranges
            .iter()
            .filter(|r| r.owner != range.owner && r.overlaps(range))
            .map(|r| r.owner)
            .collect();
        group.sort_by_key(|p| p.hash());
        group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HashDomain;
    use proptest::prelude::*;
    use reef_types::MAX_COORDINATE;

    /// Domain that places peers at fixed points for exact assertions.
    struct FixedDomain(HashMap<PeerId, Coordinate>);

    impl ReplicationDomain for FixedDomain {
        fn from_args(&self, args: &DomainArgs) -> Coordinate {
            self.0.get(&args.peer).copied().unwrap_or(0)
        }

        fn from_entry(&self, _entry: &reef_log::Entry) -> Coordinate {
            0
        }
    }

    fn peer(n: u8) -> PeerId {
        PeerId::from([n; 32])
    }

    fn cap(n: u8, factor: f64) -> PeerCapacity {
        PeerCapacity {
            peer: peer(n),
            factor,
            timestamp: 1,
        }
    }

    fn fixed_set(points: &[(u8, Coordinate)]) -> ReplicatorSet {
        let map = points.iter().map(|(n, c)| (peer(*n), *c)).collect();
        ReplicatorSet::new(Arc::new(FixedDomain(map)), 0)
    }

    const QUARTER: u64 = COORDINATE_SPACE / 4;

    #[test]
    fn test_ranges_are_laid_end_to_end() {
        let mut set = fixed_set(&[(1, 100), (2, 200), (3, 300)]);
        set.advertise(cap(1, 0.25)).unwrap();
        set.advertise(cap(2, 0.25)).unwrap();
        set.advertise(cap(3, 0.5)).unwrap();

        let ranges = set.ranges();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].owner, peer(1));
        assert_eq!(ranges[0].start, 100);
        assert_eq!(ranges[1].start as u64, 100 + QUARTER);
        assert_eq!(ranges[2].start as u64, 100 + 2 * QUARTER);
        assert_eq!(set.total_width(), COORDINATE_SPACE);
        assert!(set.coverage_gaps(1).is_empty());
    }

    #[test]
    fn test_observers_get_no_range() {
        let mut set = ReplicatorSet::new(Arc::new(HashDomain), 0);
        set.advertise(cap(1, 1.0)).unwrap();
        set.advertise(cap(2, 0.0)).unwrap();

        assert_eq!(set.len(), 2);
        assert_eq!(set.ranges().len(), 1);
        assert!(set.range_of(&peer(2)).is_none());
        assert!(set.range_of(&peer(1)).unwrap().covers(MAX_COORDINATE));
    }

    #[test]
    fn test_stale_advertisement_ignored() {
        let mut set = ReplicatorSet::new(Arc::new(HashDomain), 0);
        let fresh = PeerCapacity {
            peer: peer(1),
            factor: 0.5,
            timestamp: 10,
        };
        let stale = PeerCapacity {
            factor: 1.0,
            timestamp: 9,
            ..fresh
        };

        assert!(set.advertise(fresh).unwrap());
        assert!(!set.advertise(stale).unwrap());
        assert!(!set.advertise(fresh).unwrap(), "repeat is not a change");
        assert_eq!(set.capacity(&peer(1)).unwrap().factor, 0.5);
    }

    #[test]
    fn test_same_timestamp_cannot_replace() {
        let mut set = ReplicatorSet::new(Arc::new(HashDomain), 0);
        let held = PeerCapacity {
            peer: peer(1),
            factor: 0.5,
            timestamp: 10,
        };
        let rival = PeerCapacity {
            factor: 0.25,
            ..held
        };

        assert!(set.advertise(held).unwrap());
        assert!(!set.advertise(rival).unwrap());
        assert_eq!(set.capacity(&peer(1)).unwrap().factor, 0.5);
        let width = set.range_of(&peer(1)).unwrap().width;

        assert!(set.advertise(PeerCapacity { timestamp: 11, ..rival }).unwrap());
        assert!(set.range_of(&peer(1)).unwrap().width < width);
    }

    #[test]
    fn test_invalid_factor_rejected() {
        let mut set = ReplicatorSet::new(Arc::new(HashDomain), 0);
        assert!(matches!(
            set.advertise(cap(1, f64::NAN)),
            Err(PlacementError::InvalidFactor { .. })
        ));
        assert!(set.is_empty());
    }

    #[test]
    fn test_responsible_orders_by_distance_then_fills() {
        let mut set = fixed_set(&[(1, 0), (2, 10), (3, 1000)]);
        // Peer 1 only observes; 2 and 3 split the space in halves.
        set.advertise(cap(1, 0.0)).unwrap();
        set.advertise(cap(2, 0.5)).unwrap();
        set.advertise(cap(3, 0.5)).unwrap();

        let sel = set.responsible_replicators(20, 1);
        assert_eq!(sel.peers, vec![peer(2)]);
        assert_eq!(sel.covering, 1);
        assert!(sel.gap.is_none());

        let sel = set.responsible_replicators(20, 3);
        assert_eq!(sel.covering, 1);
        assert_eq!(sel.peers, vec![peer(2), peer(3)], "only two replicators exist");
        assert_eq!(
            sel.gap,
            Some(ReplicationGap {
                covered: 1,
                required: 3
            })
        );
        assert!(sel.is_covering(&peer(2)));
        assert!(!sel.is_covering(&peer(3)));
    }

    #[test]
    fn test_covering_sorted_by_start_distance() {
        let mut set = fixed_set(&[(1, 0), (2, 5)]);
        set.advertise(cap(1, 1.0)).unwrap();
        set.advertise(cap(2, 1.0)).unwrap();

        // Peer 1 starts at 0, peer 2 right after peer 1's full-width arc,
        // i.e. also at 0; ties fall back to peer hash.
        let sel = set.responsible_replicators(7, 2);
        assert_eq!(sel.covering, 2);
        let mut expected = vec![peer(1), peer(2)];
        expected.sort_by_key(|p| p.hash());
        assert_eq!(sel.peers, expected);
    }

    #[test]
    fn test_coverage_gaps_reported() {
        let mut set = fixed_set(&[(1, 0)]);
        set.advertise(cap(1, 0.25)).unwrap();

        let gaps = set.coverage_gaps(1);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].start as u64, QUARTER);
        assert_eq!(gaps[0].width, 3 * QUARTER);
        assert_eq!(gaps[0].covered, 0);

        let twice = set.coverage_gaps(2);
        let total: u64 = twice.iter().map(|g| g.width).sum();
        assert_eq!(total, COORDINATE_SPACE);
    }

    #[test]
    fn test_empty_set_is_one_gap() {
        let set = ReplicatorSet::new(Arc::new(HashDomain), 0);
        assert_eq!(
            set.coverage_gaps(1),
            vec![CoverageGap {
                start: 0,
                width: COORDINATE_SPACE,
                covered: 0
            }]
        );
        assert!(set.responsible_replicators(5, 2).peers.is_empty());
    }

    #[test]
    fn test_discovery_group() {
        let mut set = fixed_set(&[(1, 0), (2, 1), (3, 2)]);
        set.advertise(cap(1, 0.25)).unwrap();
        set.advertise(cap(2, 0.25)).unwrap();
        set.advertise(cap(3, 0.25)).unwrap();

        let mine = *set.range_of(&peer(2)).unwrap();
        let probe = ReplicationRange {
            start: mine.start,
            width: 1,
            owner: peer(9),
            epoch: 0,
        };
        assert_eq!(set.discovery_group(&probe), vec![peer(2)]);

        let wide = ReplicationRange {
            start: 0,
            width: COORDINATE_SPACE,
            owner: peer(1),
            epoch: 0,
        };
        let mut expected = vec![peer(2), peer(3)];
        expected.sort_by_key(|p| p.hash());
        assert_eq!(set.discovery_group(&wide), expected);
    }

    #[test]
    fn test_epoch_change_moves_ranges() {
        let mut set = ReplicatorSet::new(Arc::new(HashDomain), 0);
        set.advertise(cap(1, 0.3)).unwrap();
        let before = set.ranges()[0].start;
        set.set_epoch(1);
        assert_eq!(set.epoch(), 1);
        assert_ne!(set.ranges()[0].start, before);
    }

    #[test]
    fn test_remove_peer() {
        let mut set = ReplicatorSet::new(Arc::new(HashDomain), 0);
        set.advertise(cap(1, 1.0)).unwrap();
        assert!(set.remove(&peer(1)));
        assert!(!set.remove(&peer(1)));
        assert!(set.ranges().is_empty());
    }

    proptest! {
        /// Three replicators whose arcs add up to at least twice the space
        /// cover every coordinate at least twice.
        #[test]
        fn prop_double_width_means_double_coverage(
            f1 in 0.67f64..=1.0,
            f2 in 0.67f64..=1.0,
            f3 in 0.67f64..=1.0,
            epoch in any::<u64>(),
            seeds in proptest::collection::hash_set(any::<u8>(), 3),
            probes in proptest::collection::vec(any::<u32>(), 32),
        ) {
            let seeds: Vec<u8> = seeds.into_iter().collect();
            let mut set = ReplicatorSet::new(Arc::new(HashDomain), epoch);
            for (seed, factor) in seeds.iter().zip([f1, f2, f3]) {
                set.advertise(cap(*seed, factor)).unwrap();
            }
            prop_assume!(set.total_width() >= 2 * COORDINATE_SPACE);

            prop_assert!(set.coverage_gaps(2).is_empty());
            for c in probes {
                let sel = set.responsible_replicators(c, 2);
                prop_assert!(sel.covering >= 2);
                prop_assert!(sel.gap.is_none());
                let mut distinct = sel.peers.clone();
                distinct.sort();
                distinct.dedup();
                prop_assert_eq!(distinct.len(), sel.peers.len());
            }
        }
    }
}
