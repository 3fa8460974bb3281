//! Replication domains: where peers and entries land in the coordinate space.

use reef_log::Entry;
use reef_types::{COORDINATE_SPACE, Coordinate, Hash, MAX_COORDINATE, PeerId, coordinate_of};

/// Inputs for placing a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainArgs {
    /// The peer being placed.
    pub peer: PeerId,
    /// Assignment epoch; bumping it reshuffles every peer's point.
    pub epoch: u64,
}

/// Maps peers and entries into the cyclic coordinate space.
pub trait ReplicationDomain: Send + Sync {
    /// Anchor point of a peer.
    fn from_args(&self, args: &DomainArgs) -> Coordinate;

    /// Coordinate of an entry. Must never fail; entries that cannot be
    /// mapped land on a fixed fallback.
    fn from_entry(&self, entry: &Entry) -> Coordinate;
}

/// Pseudo-random peer point derived from the peer hash and epoch.
fn peer_point(args: &DomainArgs) -> Coordinate {
    let mut input = Vec::with_capacity(40);
    input.extend_from_slice(args.peer.hash().as_bytes());
    input.extend_from_slice(&args.epoch.to_le_bytes());
    coordinate_of(&Hash::from_data(&input))
}

/// The default domain: entries are placed by the hash of their gid, so a
/// whole graph lands on the same replicators.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashDomain;

impl ReplicationDomain for HashDomain {
    fn from_args(&self, args: &DomainArgs) -> Coordinate {
        peer_point(args)
    }

    fn from_entry(&self, entry: &Entry) -> Coordinate {
        coordinate_of(&Hash::from_data(entry.gid().as_bytes()))
    }
}

/// Places entries by a numeric key taken from their decoded value, so that
/// replication locality follows query locality (e.g. a sort key).
///
/// Keys are clamped to `[min, max]` and scaled linearly onto the space.
/// Entries the extractor cannot read map to [`MAX_COORDINATE`].
pub struct ValueDomain<F> {
    min: u64,
    max: u64,
    extract: F,
}

impl<F> ValueDomain<F>
where
    F: Fn(&Entry) -> Option<u64> + Send + Sync,
{
    /// Create a domain over keys in `[min, max]`.
    pub fn new(min: u64, max: u64, extract: F) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
            extract,
        }
    }

    /// Coordinate of a raw key.
    pub fn coordinate_of_key(&self, key: u64) -> Coordinate {
        let span = (self.max - self.min) as u128;
        if span == 0 {
            return 0;
        }
        let offset = (key.clamp(self.min, self.max) - self.min) as u128;
        let scaled = offset * (COORDINATE_SPACE as u128 - 1) / span;
        scaled as Coordinate
    }
}

impl<F> ReplicationDomain for ValueDomain<F>
where
    F: Fn(&Entry) -> Option<u64> + Send + Sync,
{
    fn from_args(&self, args: &DomainArgs) -> Coordinate {
        peer_point(args)
    }

    fn from_entry(&self, entry: &Entry) -> Coordinate {
        match (self.extract)(entry) {
            Some(key) => self.coordinate_of_key(key),
            None => MAX_COORDINATE,
        }
    }
}
