//! Arcs of the cyclic coordinate space.

use reef_types::{COORDINATE_SPACE, Coordinate, PeerId};
use serde::{Deserialize, Serialize};

/// A contiguous, wrapping arc `[start, start + width)` owned by one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRange {
    /// First covered coordinate.
    pub start: Coordinate,
    /// Number of covered coordinates, at most [`COORDINATE_SPACE`].
    pub width: u64,
    /// Peer that replicates this arc.
    pub owner: PeerId,
    /// Epoch the arc was computed for.
    pub epoch: u64,
}

impl ReplicationRange {
    /// Whether `coordinate` falls inside the arc.
    pub fn covers(&self, coordinate: Coordinate) -> bool {
        if self.width >= COORDINATE_SPACE {
            return true;
        }
        self.distance_from_start(coordinate) < self.width
    }

    /// Clockwise distance from `start` to `coordinate`.
    pub fn distance_from_start(&self, coordinate: Coordinate) -> u64 {
        coordinate.wrapping_sub(self.start) as u64
    }

    /// Exclusive end of the arc, wrapped into the space.
    pub fn end(&self) -> Coordinate {
        ((self.start as u64 + self.width) % COORDINATE_SPACE) as Coordinate
    }

    /// Whether two arcs share at least one coordinate.
    pub fn overlaps(&self, other: &ReplicationRange) -> bool {
        if self.width == 0 || other.width == 0 {
            return false;
        }
        self.covers(other.start) || other.covers(self.start)
    }

    /// Whether every coordinate of `other` is inside this arc.
    pub fn contains(&self, other: &ReplicationRange) -> bool {
        if self.width >= COORDINATE_SPACE || other.width == 0 {
            return true;
        }
        other.width <= self.width && self.distance_from_start(other.start) + other.width <= self.width
    }

    /// Share of the space covered, in `[0, 1]`.
    pub fn factor(&self) -> f64 {
        self.width as f64 / COORDINATE_SPACE as f64
    }
}
