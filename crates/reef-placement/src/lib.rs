//! Replication placement for shared logs.
//!
//! Every entry maps to a point in the cyclic coordinate space through a
//! [`ReplicationDomain`]. Every replicating peer advertises a capacity
//! factor; [`ReplicatorSet`] turns the advertisements into contiguous
//! [`ReplicationRange`]s deterministically, so all peers agree on who is
//! responsible for a coordinate without negotiating.
//!
//! Capacity adapts to local load: [`IntervalLagTracker`] measures timer lag
//! and a [`CapacityStrategy`] turns it into a new factor.

pub mod domain;
pub mod error;
pub mod lag;
pub mod range;
pub mod replicators;

pub use domain::{DomainArgs, HashDomain, ReplicationDomain, ValueDomain};
pub use error::PlacementError;
pub use lag::{CapacityStrategy, IntervalLagTracker, LagBackoff};
pub use range::ReplicationRange;
pub use replicators::{CoverageGap, PeerCapacity, ReplicationGap, ReplicatorSet, Selection, assign};
