//! Replication of Reef logs across the peers of a pub/sub topic.
//!
//! [`SharedLog`] wraps a [`reef_log::Log`] and keeps it eventually
//! consistent with every other replica: appends are pushed to the peers
//! responsible for them (see [`reef_placement::ReplicatorSet`]), announced
//! heads are joined after fetching any missing history, and entries held by
//! enough other peers can be pruned locally.
//!
//! The network is a collaborator behind [`PubSub`]; [`MemoryNetwork`] is an
//! in-process implementation.

pub mod ack;
pub mod config;
pub mod debounce;
pub mod error;
pub mod fetch;
pub mod memory;
pub mod message;
pub mod network;
pub mod shared_log;

pub use ack::{AckRegistry, ReplicationStatus};
pub use config::SharedLogConfig;
pub use debounce::DebounceAccumulator;
pub use error::SharedLogError;
pub use memory::{MemoryNetwork, MemoryPeer};
pub use message::{LogMessage, MAX_MESSAGE_SIZE};
pub use network::{NetEvent, PubSub, PublishOptions, Subscription};
pub use shared_log::{
    Persist, SharedAppendOptions, SharedAppended, SharedLog, SharedLogOptions, topic_for,
};
