//! Protocol messages exchanged on a shared log's topic.
//!
//! Messages are postcard-encoded and framed with a 4-byte big-endian length
//! prefix.

use bytes::{BufMut, Bytes, BytesMut};
use reef_log::Entry;
use reef_placement::PeerCapacity;
use reef_types::Hash;
use serde::{Deserialize, Serialize};

use crate::error::SharedLogError;

/// Maximum encoded message size (64 MiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Messages exchanged between peers replicating the same log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogMessage {
    /// Announcement of new heads.
    ///
    /// Carries the serialized head entries themselves; receivers fetch
    /// whatever ancestors they lack with [`LogMessage::EntryRequest`].
    Heads {
        /// Serialized entries, as produced by [`Entry::to_bytes`].
        entries: Vec<Vec<u8>>,
    },

    /// Request entries (and some of their ancestors) by hash.
    EntryRequest {
        /// Correlates the [`LogMessage::EntryResponse`].
        request_id: u64,
        /// Entries wanted.
        hashes: Vec<Hash>,
        /// Ancestor generations to include beyond the wanted entries.
        max_depth: u32,
    },

    /// Response to a [`LogMessage::EntryRequest`].
    EntryResponse {
        /// ID of the request being answered.
        request_id: u64,
        /// Serialized entries found, parents first. Empty if none were.
        entries: Vec<Vec<u8>>,
    },

    /// The sender has materialized these entries.
    ReplicationAck {
        /// Hashes now held by the sender.
        hashes: Vec<Hash>,
    },

    /// Capacity advertisement. A factor of zero means observer.
    Replicating(PeerCapacity),

    /// Ask the receivers to advertise their capacity.
    RequestReplicationInfo,
}

impl LogMessage {
    /// Build a [`LogMessage::Heads`] from entries.
    pub fn heads(entries: &[Entry]) -> Result<Self, SharedLogError> {
        Ok(LogMessage::Heads {
            entries: serialize_entries(entries)?,
        })
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            LogMessage::Heads { .. } => "heads",
            LogMessage::EntryRequest { .. } => "entry_request",
            LogMessage::EntryResponse { .. } => "entry_response",
            LogMessage::ReplicationAck { .. } => "replication_ack",
            LogMessage::Replicating(_) => "replicating",
            LogMessage::RequestReplicationInfo => "request_replication_info",
        }
    }

    /// Encode as a length-prefixed frame.
    pub fn encode(&self) -> Result<Bytes, SharedLogError> {
        let payload =
            postcard::to_allocvec(self).map_err(|e| SharedLogError::Codec(e.to_string()))?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(SharedLogError::Codec(format!(
                "message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
                payload.len()
            )));
        }
        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Decode a length-prefixed frame. The frame must contain exactly one
    /// message.
    pub fn decode(frame: &[u8]) -> Result<Self, SharedLogError> {
        let Some((prefix, payload)) = frame.split_first_chunk::<LENGTH_PREFIX>() else {
            return Err(SharedLogError::Codec(format!(
                "truncated frame: {} bytes",
                frame.len()
            )));
        };
        let len = u32::from_be_bytes(*prefix) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(SharedLogError::Codec(format!(
                "message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"
            )));
        }
        if payload.len() != len {
            return Err(SharedLogError::Codec(format!(
                "frame length mismatch: header says {len}, got {}",
                payload.len()
            )));
        }
        postcard::from_bytes(payload).map_err(|e| SharedLogError::Codec(e.to_string()))
    }
}

/// Serialize entries for the wire.
pub fn serialize_entries(entries: &[Entry]) -> Result<Vec<Vec<u8>>, SharedLogError> {
    entries
        .iter()
        .map(|e| e.to_bytes().map_err(SharedLogError::from))
        .collect()
}

/// Parse entries from the wire, dropping (and returning the count of)
/// those that do not decode.
pub fn deserialize_entries(raw: &[Vec<u8>]) -> (Vec<Entry>, usize) {
    let mut entries = Vec::with_capacity(raw.len());
    let mut invalid = 0;
    for bytes in raw {
        match Entry::from_bytes(bytes) {
            Ok(entry) => entries.push(entry),
            Err(_) => invalid += 1,
        }
    }
    (entries, invalid)
}
