//! Shared types and identifiers for Reef.
//!
//! This crate defines the identifiers passed between every layer of the
//! workspace: content addresses ([`Hash`]), peer identities ([`PeerId`]),
//! points in the cyclic replication space ([`Coordinate`]) and the role a
//! peer plays for a shared log ([`Role`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ID types
// ---------------------------------------------------------------------------

/// Error returned when parsing a hex-encoded identifier fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    /// The string was not 64 characters long.
    #[error("expected 64 hex characters, got {0}")]
    Length(usize),
    /// The string contained a non-hex character.
    #[error("invalid hex character at position {0}")]
    Character(usize),
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create an ID by hashing arbitrary data with BLAKE3.
            pub fn from_data(data: &[u8]) -> Self {
                Self(blake3::hash(data).into())
            }

            /// Return the raw 32-byte representation.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Short prefix for log lines.
            pub fn short(&self) -> String {
                self.to_string()[..12].to_string()
            }
        }

        impl From<[u8; 32]> for $name {
            fn from(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                decode_hex(s).map(Self)
            }
        }
    };
}

define_id!(
    /// Content address of a block: `blake3(bytes)`.
    ///
    /// Displayed as lowercase hex, which is also the form used for routing
    /// and topic naming.
    Hash
);

define_id!(
    /// Identity of a peer: its ed25519 public key.
    PeerId
);

impl PeerId {
    /// The peer hash: `blake3(public key)`.
    ///
    /// Used to place peers in the replication space and to break ties.
    pub fn hash(&self) -> Hash {
        Hash::from_data(&self.0)
    }
}

fn decode_hex(s: &str) -> Result<[u8; 32], ParseIdError> {
    if s.len() != 64 {
        return Err(ParseIdError::Length(s.len()));
    }

    let mut out = [0u8; 32];
    let bytes = s.as_bytes();

    for (i, slot) in out.iter_mut().enumerate() {
        let hi = hex_value(bytes[2 * i]).ok_or(ParseIdError::Character(2 * i))?;
        let lo = hex_value(bytes[2 * i + 1]).ok_or(ParseIdError::Character(2 * i + 1))?;
        *slot = (hi << 4) | lo;
    }

    Ok(out)
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Replication space
// ---------------------------------------------------------------------------

/// A point in the cyclic replication space `[0, 2^32)`.
pub type Coordinate = u32;

/// Size of the replication space.
pub const COORDINATE_SPACE: u64 = 1 << 32;

/// Largest coordinate; also the fallback for entries that cannot be mapped.
pub const MAX_COORDINATE: Coordinate = u32::MAX;

/// Map the first four bytes of a hash into the replication space.
pub fn coordinate_of(hash: &Hash) -> Coordinate {
    let bytes: [u8; 4] = [hash.0[0], hash.0[1], hash.0[2], hash.0[3]];
    u32::from_le_bytes(bytes)
}

/// The role a peer plays for a shared log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Role {
    /// Stores and serves the entries whose coordinates fall in its range.
    ///
    /// `factor` is the share of the space the peer offers, in `[0, 1]`.
    Replicator {
        /// Declared share of the replication space.
        factor: f64,
    },
    /// Reads and appends but stores nothing on behalf of others.
    Observer,
}

impl Role {
    /// Return the declared factor (zero for observers).
    pub fn factor(&self) -> f64 {
        match self {
            Role::Replicator { factor } => factor.clamp(0.0, 1.0),
            Role::Observer => 0.0,
        }
    }

    /// Whether this role stores entries.
    pub fn is_replicator(&self) -> bool {
        matches!(self, Role::Replicator { factor } if *factor > 0.0)
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Replicator { factor: 1.0 }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
