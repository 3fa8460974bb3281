//! Log entry types.

use reef_types::{Hash, PeerId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::LogError;
use crate::identity::{Identity, verify_signature};

/// Whether an entry is a plain append or a cut.
///
/// Ancestors of a `Cut` entry may be pruned without remote confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntryType {
    /// Ordinary append.
    #[default]
    Append,
    /// Marks everything before it as disposable.
    Cut,
}

/// Causal metadata of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Lamport clock of the entry.
    pub clock: Clock,
    /// Graph id shared by every entry descended from the same root append.
    pub gid: String,
    /// Content addresses of the parent entries (DAG edges).
    pub next: Vec<Hash>,
    /// Append or cut.
    pub kind: EntryType,
    /// Optional application metadata carried in the clear.
    pub data: Option<Vec<u8>>,
}

/// Entry payload: plain or sealed for a set of recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Payload bytes in the clear.
    Plain {
        /// Encoded application data.
        data: Vec<u8>,
    },
    /// Payload encrypted by an [`EntryCipher`].
    Sealed {
        /// Cipher output.
        ciphertext: Vec<u8>,
        /// Peers able to open the payload.
        recipients: Vec<PeerId>,
    },
}

/// One signer's signature over the entry's content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// Signer public key.
    pub public_key: PeerId,
    /// 64-byte ed25519 signature.
    pub signature: Vec<u8>,
}

/// Payload encryption, supplied by the host.
///
/// Encryption itself is an external primitive; the log only chooses the
/// sealed payload variant when a cipher is passed to [`Entry::create`].
pub trait EntryCipher: Send + Sync {
    /// Encrypt `plaintext` for `recipients`.
    fn seal(&self, plaintext: &[u8], recipients: &[PeerId]) -> Result<Vec<u8>, LogError>;

    /// Decrypt, or `None` if this peer cannot open the payload.
    fn open(&self, ciphertext: &[u8], recipients: &[PeerId]) -> Option<Vec<u8>>;
}

/// Encryption options for a new entry.
pub struct Seal<'a> {
    /// Cipher used to encrypt the payload.
    pub cipher: &'a dyn EntryCipher,
    /// Recipients of the payload.
    pub recipients: Vec<PeerId>,
}

/// Serialized form of an entry. The hash is derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EntryBody {
    pub(crate) meta: Meta,
    pub(crate) payload: Payload,
    pub(crate) signatures: Vec<SignatureRecord>,
}

/// Signed content of an entry (excludes signatures and hash).
#[derive(Serialize)]
struct SignableContent<'a> {
    meta: &'a Meta,
    payload: &'a Payload,
}

/// An immutable, signed, content-addressed log entry.
///
/// `hash` is `blake3` over the canonical postcard encoding of the meta,
/// payload and signatures; it equals the entry's block-store address.
/// Each signature covers the content digest (meta + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub(crate) hash: Hash,
    pub(crate) body: EntryBody,
}

/// Everything needed to build a new entry.
pub struct CreateEntry<'a> {
    /// Application data.
    pub data: Vec<u8>,
    /// Optional metadata carried in the clear.
    pub meta_data: Option<Vec<u8>>,
    /// Parent entries, already resolved.
    pub next: &'a [Entry],
    /// Append or cut.
    pub kind: EntryType,
    /// Local Lamport counter before this entry.
    pub local_time: u64,
    /// Signers; the first one authors the clock.
    pub signers: &'a [&'a dyn Identity],
    /// Encrypt the payload when set.
    pub seal: Option<Seal<'a>>,
}

impl Entry {
    /// Build, sign and address a new entry.
    ///
    /// The gid is inherited from the first parent, or freshly generated when
    /// `next` is empty. The clock is one past the local counter and every
    /// parent clock.
    pub fn create(props: CreateEntry<'_>) -> Result<Self, LogError> {
        let Some(author) = props.signers.first() else {
            return Err(LogError::Validation("entry needs at least one signer".into()));
        };

        let gid = match props.next.first() {
            Some(parent) => parent.meta().gid.clone(),
            None => fresh_gid(),
        };

        let clock = Clock::advance(
            author.public_key(),
            props.local_time,
            props.next.iter().map(|e| &e.meta().clock),
        );

        let meta = Meta {
            clock,
            gid,
            next: props.next.iter().map(|e| e.hash).collect(),
            kind: props.kind,
            data: props.meta_data,
        };

        let payload = match props.seal {
            Some(seal) => Payload::Sealed {
                ciphertext: seal.cipher.seal(&props.data, &seal.recipients)?,
                recipients: seal.recipients,
            },
            None => Payload::Plain { data: props.data },
        };

        let digest = content_digest(&meta, &payload)?;
        let signatures = props
            .signers
            .iter()
            .map(|signer| SignatureRecord {
                public_key: signer.public_key(),
                signature: signer.sign(digest.as_bytes()),
            })
            .collect();

        let body = EntryBody {
            meta,
            payload,
            signatures,
        };
        let hash = Hash::from_data(&postcard::to_allocvec(&body)?);

        Ok(Self { hash, body })
    }

    /// Decode an entry from its block bytes; the hash is recomputed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LogError> {
        let body: EntryBody = postcard::from_bytes(bytes)?;
        Ok(Self {
            hash: Hash::from_data(bytes),
            body,
        })
    }

    /// Canonical block bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, LogError> {
        Ok(postcard::to_allocvec(&self.body)?)
    }

    /// Content address.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Causal metadata.
    pub fn meta(&self) -> &Meta {
        &self.body.meta
    }

    /// Payload (plain or sealed).
    pub fn payload(&self) -> &Payload {
        &self.body.payload
    }

    /// Signatures over the content digest.
    pub fn signatures(&self) -> &[SignatureRecord] {
        &self.body.signatures
    }

    /// Shorthand for `meta().clock`.
    pub fn clock(&self) -> &Clock {
        &self.body.meta.clock
    }

    /// Shorthand for `meta().next`.
    pub fn next(&self) -> &[Hash] {
        &self.body.meta.next
    }

    /// Shorthand for `meta().gid`.
    pub fn gid(&self) -> &str {
        &self.body.meta.gid
    }

    /// Whether the payload is sealed.
    pub fn is_sealed(&self) -> bool {
        matches!(self.body.payload, Payload::Sealed { .. })
    }

    /// Plaintext payload bytes, opening sealed payloads with `cipher`.
    pub fn data(&self, cipher: Option<&dyn EntryCipher>) -> Option<Vec<u8>> {
        match &self.body.payload {
            Payload::Plain { data } => Some(data.clone()),
            Payload::Sealed {
                ciphertext,
                recipients,
            } => cipher.and_then(|c| c.open(ciphertext, recipients)),
        }
    }

    /// Decode a plain postcard payload into a value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, LogError> {
        match &self.body.payload {
            Payload::Plain { data } => Ok(postcard::from_bytes(data)?),
            Payload::Sealed { .. } => Err(LogError::Validation(
                "cannot decode a sealed payload without a cipher".into(),
            )),
        }
    }

    /// Recompute the hash and check it against the stored one.
    pub fn verify_hash(&self) -> bool {
        match postcard::to_allocvec(&self.body) {
            Ok(bytes) => Hash::from_data(&bytes) == self.hash,
            Err(_) => false,
        }
    }

    /// Check every signature over the content digest.
    ///
    /// An entry without signatures is never valid.
    pub fn verify_signatures(&self) -> bool {
        if self.body.signatures.is_empty() {
            return false;
        }
        let Ok(digest) = content_digest(&self.body.meta, &self.body.payload) else {
            return false;
        };
        self.body
            .signatures
            .iter()
            .all(|s| verify_signature(&s.public_key, digest.as_bytes(), &s.signature))
    }

    /// Full integrity check: hash, signatures, and that the clock author signed.
    pub fn verify(&self) -> bool {
        self.verify_hash()
            && self.verify_signatures()
            && self
                .body
                .signatures
                .iter()
                .any(|s| s.public_key == self.body.meta.clock.id)
    }
}

/// blake3 over the signable content.
pub(crate) fn content_digest(meta: &Meta, payload: &Payload) -> Result<Hash, LogError> {
    let bytes = postcard::to_allocvec(&SignableContent { meta, payload })?;
    Ok(Hash::from_data(&bytes))
}

fn fresh_gid() -> String {
    let bytes: [u8; 32] = rand::random();
    Hash::from(bytes).to_string()
}
