//! Signing identities.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use reef_types::PeerId;

/// The identity a log signs entries with.
///
/// Signing is an external primitive: anything that can produce an ed25519
/// signature for its public key can author entries.
pub trait Identity: Send + Sync {
    /// Public key; also the peer id.
    fn public_key(&self) -> PeerId;

    /// Sign `bytes`, returning a 64-byte ed25519 signature.
    fn sign(&self, bytes: &[u8]) -> Vec<u8>;
}

/// An in-process ed25519 keypair.
pub struct Ed25519Identity {
    signing_key: SigningKey,
}

impl Ed25519Identity {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Deterministic keypair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }
}

impl From<SigningKey> for Ed25519Identity {
    fn from(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }
}

impl Identity for Ed25519Identity {
    fn public_key(&self) -> PeerId {
        PeerId::from(self.signing_key.verifying_key().to_bytes())
    }

    fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        self.signing_key.sign(bytes).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Ed25519Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Identity")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Verify an ed25519 signature made by `public_key` over `message`.
///
/// Returns `false` if the key bytes are invalid, the signature is not 64
/// bytes, or it doesn't match.
pub fn verify_signature(public_key: &PeerId, message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key.as_bytes()) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(message, &signature).is_ok()
}
