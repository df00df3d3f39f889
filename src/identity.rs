//! # Identity and PeerId
//!
//! This module defines the identity types used throughout Filament:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`PeerId`]: 32-byte identifier derived from the Ed25519 public key
//!
//! ## Identity Model
//!
//! Filament uses a simple identity model: **PeerId = Ed25519 Public Key**.
//! The key's canonical 32-byte encoding is the id body; possession of the
//! private key proves the identity, no external CA is involved.
//!
//! ## Textual Form
//!
//! The textual form is base58btc over the identity-multihash envelope
//! (`0x00 0x24` header followed by the protobuf-framed key), which yields
//! the familiar `12D3KooW…` shape. [`PeerId::encode_base58`] and
//! [`PeerId::decode_base58`] are exact inverses.
//!
//! ## Randomness
//!
//! The core owns no entropy source. [`Keypair::generate`] consumes bytes
//! from a caller-provided RNG so that tests can seed it and obtain
//! reproducible identities.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};

/// Length of a PeerId body (one Ed25519 public key).
pub const PEER_ID_LEN: usize = 32;

/// Identity-multihash envelope prepended to the key bytes in the textual
/// form: multihash code 0x00 (identity), length 0x24, then the protobuf
/// framing for an Ed25519 public key (`type = 1`, 32-byte data field).
const MULTIHASH_PREFIX: [u8; 6] = [0x00, 0x24, 0x08, 0x01, 0x12, 0x20];

/// Total length of the textual-form payload before base58 encoding.
const ENCODED_LEN: usize = MULTIHASH_PREFIX.len() + PEER_ID_LEN;

// ============================================================================
// Errors
// ============================================================================

/// Errors from identity construction and codec operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    /// The bytes are not a valid Ed25519 point encoding.
    BadKey,
    /// The string is not valid base58btc or decodes to the wrong shape.
    BadBase58,
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::BadKey => write!(f, "invalid Ed25519 public key encoding"),
            KeyError::BadBase58 => write!(f, "invalid base58 peer id"),
        }
    }
}

impl std::error::Error for KeyError {}

// ============================================================================
// Keypair
// ============================================================================

/// Ed25519 signing keypair backing a local peer's identity.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the injected RNG.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        Self { signing_key }
    }

    /// Reconstruct a keypair from its 32-byte secret seed.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&bytes),
        }
    }

    /// The public half as its canonical 32-byte encoding.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The PeerId derived from this keypair.
    pub fn peer_id(&self) -> PeerId {
        PeerId(self.public_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secret half is never printed.
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish()
    }
}

// ============================================================================
// PeerId
// ============================================================================

/// A 32-byte peer identifier: the canonical encoding of an Ed25519 public
/// key. Equality is byte equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Wrap raw id bytes. The caller asserts these came from a valid key;
    /// use [`PeerId::from_public_key`] for untrusted input.
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Validate an untrusted 32-byte Ed25519 encoding and derive the id.
    pub fn from_public_key(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; PEER_ID_LEN] = bytes.try_into().map_err(|_| KeyError::BadKey)?;
        VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::BadKey)?;
        Ok(Self(arr))
    }

    /// The raw id bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Encode to the canonical base58btc textual form.
    pub fn encode_base58(&self) -> String {
        let mut payload = [0u8; ENCODED_LEN];
        payload[..MULTIHASH_PREFIX.len()].copy_from_slice(&MULTIHASH_PREFIX);
        payload[MULTIHASH_PREFIX.len()..].copy_from_slice(&self.0);
        bs58::encode(payload).into_string()
    }

    /// Decode the canonical base58btc textual form.
    pub fn decode_base58(s: &str) -> Result<Self, KeyError> {
        let payload = bs58::decode(s)
            .into_vec()
            .map_err(|_| KeyError::BadBase58)?;
        if payload.len() != ENCODED_LEN || payload[..MULTIHASH_PREFIX.len()] != MULTIHASH_PREFIX {
            return Err(KeyError::BadBase58);
        }
        let mut bytes = [0u8; PEER_ID_LEN];
        bytes.copy_from_slice(&payload[MULTIHASH_PREFIX.len()..]);
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode_base58())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form keeps log lines readable.
        let full = self.encode_base58();
        let tail = &full[full.len().saturating_sub(8)..];
        write!(f, "PeerId(…{tail})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn peer_id_round_trip_preserves_bytes() {
        let mut rng = StdRng::seed_from_u64(7);
        let keypair = Keypair::generate(&mut rng);
        let id = keypair.peer_id();
        assert_eq!(*id.as_bytes(), keypair.public_bytes());
    }

    #[test]
    fn base58_encode_decode_inverse() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..8 {
            let id = Keypair::generate(&mut rng).peer_id();
            let text = id.encode_base58();
            assert_eq!(PeerId::decode_base58(&text).unwrap(), id);
        }
    }

    #[test]
    fn all_zero_key_is_valid_and_canonical() {
        // 0x00…00 is a valid (small-order) point; the id must accept it
        // and its textual form carries the identity-multihash prefix.
        let id = PeerId::from_public_key(&[0u8; 32]).expect("zero key is a valid encoding");
        let text = id.encode_base58();
        assert!(text.starts_with("12D3KooW"), "got {text}");
        assert_eq!(PeerId::decode_base58(&text).unwrap(), id);
    }

    #[test]
    fn from_public_key_rejects_wrong_length() {
        assert_eq!(PeerId::from_public_key(&[0u8; 31]), Err(KeyError::BadKey));
        assert_eq!(PeerId::from_public_key(&[0u8; 33]), Err(KeyError::BadKey));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(PeerId::decode_base58("not-base58-0OIl"), Err(KeyError::BadBase58));
        // Valid base58 but wrong payload shape.
        let short = bs58::encode([1u8, 2, 3]).into_string();
        assert_eq!(PeerId::decode_base58(&short), Err(KeyError::BadBase58));
    }

    #[test]
    fn generation_is_deterministic_under_seed() {
        let a = Keypair::generate(&mut StdRng::seed_from_u64(42)).peer_id();
        let b = Keypair::generate(&mut StdRng::seed_from_u64(42)).peer_id();
        assert_eq!(a, b);
    }
}
