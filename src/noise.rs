//! # Noise XX Handshake
//!
//! Mutual-authentication handshake producing two directional AEAD ciphers,
//! implemented as an explicit state machine over the
//! `Noise_XX_25519_ChaChaPoly_SHA256` suite:
//!
//! ```text
//!   -> e
//!   <- e, ee, s, es
//!   -> s, se
//! ```
//!
//! ## State Machine
//!
//! | Stage | Meaning |
//! |-------|---------|
//! | `Init` | No message processed yet |
//! | `EphSent` / `EphRecv` | First message written / read |
//! | `StaticSent` / `StaticRecv` | Second message written / read |
//! | `Established` | Third message processed; [`Session::finish`] is valid |
//! | `Failed` | Authentication or framing failure; terminal |
//!
//! Driving the machine out of turn fails with [`NoiseError::OutOfTurn`]
//! and leaves the state unchanged; an AEAD tag mismatch transitions to
//! `Failed` permanently.
//!
//! ## Payloads
//!
//! Handshake payloads ride encrypted once a key is mixed (messages two and
//! three). Filament uses them to carry each side's Ed25519 identity key,
//! binding the PeerId to the transport session.
//!
//! ## Randomness
//!
//! The ephemeral key is drawn from the caller-provided RNG at session
//! construction; the core holds no entropy source of its own.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

type HmacSha256 = Hmac<Sha256>;

/// Hash output and DH output length for this suite.
const HASH_LEN: usize = 32;

/// X25519 public key length on the wire.
const DH_LEN: usize = 32;

/// Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

/// Suite name; exactly [`HASH_LEN`] bytes, so it seeds the transcript hash
/// without padding.
const PROTOCOL_NAME: &[u8; 32] = b"Noise_XX_25519_ChaChaPoly_SHA256";

// ============================================================================
// Errors
// ============================================================================

/// Failures of the handshake or of established-session ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseError {
    /// The operation is not valid in the current stage (wrong turn, or
    /// `finish` before `Established`).
    OutOfTurn,
    /// An AEAD tag did not verify; the session is dead.
    AuthFail,
    /// A handshake message was shorter or longer than its pattern allows.
    Malformed,
    /// A cipher nonce counter reached its ceiling.
    NonceOverflow,
}

impl std::fmt::Display for NoiseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoiseError::OutOfTurn => write!(f, "handshake message out of turn"),
            NoiseError::AuthFail => write!(f, "authentication tag mismatch"),
            NoiseError::Malformed => write!(f, "malformed handshake message"),
            NoiseError::NonceOverflow => write!(f, "cipher nonce exhausted"),
        }
    }
}

impl std::error::Error for NoiseError {}

// ============================================================================
// HKDF (HMAC-SHA256 chain per the Noise specification)
// ============================================================================

fn hmac(key: &[u8], data: &[&[u8]]) -> [u8; HASH_LEN] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    for part in data {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Two-output HKDF: `temp = HMAC(ck, ikm)`, `out1 = HMAC(temp, 0x01)`,
/// `out2 = HMAC(temp, out1 || 0x02)`.
fn hkdf(ck: &[u8; HASH_LEN], ikm: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let temp = hmac(ck, &[ikm]);
    let out1 = hmac(&temp, &[&[0x01]]);
    let out2 = hmac(&temp, &[&out1, &[0x02]]);
    (out1, out2)
}

// ============================================================================
// CipherState
// ============================================================================

/// One directional AEAD cipher with a monotonic nonce counter.
///
/// Nonces are never reused: each seal or successful open consumes exactly
/// one counter value, and the counter ceiling surfaces as
/// [`NoiseError::NonceOverflow`] instead of wrapping.
pub struct CipherState {
    cipher: ChaCha20Poly1305,
    nonce: u64,
}

impl CipherState {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            nonce: 0,
        }
    }

    /// 96-bit nonce: four zero bytes then the counter, little-endian.
    fn nonce_bytes(counter: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&counter.to_le_bytes());
        Nonce::from(bytes)
    }

    fn next_nonce(&mut self) -> Result<u64, NoiseError> {
        // The final counter value is reserved, never used for a record.
        if self.nonce == u64::MAX {
            return Err(NoiseError::NonceOverflow);
        }
        let counter = self.nonce;
        self.nonce += 1;
        Ok(counter)
    }

    /// Encrypt `plaintext`, authenticating `ad`, consuming one nonce.
    pub fn seal(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let counter = self.next_nonce()?;
        self.cipher
            .encrypt(
                &Self::nonce_bytes(counter),
                Payload { msg: plaintext, aad: ad },
            )
            .map_err(|_| NoiseError::AuthFail)
    }

    /// Decrypt `ciphertext`, authenticating `ad`. The nonce advances only
    /// on success so a garbled record cannot desynchronise the counter.
    pub fn open(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        if self.nonce == u64::MAX {
            return Err(NoiseError::NonceOverflow);
        }
        let plaintext = self
            .cipher
            .decrypt(
                &Self::nonce_bytes(self.nonce),
                Payload { msg: ciphertext, aad: ad },
            )
            .map_err(|_| NoiseError::AuthFail)?;
        self.nonce += 1;
        Ok(plaintext)
    }

    /// Current counter value (the nonce the next record will use).
    pub fn nonce(&self) -> u64 {
        self.nonce
    }
}

// ============================================================================
// Handshake session
// ============================================================================

/// Which end of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Handshake progress. See the module docs for the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    EphSent,
    EphRecv,
    StaticSent,
    StaticRecv,
    Established,
    Failed,
}

/// A Noise XX handshake in progress.
pub struct Session {
    role: Role,
    stage: Stage,
    /// Transcript hash.
    h: [u8; HASH_LEN],
    /// Chaining key.
    ck: [u8; HASH_LEN],
    /// Current handshake cipher key, present once a DH output is mixed.
    k: Option<[u8; 32]>,
    /// Handshake cipher nonce; resets on every mix.
    n: u64,
    e: StaticSecret,
    s: StaticSecret,
    re: Option<PublicKey>,
    rs: Option<PublicKey>,
}

impl Session {
    /// Start a session as the connection initiator.
    pub fn initiate<R: RngCore + CryptoRng>(
        rng: &mut R,
        prologue: &[u8],
        static_key: StaticSecret,
    ) -> Self {
        Self::new(rng, Role::Initiator, prologue, static_key)
    }

    /// Start a session as the connection responder.
    pub fn respond<R: RngCore + CryptoRng>(
        rng: &mut R,
        prologue: &[u8],
        static_key: StaticSecret,
    ) -> Self {
        Self::new(rng, Role::Responder, prologue, static_key)
    }

    fn new<R: RngCore + CryptoRng>(
        rng: &mut R,
        role: Role,
        prologue: &[u8],
        static_key: StaticSecret,
    ) -> Self {
        let h = *PROTOCOL_NAME;
        let ck = h;
        let mut session = Self {
            role,
            stage: Stage::Init,
            h,
            ck,
            k: None,
            n: 0,
            e: StaticSecret::random_from_rng(rng),
            s: static_key,
            re: None,
            rs: None,
        };
        session.mix_hash(prologue);
        session
    }

    /// Current stage, for connection bookkeeping.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    fn mix_key(&mut self, ikm: &[u8]) {
        let (ck, k) = hkdf(&self.ck, ikm);
        self.ck = ck;
        self.k = Some(k);
        self.n = 0;
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let out = match self.k {
            Some(key) => {
                let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
                let ciphertext = cipher
                    .encrypt(
                        &CipherState::nonce_bytes(self.n),
                        Payload { msg: plaintext, aad: &self.h },
                    )
                    .map_err(|_| NoiseError::AuthFail)?;
                self.n += 1;
                ciphertext
            }
            None => plaintext.to_vec(),
        };
        self.mix_hash(&out);
        Ok(out)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let out = match self.k {
            Some(key) => {
                let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
                let plaintext = cipher
                    .decrypt(
                        &CipherState::nonce_bytes(self.n),
                        Payload { msg: ciphertext, aad: &self.h },
                    )
                    .map_err(|_| NoiseError::AuthFail)?;
                self.n += 1;
                plaintext
            }
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext);
        Ok(out)
    }

    /// Produce the next handshake message carrying `payload`.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        match (self.role, self.stage) {
            // -> e
            (Role::Initiator, Stage::Init) => {
                let e_pub = PublicKey::from(&self.e);
                let mut msg = e_pub.as_bytes().to_vec();
                self.mix_hash(e_pub.as_bytes());
                let enc = self.encrypt_and_hash(payload)?;
                msg.extend_from_slice(&enc);
                self.stage = Stage::EphSent;
                Ok(msg)
            }
            // <- e, ee, s, es
            (Role::Responder, Stage::EphRecv) => {
                let re = self.re.ok_or(NoiseError::OutOfTurn)?;
                let e_pub = PublicKey::from(&self.e);
                let mut msg = e_pub.as_bytes().to_vec();
                self.mix_hash(e_pub.as_bytes());
                let ee = self.e.diffie_hellman(&re);
                self.mix_key(ee.as_bytes());
                let s_pub = PublicKey::from(&self.s);
                let enc_s = self.encrypt_and_hash(s_pub.as_bytes())?;
                msg.extend_from_slice(&enc_s);
                let es = self.s.diffie_hellman(&re);
                self.mix_key(es.as_bytes());
                let enc = self.encrypt_and_hash(payload)?;
                msg.extend_from_slice(&enc);
                self.stage = Stage::StaticSent;
                Ok(msg)
            }
            // -> s, se
            (Role::Initiator, Stage::StaticRecv) => {
                let re = self.re.ok_or(NoiseError::OutOfTurn)?;
                let s_pub = PublicKey::from(&self.s);
                let mut msg = self.encrypt_and_hash(s_pub.as_bytes())?;
                let se = self.s.diffie_hellman(&re);
                self.mix_key(se.as_bytes());
                let enc = self.encrypt_and_hash(payload)?;
                msg.extend_from_slice(&enc);
                self.stage = Stage::Established;
                Ok(msg)
            }
            (_, Stage::Failed) => Err(NoiseError::AuthFail),
            _ => Err(NoiseError::OutOfTurn),
        }
    }

    /// Consume the peer's next handshake message, returning its payload.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
        match (self.role, self.stage) {
            // -> e
            (Role::Responder, Stage::Init) => {
                if message.len() < DH_LEN {
                    self.stage = Stage::Failed;
                    return Err(NoiseError::Malformed);
                }
                let re = public_key(&message[..DH_LEN]);
                self.re = Some(re);
                self.mix_hash(re.as_bytes());
                let payload = self.decrypt_and_hash(&message[DH_LEN..])?;
                self.stage = Stage::EphRecv;
                Ok(payload)
            }
            // <- e, ee, s, es
            (Role::Initiator, Stage::EphSent) => {
                if message.len() < DH_LEN + DH_LEN + TAG_LEN + TAG_LEN {
                    self.stage = Stage::Failed;
                    return Err(NoiseError::Malformed);
                }
                let re = public_key(&message[..DH_LEN]);
                self.re = Some(re);
                self.mix_hash(re.as_bytes());
                let ee = self.e.diffie_hellman(&re);
                self.mix_key(ee.as_bytes());
                let enc_s = &message[DH_LEN..DH_LEN + DH_LEN + TAG_LEN];
                let rs_bytes = match self.decrypt_and_hash(enc_s) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        self.stage = Stage::Failed;
                        return Err(e);
                    }
                };
                let rs = public_key(&rs_bytes);
                self.rs = Some(rs);
                let es = self.e.diffie_hellman(&rs);
                self.mix_key(es.as_bytes());
                let payload = match self.decrypt_and_hash(&message[DH_LEN + DH_LEN + TAG_LEN..]) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        self.stage = Stage::Failed;
                        return Err(e);
                    }
                };
                self.stage = Stage::StaticRecv;
                Ok(payload)
            }
            // -> s, se
            (Role::Responder, Stage::StaticSent) => {
                if message.len() < DH_LEN + TAG_LEN + TAG_LEN {
                    self.stage = Stage::Failed;
                    return Err(NoiseError::Malformed);
                }
                let enc_s = &message[..DH_LEN + TAG_LEN];
                let rs_bytes = match self.decrypt_and_hash(enc_s) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        self.stage = Stage::Failed;
                        return Err(e);
                    }
                };
                let rs = public_key(&rs_bytes);
                self.rs = Some(rs);
                let se = self.e.diffie_hellman(&rs);
                self.mix_key(se.as_bytes());
                let payload = match self.decrypt_and_hash(&message[DH_LEN + TAG_LEN..]) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        self.stage = Stage::Failed;
                        return Err(e);
                    }
                };
                self.stage = Stage::Established;
                Ok(payload)
            }
            (_, Stage::Failed) => Err(NoiseError::AuthFail),
            _ => Err(NoiseError::OutOfTurn),
        }
    }

    /// Split into transport ciphers once `Established`.
    ///
    /// Returns `(cipher_out, cipher_in, remote_static)`: the sealing cipher
    /// for local sends, the opening cipher for peer records, and the peer's
    /// static X25519 key.
    pub fn finish(self) -> Result<(CipherState, CipherState, PublicKey), NoiseError> {
        if self.stage != Stage::Established {
            return Err(NoiseError::OutOfTurn);
        }
        let rs = self.rs.ok_or(NoiseError::OutOfTurn)?;
        let (k1, k2) = hkdf(&self.ck, &[]);
        let (out_key, in_key) = match self.role {
            Role::Initiator => (k1, k2),
            Role::Responder => (k2, k1),
        };
        Ok((CipherState::new(&out_key), CipherState::new(&in_key), rs))
    }
}

fn public_key(bytes: &[u8]) -> PublicKey {
    let arr: [u8; DH_LEN] = bytes.try_into().expect("caller checked length");
    PublicKey::from(arr)
}
