//! # Record Framing
//!
//! Length-prefixed record layer carrying both handshake messages and
//! transport ciphertext: every record is `u16-be length || body`, with the
//! body at most [`MAX_RECORD_BODY`] bytes (ciphertext including its 16-byte
//! tag).
//!
//! [`RecordChannel`] owns one connection's record state. It starts in
//! plaintext mode (handshake records pass through untouched) and is
//! upgraded with the session ciphers once the handshake finishes; from
//! then on [`RecordChannel::seal`] encrypts and [`RecordChannel::next_record`]
//! decrypts. Oversized application payloads are split across records on
//! the sealing side.
//!
//! The inbound buffer is capped; feeding bytes past the cap fails with
//! [`FrameError::BufferOverflow`] and the owning connection closes.

use crate::noise::{CipherState, NoiseError, TAG_LEN};

/// Maximum record body on the wire (u16 length prefix).
pub const MAX_RECORD_BODY: usize = 65_535;

/// Maximum plaintext per sealed record, leaving room for the AEAD tag.
pub const MAX_RECORD_PLAINTEXT: usize = MAX_RECORD_BODY - TAG_LEN;

/// Default cap on buffered inbound bytes per connection (1 MiB).
pub const DEFAULT_MAX_BUFFER: usize = 1024 * 1024;

// ============================================================================
// Errors
// ============================================================================

/// Failures of the record layer itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The inbound buffer cap was exceeded.
    BufferOverflow,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::BufferOverflow => write!(f, "inbound buffer cap exceeded"),
        }
    }
}

impl std::error::Error for FrameError {}

// ============================================================================
// RecordChannel
// ============================================================================

/// Per-connection record framing with an optional AEAD layer.
pub struct RecordChannel {
    inbound: Vec<u8>,
    max_buffer: usize,
    /// `(sealing, opening)` ciphers once the handshake finished.
    ciphers: Option<(CipherState, CipherState)>,
}

impl RecordChannel {
    pub fn new(max_buffer: usize) -> Self {
        Self {
            inbound: Vec::new(),
            max_buffer,
            ciphers: None,
        }
    }

    /// Install the session ciphers; subsequent records are AEAD-protected.
    pub fn secure(&mut self, cipher_out: CipherState, cipher_in: CipherState) {
        self.ciphers = Some((cipher_out, cipher_in));
    }

    pub fn is_secured(&self) -> bool {
        self.ciphers.is_some()
    }

    /// Buffer raw bytes from the wire.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        if self.inbound.len() + bytes.len() > self.max_buffer {
            return Err(FrameError::BufferOverflow);
        }
        self.inbound.extend_from_slice(bytes);
        Ok(())
    }

    /// Split (and in secured mode decrypt) the next whole record.
    ///
    /// Returns `Ok(None)` until a complete record is buffered. Partial
    /// records stay buffered; byte order is preserved.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, NoiseError> {
        if self.inbound.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.inbound[0], self.inbound[1]]) as usize;
        if self.inbound.len() < 2 + len {
            return Ok(None);
        }
        let body: Vec<u8> = self.inbound.drain(..2 + len).skip(2).collect();
        match &mut self.ciphers {
            Some((_, opening)) => opening.open(&[], &body).map(Some),
            None => Ok(Some(body)),
        }
    }

    /// Frame (and in secured mode encrypt) `plaintext`, splitting it over
    /// as many records as its size requires. Returns ready wire bytes.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let chunk_limit = match self.ciphers {
            Some(_) => MAX_RECORD_PLAINTEXT,
            None => MAX_RECORD_BODY,
        };
        let mut wire = Vec::with_capacity(plaintext.len() + 2 + TAG_LEN);
        let mut chunks = plaintext.chunks(chunk_limit);
        // An empty payload still produces one (possibly tagged) record.
        let first: &[u8] = chunks.next().unwrap_or(&[]);
        self.seal_one(first, &mut wire)?;
        for chunk in chunks {
            self.seal_one(chunk, &mut wire)?;
        }
        Ok(wire)
    }

    fn seal_one(&mut self, chunk: &[u8], wire: &mut Vec<u8>) -> Result<(), NoiseError> {
        let body = match &mut self.ciphers {
            Some((sealing, _)) => sealing.seal(&[], chunk)?,
            None => chunk.to_vec(),
        };
        debug_assert!(body.len() <= MAX_RECORD_BODY);
        wire.extend_from_slice(&(body.len() as u16).to_be_bytes());
        wire.extend_from_slice(&body);
        Ok(())
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }
}
