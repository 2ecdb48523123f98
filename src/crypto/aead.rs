//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Packets are sealed with ChaCha20-Poly1305 under the per-session key and a
//! fresh random 96-bit nonce. No associated data is bound; the decoy fields
//! around the ciphertext are deliberately unauthenticated.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit},
    ChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{SecureRandom, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// A 32-byte symmetric session key.
///
/// Generated once per handshake, never rotated or persisted.
/// Automatically zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh key from the OS entropy source.
    pub fn generate() -> Self {
        Self(SecureRandom::bytes())
    }

    /// Create a key from a slice, failing unless it is exactly 32 bytes.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| Error::Crypto(format!(
            "session key must be {} bytes, got {}",
            KEY_SIZE,
            bytes.len()
        )))?;
        Ok(Self(arr))
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// First byte of the key; fixes the padding length for the session.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }
}

impl fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AeadKey(<redacted>)")
    }
}

/// A 96-bit AEAD nonce.
///
/// Every packet draws a fresh random nonce; there is no counter state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Draw a random nonce.
    pub fn random() -> Self {
        Self(SecureRandom::bytes())
    }

    /// Create a nonce from raw bytes.
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Read a nonce out of a wire slice. `None` unless exactly 12 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// ChaCha20-Poly1305 AEAD cipher bound to one session key.
pub struct Aead {
    cipher: ChaCha20Poly1305,
}

impl Aead {
    /// Create a new AEAD instance with the given key.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Seal plaintext without associated data.
    ///
    /// Returns ciphertext || tag (16 bytes appended).
    pub fn seal(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(nonce.as_bytes().into(), plaintext)
            .map_err(|_| Error::crypto("encryption failed"))
    }

    /// Open ciphertext || tag.
    ///
    /// # Errors
    ///
    /// [`Error::DecryptFailed`] if the block is shorter than a tag or
    /// authentication fails (wrong key, tampered data, bad framing). No
    /// partial plaintext is ever returned.
    pub fn open(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::DecryptFailed);
        }

        self.cipher
            .decrypt(nonce.as_bytes().into(), ciphertext)
            .map_err(|_| Error::DecryptFailed)
    }
}

/// Calculate the sealed length for a given plaintext length.
pub const fn ciphertext_len(plaintext_len: usize) -> usize {
    plaintext_len + TAG_SIZE
}
