//! Cryptographic primitives for NovaGuard.
//!
//! This module provides:
//! - ChaCha20-Poly1305 AEAD encryption for the packet codec
//! - Session key generation
//! - Secure random bytes for nonces, padding and decoy fields
//!
//! Key material is zeroized on drop.

mod aead;
pub(crate) mod random;

pub use aead::{ciphertext_len, Aead, AeadKey, Nonce};
pub use random::{random_padding, SecureRandom};

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;
