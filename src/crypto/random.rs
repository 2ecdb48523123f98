//! Secure random number generation.
//!
//! Provides cryptographically secure random bytes using the operating
//! system's entropy source. Every decoy byte on the wire comes from here.

use rand::RngCore;
use rand_core::OsRng;

/// Cryptographically secure random number generator.
///
/// Wraps the OS-provided entropy source (e.g., /dev/urandom on Unix,
/// BCryptGenRandom on Windows).
pub struct SecureRandom;

impl SecureRandom {
    /// Fill a buffer with cryptographically secure random bytes.
    pub fn fill(dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }

    /// Generate a fixed-size array of random bytes.
    pub fn bytes<const N: usize>() -> [u8; N] {
        let mut buf = [0u8; N];
        OsRng.fill_bytes(&mut buf);
        buf
    }

    /// Generate a random u32.
    pub fn u32() -> u32 {
        OsRng.next_u32()
    }
}

/// Generate random padding of the specified length.
pub fn random_padding(len: usize) -> Vec<u8> {
    let mut padding = vec![0u8; len];
    SecureRandom::fill(&mut padding);
    padding
}

/// Random byte congruent to `residue` modulo `modulus`.
///
/// Used to make a random-looking padding byte carry a small value.
/// `residue` must be below `modulus`.
pub fn random_byte_with_residue(residue: u8, modulus: u8) -> u8 {
    debug_assert!(residue < modulus);
    // Largest multiplier that keeps modulus * k + residue within a byte.
    let slots = (u8::MAX - residue) / modulus + 1;
    let k = (SecureRandom::u32() % slots as u32) as u8;
    k * modulus + residue
}
