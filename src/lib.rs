//! # NovaGuard
//!
//! A device-bound encrypted tunnel server. Clients reach the server over an
//! ordinary TLS stream, bind their device to a config in a one-shot
//! handshake, then exchange obfuscated AEAD packets whose framing carries
//! random padding, decoy address fields and a trailer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │               Packet handler (application)              │
//! ├─────────────────────────────────────────────────────────┤
//! │  Obfuscation (packet codec, send-time fragmentation)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  Server (binding handshake, sessions, listeners)        │
//! ├─────────────────────────────────────────────────────────┤
//! │  Outer TLS stream (rustls)                              │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto Layer (ChaCha20-Poly1305, OS randomness)        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **Device binding**: a config is owned by the first device that presents it
//! 2. **One session per config**: a re-handshake replaces the previous tunnel
//! 3. **RAM-only sessions**: keys never touch disk and expire after an hour
//! 4. **Fault isolation**: a bad packet is dropped, the session keeps running

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod error;
pub mod obfuscation;

#[cfg(feature = "server")]
pub mod descriptor;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result};

/// Protocol tag advertised in connection descriptors.
pub const PROTOCOL_NAME: &str = "novaguard";

/// Encryption tag advertised in connection descriptors.
pub const ENCRYPTION_NAME: &str = "chacha20-poly1305";

/// Largest payload a single packet can carry.
pub const MAX_PAYLOAD_SIZE: usize = obfuscation::MAX_SEALED_LEN - crypto::TAG_SIZE;

/// Deadline for the outer and binding handshakes (milliseconds).
pub const HANDSHAKE_TIMEOUT_MS: u64 = 30_000;
