//! Device-binding handshake.
//!
//! The first cleartext message on an authenticated stream:
//!
//! ```text
//! Client                                   Server
//!   |  {"config_id": .., "device_id": ..}    |
//!   |--------------------------------------->|  parse, bind_or_check
//!   |                                        |  generate session key
//!   |  "OK" || session_key (32)              |
//!   |<---------------------------------------|
//!   |                                        |
//!   |========= obfuscated packets ===========|
//! ```
//!
//! Any failure closes the connection without a reply. A successful bind is
//! never rolled back, even if the acknowledgement then fails.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{AeadKey, KEY_SIZE};
use crate::error::{Error, Result};
use crate::server::binding::DeviceBindingStore;
use crate::server::session::Session;

/// Success marker that opens the acknowledgement.
pub const ACK_MARKER: &[u8; 2] = b"OK";

/// Acknowledgement length: marker followed by the session key.
pub const ACK_LEN: usize = ACK_MARKER.len() + KEY_SIZE;

/// Default cap on the handshake message size.
pub const MAX_HANDSHAKE_LEN: usize = 1024;

/// The client's binding request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Logical config the client wants to use
    pub config_id: String,
    /// Physical device presenting it
    pub device_id: String,
}

impl HandshakeMessage {
    /// Build a request.
    pub fn new(config_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            config_id: config_id.into(),
            device_id: device_id.into(),
        }
    }

    /// Decode and validate a handshake buffer.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let message: HandshakeMessage = serde_json::from_slice(buf)
            .map_err(|e| Error::malformed(e.to_string()))?;

        if message.config_id.is_empty() || message.device_id.is_empty() {
            return Err(Error::malformed("missing config_id or device_id"));
        }
        Ok(message)
    }

    /// JSON encoding sent by clients.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Two string fields always serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Build the acknowledgement carrying `key`.
pub fn build_ack(key: &AeadKey) -> [u8; ACK_LEN] {
    let mut ack = [0u8; ACK_LEN];
    ack[..ACK_MARKER.len()].copy_from_slice(ACK_MARKER);
    ack[ACK_MARKER.len()..].copy_from_slice(key.as_bytes());
    ack
}

/// Parse an acknowledgement, returning the delivered key.
pub fn parse_ack(ack: &[u8]) -> Result<AeadKey> {
    if ack.len() != ACK_LEN || &ack[..ACK_MARKER.len()] != ACK_MARKER {
        return Err(Error::malformed("unexpected handshake acknowledgement"));
    }
    AeadKey::try_from_slice(&ack[ACK_MARKER.len()..])
}

/// Runs the server side of the binding handshake.
pub struct HandshakeNegotiator<'a> {
    bindings: &'a Arc<DeviceBindingStore>,
    max_len: usize,
}

impl<'a> HandshakeNegotiator<'a> {
    /// Negotiator checking against `bindings`.
    pub fn new(bindings: &'a Arc<DeviceBindingStore>) -> Self {
        Self {
            bindings,
            max_len: MAX_HANDSHAKE_LEN,
        }
    }

    /// Override the handshake size cap.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len.max(1);
        self
    }

    /// Await, parse, bind, generate a key, acknowledge.
    ///
    /// The caller keeps the stream; the returned session is not registered.
    pub async fn negotiate<S>(&self, stream: &mut S, peer_addr: Option<SocketAddr>) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.max_len];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| Error::HandshakeRead(e.to_string()))?;
        if n == 0 {
            return Err(Error::HandshakeRead("connection closed before handshake".into()));
        }

        let message = HandshakeMessage::parse(&buf[..n])?;

        let allowed = self
            .bindings
            .bind_or_check_async(&message.config_id, &message.device_id)
            .await?;
        if !allowed {
            return Err(Error::DeviceMismatch {
                config_id: message.config_id,
            });
        }

        let key = AeadKey::generate();

        stream
            .write_all(&build_ack(&key))
            .await
            .map_err(Error::HandshakeAck)?;
        stream.flush().await.map_err(Error::HandshakeAck)?;

        Ok(Session::new(
            message.config_id,
            message.device_id,
            key,
            peer_addr,
        ))
    }
}
