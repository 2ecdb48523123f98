//! Error types for the NovaGuard engine.

use thiserror::Error;

/// Result type alias for NovaGuard operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the tunnel engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file missing, unreadable or malformed
    #[error("failed to load configuration: {0}")]
    ConfigLoad(String),

    /// TLS certificate/key could not be turned into a server config
    #[error("TLS setup failed: {0}")]
    TlsSetup(String),

    /// Listener could not accept a connection
    #[error("accept failed: {0}")]
    Accept(std::io::Error),

    /// Outer TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(std::io::Error),

    /// Outer handshake or binding handshake exceeded its deadline
    #[error("handshake timeout after {0}ms")]
    HandshakeTimeout(u64),

    /// Reading the binding handshake failed or the peer closed first
    #[error("failed to read handshake: {0}")]
    HandshakeRead(String),

    /// Binding handshake is not valid JSON or has an empty field
    #[error("malformed handshake: {0}")]
    HandshakeMalformed(String),

    /// Config is already bound to another device
    #[error("config {config_id} is bound to another device")]
    DeviceMismatch {
        /// Config identifier that was presented
        config_id: String,
    },

    /// Writing the handshake acknowledgement failed
    #[error("failed to send handshake acknowledgement: {0}")]
    HandshakeAck(std::io::Error),

    /// Packet shorter than the minimum frame
    #[error("packet too short: {actual} bytes, minimum {minimum}")]
    PacketTooShort {
        /// Minimum frame size
        minimum: usize,
        /// Received size
        actual: usize,
    },

    /// Packet framing points outside the received bytes
    #[error("invalid packet structure: {0}")]
    InvalidStructure(&'static str),

    /// AEAD authentication failed
    #[error("packet decryption/authentication failed")]
    DecryptFailed,

    /// Payload does not fit the 16-bit length field
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// A fragment write failed; remaining fragments were not sent
    #[error("fragment {index} write failed: {source}")]
    FragmentWrite {
        /// Zero-based index of the failed fragment
        index: usize,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Device binding table could not be written to disk
    #[error("failed to persist device bindings: {0}")]
    Persist(String),

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::ConfigLoad(msg.into())
    }

    /// Create a new TLS setup error
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::TlsSetup(msg.into())
    }

    /// Create a new malformed-handshake error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::HandshakeMalformed(msg.into())
    }

    /// A single bad packet: logged, and the connection keeps reading.
    pub fn is_packet_error(&self) -> bool {
        matches!(
            self,
            Error::PacketTooShort { .. } | Error::InvalidStructure(_) | Error::DecryptFailed
        )
    }

    /// Errors that stop the process before any listener starts.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConfigLoad(_) | Error::TlsSetup(_))
    }

    /// Errors raised while establishing a session (no session registered).
    pub fn is_handshake_error(&self) -> bool {
        matches!(
            self,
            Error::TlsHandshake(_)
                | Error::HandshakeTimeout(_)
                | Error::HandshakeRead(_)
                | Error::HandshakeMalformed(_)
                | Error::DeviceMismatch { .. }
                | Error::HandshakeAck(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DecryptFailed;
        assert_eq!(err.to_string(), "packet decryption/authentication failed");

        let err = Error::PacketTooShort { minimum: 26, actual: 3 };
        assert_eq!(err.to_string(), "packet too short: 3 bytes, minimum 26");

        let err = Error::DeviceMismatch { config_id: "cfg1".into() };
        assert_eq!(err.to_string(), "config cfg1 is bound to another device");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::DecryptFailed.is_packet_error());
        assert!(Error::InvalidStructure("nonce").is_packet_error());
        assert!(!Error::DeviceMismatch { config_id: "a".into() }.is_packet_error());

        assert!(Error::config("bad").is_fatal());
        assert!(Error::tls("bad").is_fatal());
        assert!(!Error::DecryptFailed.is_fatal());

        assert!(Error::malformed("x").is_handshake_error());
        assert!(Error::HandshakeTimeout(30_000).is_handshake_error());
        assert!(!Error::PayloadTooLarge(70_000).is_handshake_error());
    }

    #[test]
    fn test_fragment_error_source() {
        use std::error::Error as _;

        let err = Error::FragmentWrite {
            index: 1,
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"),
        };
        assert!(err.to_string().starts_with("fragment 1 write failed"));
        assert!(err.source().is_some());
    }
}
