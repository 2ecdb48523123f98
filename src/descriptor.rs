//! Connection descriptor ("connection code").
//!
//! An out-of-band `ng://` string handed to clients: URL-safe unpadded base64
//! of a JSON object describing one configuration record plus the server
//! certificate fingerprint.

use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::server::{load_certs, NovaGuardConfig};

/// URI scheme prefix.
pub const SCHEME: &str = "ng://";

/// Fingerprint advertised when the certificate cannot be read.
pub const PLACEHOLDER_FINGERPRINT: &str = "AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99";

/// Number of digest bytes kept in the fingerprint.
const FINGERPRINT_LEN: usize = 16;

/// Everything a client needs to reach one listener pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Public server address
    pub server: String,
    /// TCP port
    pub tcp_port: u16,
    /// UDP port
    pub udp_port: u16,
    /// Config identifier the client presents in its handshake
    pub config_id: String,
    /// Session identifier tag
    pub session_id: String,
    /// Protocol tag
    pub protocol: String,
    /// Encryption tag
    pub encryption: String,
    /// Version tag
    pub version: String,
    /// Truncated SHA-256 of the server certificate, `AA:BB:..` form
    pub fingerprint: String,
}

impl ConnectionDescriptor {
    /// Describe `config`, fingerprinting its certificate.
    pub fn for_config(config: &NovaGuardConfig) -> Self {
        let cert_path = config.cert_path();
        let fingerprint = certificate_fingerprint(&cert_path).unwrap_or_else(|e| {
            tracing::warn!("Using placeholder fingerprint: {}", e);
            PLACEHOLDER_FINGERPRINT.to_string()
        });
        Self::with_fingerprint(config, fingerprint)
    }

    /// Describe `config` with a known fingerprint.
    pub fn with_fingerprint(config: &NovaGuardConfig, fingerprint: impl Into<String>) -> Self {
        Self {
            server: config.server.clone(),
            tcp_port: config.tcp_port,
            udp_port: config.udp_port,
            config_id: config.config_id.clone(),
            session_id: config.session_id.clone(),
            protocol: config.protocol_tag().to_string(),
            encryption: config.encryption_tag().to_string(),
            version: config.version.clone(),
            fingerprint: fingerprint.into(),
        }
    }

    /// Encode as an `ng://` URI.
    pub fn to_uri(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| Error::config(e.to_string()))?;
        Ok(format!("{}{}", SCHEME, URL_SAFE_NO_PAD.encode(json)))
    }

    /// Decode an `ng://` URI.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let encoded = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::config(format!("descriptor must start with {}", SCHEME)))?;
        let json = URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|e| Error::config(format!("invalid descriptor encoding: {}", e)))?;
        serde_json::from_slice(&json).map_err(|e| Error::config(format!("invalid descriptor: {}", e)))
    }
}

/// Fingerprint of DER certificate bytes.
pub fn fingerprint_der(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest[..FINGERPRINT_LEN]
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Fingerprint of the first certificate in a PEM file.
pub fn certificate_fingerprint(path: &Path) -> Result<String> {
    let certs = load_certs(path)?;
    Ok(fingerprint_der(certs[0].as_ref()))
}
