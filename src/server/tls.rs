//! Outer TLS layer.
//!
//! The tunnel rides inside an ordinary server-authenticated TLS stream; no
//! client certificates, no ALPN.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};

/// Read a PEM certificate chain.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::tls(format!("cannot read cert {}: {}", path.display(), e)))?;

    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("invalid cert {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(Error::tls(format!("no certificate in {}", path.display())));
    }
    Ok(certs)
}

/// Read the first PEM private key (PKCS#8, PKCS#1 or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::tls(format!("cannot read key {}: {}", path.display(), e)))?;

    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| Error::tls(format!("invalid key {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::tls(format!("no private key in {}", path.display())))
}

/// Build a rustls server config from PEM files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls(e.to_string()))
}

/// Build the acceptor every listener shares.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let config = load_tls_config(cert_path, key_path)?;
    tracing::debug!("Loaded TLS certificate {}", cert_path.display());
    Ok(TlsAcceptor::from(Arc::new(config)))
}
