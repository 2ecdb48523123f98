//! Server configuration.
//!
//! `NovaGuardConfig` is the on-disk record (one per listener pair);
//! `EngineSettings` holds the engine's runtime tunables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::obfuscation::FragmentConfig;

/// Multi-record configuration file, checked first.
pub const MULTI_CONFIG_FILE: &str = "configs.json";

/// Single-record configuration file, used when the multi-record one is absent.
pub const SINGLE_CONFIG_FILE: &str = "config.json";

/// Certificate used when the record leaves `certfile` empty.
pub const DEFAULT_CERT_FILE: &str = "novaguard.crt";

/// Private key used when the record leaves `keyfile` empty.
pub const DEFAULT_KEY_FILE: &str = "novaguard.key";

/// Device binding table location.
pub const DEFAULT_DEVICE_MAP_FILE: &str = "config_device_map.json";

/// One listener pair's configuration record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NovaGuardConfig {
    /// Public server address advertised to clients
    pub server: String,
    /// TCP listen port
    pub tcp_port: u16,
    /// UDP listen port
    pub udp_port: u16,
    /// Logical config identifier
    pub config_id: String,
    /// Session identifier advertised in the connection code
    pub session_id: String,
    /// Protocol tag
    pub protocol: String,
    /// Encryption tag
    pub encryption: String,
    /// Version tag
    pub version: String,
    /// PEM certificate path
    pub certfile: String,
    /// PEM private key path
    pub keyfile: String,
}

impl NovaGuardConfig {
    /// Certificate path, falling back to the default file name.
    pub fn cert_path(&self) -> PathBuf {
        non_empty_or(&self.certfile, DEFAULT_CERT_FILE)
    }

    /// Key path, falling back to the default file name.
    pub fn key_path(&self) -> PathBuf {
        non_empty_or(&self.keyfile, DEFAULT_KEY_FILE)
    }

    /// Protocol tag, falling back to [`crate::PROTOCOL_NAME`].
    pub fn protocol_tag(&self) -> &str {
        if self.protocol.is_empty() {
            crate::PROTOCOL_NAME
        } else {
            &self.protocol
        }
    }

    /// Encryption tag, falling back to [`crate::ENCRYPTION_NAME`].
    pub fn encryption_tag(&self) -> &str {
        if self.encryption.is_empty() {
            crate::ENCRYPTION_NAME
        } else {
            &self.encryption
        }
    }

    /// Validate the record.
    pub fn validate(&self) -> Result<()> {
        if self.tcp_port == 0 {
            return Err(Error::config(format!(
                "config {:?}: tcp_port must be non-zero",
                self.config_id
            )));
        }
        if self.udp_port == 0 {
            return Err(Error::config(format!(
                "config {:?}: udp_port must be non-zero",
                self.config_id
            )));
        }
        Ok(())
    }
}

fn non_empty_or(value: &str, fallback: &str) -> PathBuf {
    if value.is_empty() {
        PathBuf::from(fallback)
    } else {
        PathBuf::from(value)
    }
}

/// Accepts either a single object or an array of objects.
#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigFile {
    Many(Vec<NovaGuardConfig>),
    One(NovaGuardConfig),
}

/// All configured listener pairs. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSet {
    configs: Vec<NovaGuardConfig>,
}

impl ConfigSet {
    /// Build a set from records, rejecting an empty list or an invalid record.
    pub fn new(configs: Vec<NovaGuardConfig>) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::config("no configuration records"));
        }
        for config in &configs {
            config.validate()?;
        }
        Ok(Self { configs })
    }

    /// Parse JSON text holding one record or an array of records.
    pub fn from_json(text: &str) -> Result<Self> {
        let parsed: ConfigFile =
            serde_json::from_str(text).map_err(|e| Error::config(format!("invalid JSON: {}", e)))?;

        match parsed {
            ConfigFile::Many(configs) => Self::new(configs),
            ConfigFile::One(config) => Self::new(vec![config]),
        }
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Load `configs.json` from `dir` if it exists, otherwise `config.json`.
    pub fn discover(dir: &Path) -> Result<Self> {
        let multi = dir.join(MULTI_CONFIG_FILE);
        if multi.exists() {
            return Self::load(&multi);
        }
        Self::load(&dir.join(SINGLE_CONFIG_FILE))
    }

    /// Records in file order.
    pub fn configs(&self) -> &[NovaGuardConfig] {
        &self.configs
    }

    /// Record whose certificate and key are shared by every listener.
    pub fn primary(&self) -> &NovaGuardConfig {
        &self.configs[0]
    }

    /// Number of listener pairs.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// Runtime tunables of the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Deadline for the outer TLS handshake and the binding handshake
    pub handshake_timeout: Duration,
    /// Sessions older than this are evicted by the reaper
    pub session_ttl: Duration,
    /// How often the reaper wakes
    pub sweep_interval: Duration,
    /// UDP receive poll interval
    pub udp_poll_interval: Duration,
    /// Largest binding handshake accepted
    pub handshake_buffer: usize,
    /// Send-time fragmentation
    pub fragment: FragmentConfig,
    /// Device binding table file (`None` keeps bindings in memory only)
    pub device_map_path: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(crate::HANDSHAKE_TIMEOUT_MS),
            session_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            udp_poll_interval: Duration::from_secs(1),
            handshake_buffer: 1024,
            fragment: FragmentConfig::default(),
            device_map_path: Some(PathBuf::from(DEFAULT_DEVICE_MAP_FILE)),
        }
    }
}
