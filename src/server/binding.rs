//! Device binding store.
//!
//! Maps a config identifier to the single device allowed to use it. The first
//! device to present a config wins; the entry never changes afterwards and is
//! never removed. The whole table is rewritten as pretty-printed JSON on every
//! new binding.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Outcome of [`DeviceBindingStore::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// First time this config was seen; the device is now bound
    Bound,
    /// The same device reconnected
    Matched,
    /// A different device already owns this config
    Rejected,
}

impl BindOutcome {
    /// Whether the handshake may proceed.
    pub fn is_allowed(self) -> bool {
        !matches!(self, BindOutcome::Rejected)
    }
}

struct Table {
    bindings: BTreeMap<String, String>,
    generation: u64,
}

/// Persisted first-writer-wins map of `config_id -> device_id`.
pub struct DeviceBindingStore {
    path: Option<PathBuf>,
    table: Mutex<Table>,
    /// Generation of the snapshot last written to disk
    written: Mutex<u64>,
}

impl DeviceBindingStore {
    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_bindings(None, BTreeMap::new())
    }

    /// Load the table from `path`.
    ///
    /// A missing or malformed file yields an empty table.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let bindings = match std::fs::read(&path) {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(bindings) => bindings,
                Err(e) => {
                    tracing::warn!("Ignoring malformed device map {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("Cannot read device map {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };

        tracing::debug!("Loaded {} device bindings", bindings.len());
        Self::with_bindings(Some(path), bindings)
    }

    fn with_bindings(path: Option<PathBuf>, bindings: BTreeMap<String, String>) -> Self {
        Self {
            path,
            table: Mutex::new(Table {
                bindings,
                generation: 0,
            }),
            written: Mutex::new(0),
        }
    }

    /// Bind `device_id` to `config_id` if unbound, else compare.
    ///
    /// Returns true when the bind succeeded or the same device reconnected.
    pub fn bind_or_check(&self, config_id: &str, device_id: &str) -> bool {
        self.bind(config_id, device_id).is_allowed()
    }

    /// Like [`bind_or_check`](Self::bind_or_check) but reports which case applied.
    ///
    /// A persistence failure is logged; the in-memory binding stands.
    pub fn bind(&self, config_id: &str, device_id: &str) -> BindOutcome {
        let snapshot = {
            let mut table = self.table.lock();

            if let Some(existing) = table.bindings.get(config_id) {
                return if existing == device_id {
                    BindOutcome::Matched
                } else {
                    BindOutcome::Rejected
                };
            }

            table
                .bindings
                .insert(config_id.to_owned(), device_id.to_owned());
            table.generation += 1;

            match &self.path {
                Some(_) => Some((table.generation, serde_json::to_vec_pretty(&table.bindings))),
                None => None,
            }
        };

        if let Some((generation, encoded)) = snapshot {
            let result = encoded
                .map_err(|e| Error::Persist(e.to_string()))
                .and_then(|data| self.write_snapshot(generation, &data));
            if let Err(e) = result {
                tracing::error!("{} (config {} stays bound in memory)", e, config_id);
            }
        }

        BindOutcome::Bound
    }

    /// [`bind_or_check`](Self::bind_or_check) for async callers.
    pub async fn bind_or_check_async(
        self: &Arc<Self>,
        config_id: &str,
        device_id: &str,
    ) -> Result<bool> {
        Ok(self.bind_async(config_id, device_id).await?.is_allowed())
    }

    /// [`bind`](Self::bind) off the async workers.
    ///
    /// A file-backed store may rewrite the table, so the call runs on the
    /// blocking pool.
    pub async fn bind_async(
        self: &Arc<Self>,
        config_id: &str,
        device_id: &str,
    ) -> Result<BindOutcome> {
        if self.path.is_none() {
            return Ok(self.bind(config_id, device_id));
        }

        let store = Arc::clone(self);
        let config_id = config_id.to_owned();
        let device_id = device_id.to_owned();
        tokio::task::spawn_blocking(move || store.bind(&config_id, &device_id))
            .await
            .map_err(|e| Error::Persist(format!("binding task failed: {}", e)))
    }

    /// Write a snapshot unless a newer one already reached disk.
    fn write_snapshot(&self, generation: u64, data: &[u8]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut written = self.written.lock();
        if *written >= generation {
            return Ok(());
        }

        write_atomically(path, data)
            .map_err(|e| Error::Persist(format!("{}: {}", path.display(), e)))?;
        *written = generation;
        Ok(())
    }

    /// Device bound to `config_id`, if any.
    pub fn get(&self, config_id: &str) -> Option<String> {
        self.table.lock().bindings.get(config_id).cloned()
    }

    /// Number of bound configs.
    pub fn len(&self) -> usize {
        self.table.lock().bindings.len()
    }

    /// Whether no config is bound yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// File backing the store, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn write_atomically(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}
