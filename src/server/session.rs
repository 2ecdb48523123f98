//! RAM-only session registry.
//!
//! Sessions exist only in memory and are keyed by config identifier: at most
//! one live session per config. Registering a second session for the same
//! config closes the first one's connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::crypto::AeadKey;
use crate::server::metrics::ServerMetrics;

/// Unique session identifier.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One established tunnel session.
///
/// The connection task owns the stream; the session holds everything else
/// about the tunnel: identity, key, age, and the token that closes it.
pub struct Session {
    id: SessionId,
    config_id: String,
    device_id: String,
    key: AeadKey,
    created_at: Instant,
    peer_addr: Option<SocketAddr>,
    closed: CancellationToken,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Session {
    /// Create a session created now.
    pub fn new(
        config_id: impl Into<String>,
        device_id: impl Into<String>,
        key: AeadKey,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            config_id: config_id.into(),
            device_id: device_id.into(),
            key,
            created_at: Instant::now(),
            peer_addr,
            closed: CancellationToken::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Get session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Config this session was created for.
    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    /// Device bound to the config.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Symmetric key for the packet codec.
    pub fn key(&self) -> &AeadKey {
        &self.key
    }

    /// When the handshake completed.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Remote address, when the transport has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Whether the session is older than `ttl` at `now`.
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > ttl
    }

    /// Ask the owning connection to shut down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Account payload bytes received.
    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Account payload bytes sent.
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Get session statistics.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            config_id: self.config_id.clone(),
            device_id: self.device_id.clone(),
            age: self.created_at.elapsed(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Session statistics (safe to expose, no key material).
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session identifier
    pub id: SessionId,
    /// Config the session serves
    pub config_id: String,
    /// Device bound to the config
    pub device_id: String,
    /// Time since the handshake completed
    pub age: Duration,
    /// Payload bytes sent to the client
    pub bytes_sent: u64,
    /// Payload bytes received from the client
    pub bytes_received: u64,
}

/// Table of active sessions keyed by config identifier.
///
/// Every operation holds the lock only for the map mutation itself.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`, closing any session it replaces.
    ///
    /// Returns the superseded session, already closed.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let previous = self
            .sessions
            .write()
            .insert(session.config_id.clone(), session);

        if let Some(previous) = &previous {
            previous.close();
        }
        previous
    }

    /// Remove whatever session is registered for `config_id`.
    pub fn remove(&self, config_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().remove(config_id)
    }

    /// Remove `session` only if it is still the registered one.
    ///
    /// A connection that was replaced must not unregister its successor.
    pub fn release(&self, session: &Session) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(&session.config_id) {
            Some(current) if current.id == session.id => {
                sessions.remove(&session.config_id);
                true
            }
            _ => false,
        }
    }

    /// Evict and close every session older than `ttl` at `now`. Returns how many.
    ///
    /// Closing ends the owning connection's packet loop, so an expired tunnel
    /// never outlives its registry entry.
    pub fn sweep(&self, now: Instant, ttl: Duration) -> usize {
        let mut evicted = 0;
        self.sessions.write().retain(|_, s| {
            if s.is_expired(now, ttl) {
                s.close();
                evicted += 1;
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Get a session by config.
    pub fn get(&self, config_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(config_id).cloned()
    }

    /// Get session count.
    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Get statistics for all sessions.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions.read().values().map(|s| s.info()).collect()
    }

    /// Sweep every `interval` until `shutdown` fires. Returns the total evicted.
    pub async fn run_reaper(
        &self,
        interval: Duration,
        ttl: Duration,
        metrics: &ServerMetrics,
        shutdown: CancellationToken,
    ) -> usize {
        let mut total = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return total,
                _ = tokio::time::sleep(interval) => {}
            }

            let removed = self.sweep(Instant::now(), ttl);
            if removed > 0 {
                metrics.add_sessions_reaped(removed as u64);
                tracing::info!("Reaped {} expired sessions", removed);
            }
            total += removed;
        }
    }
}
