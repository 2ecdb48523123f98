//! Server metrics collection.
//!
//! Aggregate counters only; nothing here identifies a config or device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server metrics collector.
pub struct ServerMetrics {
    start_time: Instant,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    handshakes_completed: AtomicU64,
    handshake_failures: AtomicU64,
    device_mismatches: AtomicU64,
    packets_processed: AtomicU64,
    packets_rejected: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    udp_datagrams: AtomicU64,
    sessions_reaped: AtomicU64,
    sessions_replaced: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            handshakes_completed: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            device_mismatches: AtomicU64::new(0),
            packets_processed: AtomicU64::new(0),
            packets_rejected: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            udp_datagrams: AtomicU64::new(0),
            sessions_reaped: AtomicU64::new(0),
            sessions_replaced: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count a completed binding handshake.
    pub fn increment_handshakes(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed TLS or binding handshake.
    pub fn increment_handshake_failures(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a handshake rejected by the binding store.
    pub fn increment_device_mismatches(&self) {
        self.device_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a packet that decoded and reached the handler.
    pub fn increment_packets_processed(&self) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a packet that failed to decode.
    pub fn increment_packets_rejected(&self) {
        self.packets_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes to sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes to received counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count a received UDP datagram.
    pub fn increment_udp_datagrams(&self) {
        self.udp_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    /// Add sessions evicted by the reaper.
    pub fn add_sessions_reaped(&self, count: u64) {
        self.sessions_reaped.fetch_add(count, Ordering::Relaxed);
    }

    /// Count a session closed by a re-handshake.
    pub fn increment_sessions_replaced(&self) {
        self.sessions_replaced.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections(),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            device_mismatches: self.device_mismatches.load(Ordering::Relaxed),
            packets_processed: self.packets_processed.load(Ordering::Relaxed),
            packets_rejected: self.packets_rejected.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            udp_datagrams: self.udp_datagrams.load(Ordering::Relaxed),
            sessions_reaped: self.sessions_reaped.load(Ordering::Relaxed),
            sessions_replaced: self.sessions_replaced.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"NovaGuard Server Metrics
========================
Uptime: {} seconds

Connections:
  Total:  {}
  Active: {}

Handshakes:
  Completed:         {}
  Failed:            {}
  Device Mismatches: {}

Packets:
  Processed: {}
  Rejected:  {}
  UDP:       {}

Traffic:
  Sent:     {} bytes
  Received: {} bytes

Sessions:
  Reaped:   {}
  Replaced: {}
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.handshakes_completed,
            snapshot.handshake_failures,
            snapshot.device_mismatches,
            snapshot.packets_processed,
            snapshot.packets_rejected,
            snapshot.udp_datagrams,
            snapshot.bytes_sent,
            snapshot.bytes_received,
            snapshot.sessions_reaped,
            snapshot.sessions_replaced,
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub handshakes_completed: u64,
    pub handshake_failures: u64,
    pub device_mismatches: u64,
    pub packets_processed: u64,
    pub packets_rejected: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub udp_datagrams: u64,
    pub sessions_reaped: u64,
    pub sessions_replaced: u64,
}

impl MetricsSnapshot {
    /// Share of accepted connections that completed the binding handshake.
    pub fn handshake_success_rate(&self) -> f64 {
        if self.total_connections == 0 {
            0.0
        } else {
            self.handshakes_completed as f64 / self.total_connections as f64
        }
    }

    /// Share of received packets that failed to decode.
    pub fn packet_rejection_rate(&self) -> f64 {
        let total = self.packets_processed + self.packets_rejected;
        if total == 0 {
            0.0
        } else {
            self.packets_rejected as f64 / total as f64
        }
    }
}
