//! Replication metrics for aerohub
//!
//! - Counters only, monotonic
//! - Reset only on process start
//! - Thread-safe but lock-minimal

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Node-wide replication counters
///
/// All counters use Relaxed ordering; metrics tolerate eventual consistency.
#[derive(Debug, Default)]
pub struct ReplicationMetrics {
    /// Outgoing dial attempts
    connection_attempts: AtomicU64,
    /// Outgoing dial or handshake failures
    connection_failures: AtomicU64,
    /// Incoming handshakes admitted
    handshakes_accepted: AtomicU64,
    /// Incoming handshakes refused
    handshakes_rejected: AtomicU64,
    /// Backoff rounds entered
    retries: AtomicU64,
    /// Batches written to peers
    batches_sent: AtomicU64,
    /// Items written to peers
    items_sent: AtomicU64,
    /// Batches applied from peers
    batches_received: AtomicU64,
    /// Items applied from peers
    items_received: AtomicU64,
    /// Frame bytes written
    bytes_sent: AtomicU64,
    /// Databases loaded on demand
    databases_loaded: AtomicU64,
    /// Databases unloaded after idling
    databases_unloaded: AtomicU64,
}

impl ReplicationMetrics {
    /// Create a registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Connections

    pub fn increment_connection_attempts(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_connection_failures(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handshakes_accepted(&self) {
        self.handshakes_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_handshakes_rejected(&self) {
        self.handshakes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    // Streaming

    /// Record one batch written to a peer
    pub fn record_batch_sent(&self, items: usize, bytes: usize) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.items_sent.fetch_add(items as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one batch applied from a peer
    pub fn record_batch_received(&self, items: usize) {
        self.batches_received.fetch_add(1, Ordering::Relaxed);
        self.items_received.fetch_add(items as u64, Ordering::Relaxed);
    }

    // Databases

    pub fn increment_databases_loaded(&self) {
        self.databases_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_databases_unloaded(&self) {
        self.databases_unloaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            handshakes_accepted: self.handshakes_accepted.load(Ordering::Relaxed),
            handshakes_rejected: self.handshakes_rejected.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            items_sent: self.items_sent.load(Ordering::Relaxed),
            batches_received: self.batches_received.load(Ordering::Relaxed),
            items_received: self.items_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            databases_loaded: self.databases_loaded.load(Ordering::Relaxed),
            databases_unloaded: self.databases_unloaded.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub handshakes_accepted: u64,
    pub handshakes_rejected: u64,
    pub retries: u64,
    pub batches_sent: u64,
    pub items_sent: u64,
    pub batches_received: u64,
    pub items_received: u64,
    pub bytes_sent: u64,
    pub databases_loaded: u64,
    pub databases_unloaded: u64,
}
