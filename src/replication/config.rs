//! Replication Settings
//!
//! Node-wide tuning for connection workers, loaded from the `replication`
//! section of the node configuration. Every field has a default, so an empty
//! section is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{ReplicationError, ReplicationResult};
use super::failure::RetryPolicy;

/// Replication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// First backoff delay after a failed connection cycle
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff cap
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Maximum items per batch frame
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Offer deflate compression during the handshake
    #[serde(default = "default_compression")]
    pub compression: bool,

    /// Frames at least this large are compressed when compression is agreed
    #[serde(default = "default_compression_threshold_bytes")]
    pub compression_threshold_bytes: usize,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// How long an inbound dial waits for an idle database to load
    #[serde(default = "default_database_load_timeout_ms")]
    pub database_load_timeout_ms: u64,

    /// Loaded databases idle for longer than this are unloaded by the sweep
    #[serde(default = "default_idle_unload_after_ms")]
    pub idle_unload_after_ms: u64,

    /// Entries kept per destination in the failure logs
    #[serde(default = "default_failure_history")]
    pub failure_history: usize,
}

fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_max_batch_size() -> usize {
    1024
}
fn default_compression() -> bool {
    true
}
fn default_compression_threshold_bytes() -> usize {
    4096
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_database_load_timeout_ms() -> u64 {
    5_000
}
fn default_idle_unload_after_ms() -> u64 {
    300_000
}
fn default_failure_history() -> usize {
    16
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_batch_size: default_max_batch_size(),
            compression: default_compression(),
            compression_threshold_bytes: default_compression_threshold_bytes(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            database_load_timeout_ms: default_database_load_timeout_ms(),
            idle_unload_after_ms: default_idle_unload_after_ms(),
            failure_history: default_failure_history(),
        }
    }
}

impl ReplicationSettings {
    /// Settings tuned for in-process tests: short timers, same semantics.
    pub fn fast() -> Self {
        Self {
            initial_backoff_ms: 50,
            max_backoff_ms: 400,
            heartbeat_interval_ms: 200,
            connect_timeout_ms: 500,
            handshake_timeout_ms: 1_000,
            database_load_timeout_ms: 500,
            ..Self::default()
        }
    }

    /// Validate the settings.
    pub fn validate(&self) -> ReplicationResult<()> {
        if self.initial_backoff_ms == 0 {
            return Err(ReplicationError::invalid_configuration(
                "replication.initial_backoff_ms must be positive",
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ReplicationError::invalid_configuration(
                "replication.max_backoff_ms must not be below initial_backoff_ms",
            ));
        }
        if self.max_batch_size == 0 {
            return Err(ReplicationError::invalid_configuration(
                "replication.max_batch_size must be positive",
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ReplicationError::invalid_configuration(
                "replication.heartbeat_interval_ms must be positive",
            ));
        }
        if self.connect_timeout_ms == 0
            || self.handshake_timeout_ms == 0
            || self.database_load_timeout_ms == 0
        {
            return Err(ReplicationError::invalid_configuration(
                "replication timeouts must be positive",
            ));
        }
        if self.failure_history == 0 {
            return Err(ReplicationError::invalid_configuration(
                "replication.failure_history must be positive",
            ));
        }
        Ok(())
    }

    /// Backoff policy for connection cycles.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(Duration::from_millis(self.initial_backoff_ms))
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
            .with_jitter(0.2)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn database_load_timeout(&self) -> Duration {
        Duration::from_millis(self.database_load_timeout_ms)
    }

    pub fn idle_unload_after(&self) -> Duration {
        Duration::from_millis(self.idle_unload_after_ms)
    }
}
