//! Connection State Machine
//!
//! ```text
//! Idle -> Connecting -> Handshaking -> Authorizing -> Streaming
//!            ^    |          |              |            |
//!            |    +----------+------+-------+------------+
//!            |                      v
//!            +----------------- BackingOff
//!
//! Connecting | Handshaking -> Connecting (next candidate)
//! any -> Error (fatal, until the definition changes)
//! any -> Disposed (task disabled, deleted, or database unloaded)
//! ```
//!
//! Transitions are explicit. A forbidden transition is an error, never a
//! silent no-op. The dialing side goes straight from `Handshaking` to
//! `Streaming`; only the accepting side authorizes.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::errors::{ReplicationError, ReplicationResult};
use super::topology::ConnectionEndpoint;
use crate::storage::ChangeVector;

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Handshaking,
    Authorizing,
    Streaming,
    BackingOff,
    Error,
    Disposed,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl ConnectionStatus {
    /// Get the state name for observability.
    pub fn state_name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Handshaking => "Handshaking",
            Self::Authorizing => "Authorizing",
            Self::Streaming => "Streaming",
            Self::BackingOff => "BackingOff",
            Self::Error => "Error",
            Self::Disposed => "Disposed",
        }
    }

    /// Disposed machines never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disposed)
    }

    fn forbidden(self, to: ConnectionStatus) -> ReplicationError {
        ReplicationError::invalid_configuration(format!(
            "forbidden connection transition {} -> {}",
            self.state_name(),
            to.state_name()
        ))
    }

    // =========================================================================
    // TRANSITIONS
    // =========================================================================

    /// Idle | BackingOff | Error | Connecting | Handshaking -> Connecting
    ///
    /// Connecting or Handshaking -> Connecting advances to the next candidate
    /// after a retriable failure.
    pub fn connect(self) -> ReplicationResult<Self> {
        match self {
            Self::Idle
            | Self::BackingOff
            | Self::Error
            | Self::Connecting
            | Self::Handshaking => Ok(Self::Connecting),
            _ => Err(self.forbidden(Self::Connecting)),
        }
    }

    /// Connecting -> Handshaking (dialer), Idle -> Handshaking (acceptor)
    pub fn handshake(self) -> ReplicationResult<Self> {
        match self {
            Self::Connecting | Self::Idle => Ok(Self::Handshaking),
            _ => Err(self.forbidden(Self::Handshaking)),
        }
    }

    /// Handshaking -> Authorizing
    pub fn authorize(self) -> ReplicationResult<Self> {
        match self {
            Self::Handshaking => Ok(Self::Authorizing),
            _ => Err(self.forbidden(Self::Authorizing)),
        }
    }

    /// Handshaking | Authorizing -> Streaming
    pub fn stream(self) -> ReplicationResult<Self> {
        match self {
            Self::Handshaking | Self::Authorizing => Ok(Self::Streaming),
            _ => Err(self.forbidden(Self::Streaming)),
        }
    }

    /// Connecting | Handshaking | Authorizing | Streaming -> BackingOff
    pub fn back_off(self) -> ReplicationResult<Self> {
        match self {
            Self::Connecting | Self::Handshaking | Self::Authorizing | Self::Streaming => {
                Ok(Self::BackingOff)
            }
            _ => Err(self.forbidden(Self::BackingOff)),
        }
    }

    /// any live state -> Error
    pub fn fail(self) -> ReplicationResult<Self> {
        match self {
            Self::Disposed => Err(self.forbidden(Self::Error)),
            _ => Ok(Self::Error),
        }
    }

    /// any -> Disposed
    pub fn dispose(self) -> Self {
        Self::Disposed
    }
}

/// Runtime state of one connection. Never persisted.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionRuntimeState {
    pub status: ConnectionStatus,
    pub destination: Option<ConnectionEndpoint>,
    pub last_error: Option<String>,
    pub last_error_code: Option<&'static str>,
    /// Change vector the peer acknowledged for data we sent
    pub last_sent_change_vector: ChangeVector,
    /// Change vector after the last batch we applied from the peer
    pub last_accepted_change_vector: ChangeVector,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
}

/// Runtime state owned by one worker and read by status queries.
#[derive(Debug, Clone, Default)]
pub struct SharedRuntimeState {
    inner: Arc<RwLock<ConnectionRuntimeState>>,
}

impl SharedRuntimeState {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<T>(&self, f: impl FnOnce(&mut ConnectionRuntimeState) -> T) -> T {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> ConnectionRuntimeState {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).status
    }

    /// Apply a transition. Returns `(from, to)` on success.
    pub fn transition(
        &self,
        step: impl FnOnce(ConnectionStatus) -> ReplicationResult<ConnectionStatus>,
    ) -> ReplicationResult<(ConnectionStatus, ConnectionStatus)> {
        self.update(|s| {
            let from = s.status;
            let to = step(from)?;
            s.status = to;
            match to {
                ConnectionStatus::Streaming => {
                    s.connected_since = Some(Utc::now());
                    s.next_retry_at = None;
                }
                ConnectionStatus::Connecting | ConnectionStatus::BackingOff => {
                    s.connected_since = None;
                }
                _ => {}
            }
            Ok((from, to))
        })
    }

    pub fn set_destination(&self, endpoint: Option<ConnectionEndpoint>) {
        self.update(|s| s.destination = endpoint);
    }

    pub fn record_error(&self, err: &ReplicationError) {
        self.update(|s| {
            s.last_error = Some(err.message.clone());
            s.last_error_code = Some(err.kind.code());
        });
    }

    pub fn schedule_retry(&self, retry_count: u32, at: DateTime<Utc>) {
        self.update(|s| {
            s.retry_count = retry_count;
            s.next_retry_at = Some(at);
        });
    }

    pub fn reset_retries(&self) {
        self.update(|s| {
            s.retry_count = 0;
            s.next_retry_at = None;
        });
    }

    pub fn set_last_sent(&self, cv: ChangeVector) {
        self.update(|s| s.last_sent_change_vector = cv);
    }

    pub fn set_last_accepted(&self, cv: ChangeVector) {
        self.update(|s| s.last_accepted_change_vector = cv);
    }
}
