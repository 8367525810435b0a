//! Replication Error Types
//!
//! Every failure in the replication subsystem carries a kind that decides how it
//! is handled:
//! - Configuration errors are rejected synchronously at the admin boundary
//! - Authorization errors are fatal until the grant changes
//! - Transient errors are retried with backoff, never abandoned
//! - Consensus commit errors are retriable at the request level

use std::fmt;

/// Replication error type
#[derive(Debug, Clone)]
pub struct ReplicationError {
    /// Error kind
    pub kind: ReplicationErrorKind,
    /// Error message
    pub message: String,
}

/// Replication error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationErrorKind {
    /// Bad request shape or configuration rule violation
    InvalidConfiguration,

    /// `(hub, thumbprint)` already registered
    DuplicateGrant,

    /// Referenced hub, task, database or grant does not exist
    NotFound,

    /// Certificate unknown or revoked, or requested mode/path not granted
    Authorization,

    /// Destination does not define the requested hub
    UnknownHub,

    /// Peer speaks an incompatible protocol version
    ProtocolMismatch,

    /// Destination database is idle and could not be woken in time
    DatabaseIdle,

    /// Destination database does not exist on the destination node
    DatabaseMissing,

    /// Network failure or peer temporarily unreachable
    Transient,

    /// No live candidate destination remained
    TopologyExhausted,

    /// Configuration command was not applied by consensus
    ConsensusCommit,

    /// Document store failure
    Storage,

    /// Owning task was cancelled
    Cancelled,
}

/// Failure class used to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Rejected at the admin boundary
    Configuration,
    /// Fatal for the current grant version
    Authorization,
    /// Retried with exponential backoff
    TransientConnectivity,
    /// Retried at the outer cadence after re-resolving topology
    TopologyExhaustion,
    /// Retriable by the administrative caller
    ConsensusCommit,
    /// Not a failure: the task was stopped on purpose
    Cancelled,
}

impl ReplicationErrorKind {
    /// Stable code for logs and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration => "AEROHUB_INVALID_CONFIGURATION",
            Self::DuplicateGrant => "AEROHUB_DUPLICATE_GRANT",
            Self::NotFound => "AEROHUB_NOT_FOUND",
            Self::Authorization => "AEROHUB_AUTHORIZATION",
            Self::UnknownHub => "AEROHUB_UNKNOWN_HUB",
            Self::ProtocolMismatch => "AEROHUB_PROTOCOL_MISMATCH",
            Self::DatabaseIdle => "AEROHUB_DATABASE_IDLE",
            Self::DatabaseMissing => "AEROHUB_DATABASE_MISSING",
            Self::Transient => "AEROHUB_TRANSIENT",
            Self::TopologyExhausted => "AEROHUB_TOPOLOGY_EXHAUSTED",
            Self::ConsensusCommit => "AEROHUB_CONSENSUS_COMMIT",
            Self::Storage => "AEROHUB_STORAGE",
            Self::Cancelled => "AEROHUB_CANCELLED",
        }
    }
}

impl ReplicationError {
    /// Create a new replication error.
    pub fn new(kind: ReplicationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::InvalidConfiguration, message)
    }

    /// Create a duplicate grant error.
    pub fn duplicate_grant(hub: &str, thumbprint: &str) -> Self {
        Self::new(
            ReplicationErrorKind::DuplicateGrant,
            format!(
                "hub '{}' already has an access grant for certificate {}",
                hub, thumbprint
            ),
        )
    }

    /// Create a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::NotFound, message)
    }

    /// Create an authorization error.
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Authorization, message)
    }

    /// Create an unknown hub error.
    pub fn unknown_hub(hub: &str, database: &str) -> Self {
        Self::new(
            ReplicationErrorKind::UnknownHub,
            format!("database '{}' does not define hub '{}'", database, hub),
        )
    }

    /// Create a protocol mismatch error.
    pub fn protocol_mismatch(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::ProtocolMismatch, message)
    }

    /// Create a database idle error.
    pub fn database_idle(database: &str) -> Self {
        Self::new(
            ReplicationErrorKind::DatabaseIdle,
            format!("database '{}' is idle and could not be loaded", database),
        )
    }

    /// Create a database missing error.
    pub fn database_missing(database: &str) -> Self {
        Self::new(
            ReplicationErrorKind::DatabaseMissing,
            format!("database '{}' does not exist", database),
        )
    }

    /// Create a transient connectivity error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Transient, message)
    }

    /// Create a topology exhausted error.
    pub fn topology_exhausted(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::TopologyExhausted, message)
    }

    /// Create a consensus commit error.
    pub fn consensus_commit(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::ConsensusCommit, message)
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Storage, message)
    }

    /// Create a cancelled error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ReplicationErrorKind::Cancelled, message)
    }

    /// Map this error onto the failure taxonomy.
    pub fn class(&self) -> FailureClass {
        match self.kind {
            ReplicationErrorKind::InvalidConfiguration
            | ReplicationErrorKind::DuplicateGrant
            | ReplicationErrorKind::NotFound
            | ReplicationErrorKind::UnknownHub
            | ReplicationErrorKind::ProtocolMismatch
            | ReplicationErrorKind::DatabaseMissing => FailureClass::Configuration,
            ReplicationErrorKind::Authorization => FailureClass::Authorization,
            ReplicationErrorKind::DatabaseIdle
            | ReplicationErrorKind::Transient
            | ReplicationErrorKind::Storage => FailureClass::TransientConnectivity,
            ReplicationErrorKind::TopologyExhausted => FailureClass::TopologyExhaustion,
            ReplicationErrorKind::ConsensusCommit => FailureClass::ConsensusCommit,
            ReplicationErrorKind::Cancelled => FailureClass::Cancelled,
        }
    }

    /// Check if retrying can succeed without a configuration change.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.class(),
            FailureClass::TransientConnectivity
                | FailureClass::TopologyExhaustion
                | FailureClass::ConsensusCommit
        )
    }

    /// Check if this error parks a connection until its definition changes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            FailureClass::Configuration | FailureClass::Authorization
        )
    }
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicationError({:?}): {}", self.kind, self.message)
    }
}

impl std::error::Error for ReplicationError {}

impl From<std::io::Error> for ReplicationError {
    fn from(err: std::io::Error) -> Self {
        Self::transient(err.to_string())
    }
}

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;
