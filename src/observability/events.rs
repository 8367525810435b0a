//! Observability events for aerohub
//!
//! Every log line carries an `event` field taken from this closed vocabulary,
//! so replication lifecycles can be followed across nodes by grepping one name.

use std::fmt;

/// Observable events in aerohub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Boot & Lifecycle
    /// Node startup begins
    BootStart,
    /// Node startup complete
    BootComplete,
    /// Shutdown initiated
    ShutdownStart,
    /// Shutdown complete
    ShutdownComplete,
    /// Configuration loaded
    ConfigLoaded,
    /// Admin HTTP surface serving
    Serving,
    /// Replication listener accepting
    ReplicationListening,

    // Consensus
    /// Command applied to cluster state
    ConsensusApplied,
    /// Command consumed an index but was rejected at apply time
    ConsensusApplyRejected,
    /// Proposal not committed
    ConsensusCommitFailed,
    /// Proposal with an already-seen request id
    ConsensusDuplicateRequest,

    // Administrative operations
    /// Hub definition committed
    HubDefined,
    /// Access grant committed
    AccessRegistered,
    /// Access grant removed
    AccessUnregistered,
    /// Sink definition committed
    SinkDefined,
    /// External replication committed
    ExternalReplicationDefined,
    /// Connection string committed
    ConnectionStringDefined,
    /// Task enabled or disabled
    TaskToggled,
    /// Task deleted
    TaskDeleted,
    /// Admin request rejected before reaching consensus
    AdminRequestRejected,

    // Connection lifecycle
    /// Dialing a candidate
    ConnectionAttempt,
    /// Candidate failed, trying the next one
    ConnectionFailed,
    /// Acceptor admitted a handshake
    HandshakeAccepted,
    /// Acceptor refused a handshake
    HandshakeRejected,
    /// Connection entered Streaming
    StreamingStarted,
    /// Connection left Streaming
    StreamingStopped,
    /// Waiting before the next round of candidates
    Backoff,
    /// Every candidate failed
    TopologyExhausted,
    /// Fatal failure, parked in Error until the definition changes
    ConnectionParked,
    /// Machine disposed
    ConnectionDisposed,

    // Streaming
    /// Batch written to the peer
    BatchSent,
    /// Peer batch applied locally
    BatchApplied,

    // Orchestration
    /// Outgoing task started on this node
    TaskStarted,
    /// Outgoing task stopped on this node
    TaskStopped,
    /// Incoming connection closed because its hub or grant went away
    IncomingRevoked,

    // Databases
    /// Database loaded into memory
    DatabaseLoaded,
    /// Database unloaded after idling
    DatabaseUnloaded,
    /// Unload skipped because connections are active
    UnloadVetoed,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            // Boot & Lifecycle
            Event::BootStart => "AEROHUB_STARTUP_BEGIN",
            Event::BootComplete => "AEROHUB_STARTUP_COMPLETE",
            Event::ShutdownStart => "SHUTDOWN_START",
            Event::ShutdownComplete => "SHUTDOWN_COMPLETE",
            Event::ConfigLoaded => "CONFIG_LOADED",
            Event::Serving => "AEROHUB_SERVING",
            Event::ReplicationListening => "REPLICATION_LISTENING",

            // Consensus
            Event::ConsensusApplied => "CONSENSUS_APPLIED",
            Event::ConsensusApplyRejected => "CONSENSUS_APPLY_REJECTED",
            Event::ConsensusCommitFailed => "CONSENSUS_COMMIT_FAILED",
            Event::ConsensusDuplicateRequest => "CONSENSUS_DUPLICATE_REQUEST",

            // Admin
            Event::HubDefined => "HUB_DEFINED",
            Event::AccessRegistered => "ACCESS_REGISTERED",
            Event::AccessUnregistered => "ACCESS_UNREGISTERED",
            Event::SinkDefined => "SINK_DEFINED",
            Event::ExternalReplicationDefined => "EXTERNAL_REPLICATION_DEFINED",
            Event::ConnectionStringDefined => "CONNECTION_STRING_DEFINED",
            Event::TaskToggled => "TASK_TOGGLED",
            Event::TaskDeleted => "TASK_DELETED",
            Event::AdminRequestRejected => "ADMIN_REQUEST_REJECTED",

            // Connection
            Event::ConnectionAttempt => "CONNECTION_ATTEMPT",
            Event::ConnectionFailed => "CONNECTION_FAILED",
            Event::HandshakeAccepted => "HANDSHAKE_ACCEPTED",
            Event::HandshakeRejected => "HANDSHAKE_REJECTED",
            Event::StreamingStarted => "STREAMING_STARTED",
            Event::StreamingStopped => "STREAMING_STOPPED",
            Event::Backoff => "BACKOFF",
            Event::TopologyExhausted => "TOPOLOGY_EXHAUSTED",
            Event::ConnectionParked => "CONNECTION_PARKED",
            Event::ConnectionDisposed => "CONNECTION_DISPOSED",

            // Streaming
            Event::BatchSent => "BATCH_SENT",
            Event::BatchApplied => "BATCH_APPLIED",

            // Orchestration
            Event::TaskStarted => "TASK_STARTED",
            Event::TaskStopped => "TASK_STOPPED",
            Event::IncomingRevoked => "INCOMING_REVOKED",

            // Databases
            Event::DatabaseLoaded => "DATABASE_LOADED",
            Event::DatabaseUnloaded => "DATABASE_UNLOADED",
            Event::UnloadVetoed => "UNLOAD_VETOED",
        }
    }

    /// Returns true if this event means a task stopped replicating until an operator acts
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::ConnectionParked)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
