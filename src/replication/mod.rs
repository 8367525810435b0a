//! Replication Subsystem
//!
//! Coordinates document replication between databases:
//! - Hub/sink pull replication, with certificate-scoped grants on the hub
//! - External replication, one database pushing into another
//!
//! Definitions live in the cluster record and change only through consensus
//! (`AccessRegistry`). Each node runs one `ReplicationOrchestrator` per loaded
//! database; it starts a dialing worker for every enabled task this node is
//! responsible for, and tracks connections admitted by `IncomingHandler`.
//!
//! ## Guarantees
//! - At most one dialing worker per task per node
//! - Revoking a grant, disabling or deleting a hub closes its connections
//! - A database with an active replication connection is never unloaded
//! - Authorization failures park the task until its definition changes

mod access;
mod config;
mod definitions;
mod errors;
mod failure;
mod idle;
mod incoming;
mod orchestrator;
mod outgoing;
mod paths;
mod session;
mod state;
mod topology;

pub mod protocol;
pub mod transport;

pub use access::{AccessListing, AccessRegistry, RegisterAccessRequest, TaskCommitted, DEFAULT_PAGE_SIZE};
pub use config::ReplicationSettings;
pub use definitions::{
    ExternalReplicationDefinition, HubAccessGrant, HubDefinition, OngoingTask, OngoingTaskType,
    ReplicationConnectionString, ReplicationMode, SinkDefinition, TaskId,
};
pub use errors::{FailureClass, ReplicationError, ReplicationErrorKind, ReplicationResult};
pub use failure::{
    FailureRecord, FailureSnapshot, FailureTracker, IncomingRejectionStats, OutgoingFailureInfo,
    RetryPolicy,
};
pub use idle::{ActiveConnectionGuard, IdleCoordinator};
pub use incoming::{DatabaseResolver, IncomingHandler};
pub use orchestrator::{
    IncomingConnectionStatus, IncomingRegistration, IncomingTerms, OutgoingTaskStatus, ReplicationContext,
    ReplicationOrchestrator, ReplicationStatus,
};
pub use paths::{is_allowed, path_matches, validate_paths};
pub use state::{ConnectionRuntimeState, ConnectionStatus, SharedRuntimeState};
pub use topology::{CandidateNode, ConnectionEndpoint, TopologyNode, TopologyResolver};
pub use transport::{
    BoxedStream, Connector, MemoryListener, MemoryNetwork, ReplicationListener, TcpConnector,
    TcpReplicationListener,
};
