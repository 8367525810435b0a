//! Cluster Subsystem
//!
//! Replicated configuration shared by every node:
//! - Cluster and database topology
//! - Database records holding replication definitions and grants
//! - The consensus seam configuration changes are committed through
//!
//! Nodes never mutate a record directly. They propose a `ClusterCommand`, wait
//! for its index, and react to the `ClusterChange` broadcast.

mod commands;
mod consensus;
mod record;
mod state;
mod topology;

pub use commands::{ClusterChange, ClusterCommand};
pub use consensus::{ConsensusLog, InMemoryConsensus};
pub use record::DatabaseRecord;
pub use state::{ApplyOutcome, ClusterState};
pub use topology::{ClusterNode, ClusterTopology, DatabaseTopology, NodeTag};
