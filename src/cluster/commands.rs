//! Cluster Commands
//!
//! Every configuration change is one of these commands. Commands are proposed
//! to the consensus log with a caller-supplied request id and only take effect
//! once applied.

use serde::{Deserialize, Serialize};

use super::topology::{ClusterTopology, DatabaseTopology, NodeTag};
use crate::replication::{
    ExternalReplicationDefinition, HubAccessGrant, HubDefinition, ReplicationConnectionString,
    SinkDefinition, TaskId,
};

/// A configuration change submitted through consensus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum ClusterCommand {
    PutClusterTopology {
        topology: ClusterTopology,
    },
    SetNodeAlive {
        node: NodeTag,
        alive: bool,
    },
    PutDatabase {
        database: String,
        topology: DatabaseTopology,
    },
    DeleteDatabase {
        database: String,
    },
    DefineHub {
        database: String,
        definition: HubDefinition,
    },
    RegisterAccess {
        database: String,
        grant: HubAccessGrant,
    },
    UnregisterAccess {
        database: String,
        hub: String,
        thumbprint: String,
    },
    DefineSink {
        database: String,
        definition: SinkDefinition,
    },
    DefineExternalReplication {
        database: String,
        definition: ExternalReplicationDefinition,
    },
    PutConnectionString {
        database: String,
        connection_string: ReplicationConnectionString,
    },
    ToggleTask {
        database: String,
        task_id: TaskId,
        disabled: bool,
    },
    DeleteTask {
        database: String,
        task_id: TaskId,
    },
}

impl ClusterCommand {
    /// Database the command targets, if any.
    pub fn database(&self) -> Option<&str> {
        match self {
            Self::PutClusterTopology { .. } | Self::SetNodeAlive { .. } => None,
            Self::PutDatabase { database, .. }
            | Self::DeleteDatabase { database }
            | Self::DefineHub { database, .. }
            | Self::RegisterAccess { database, .. }
            | Self::UnregisterAccess { database, .. }
            | Self::DefineSink { database, .. }
            | Self::DefineExternalReplication { database, .. }
            | Self::PutConnectionString { database, .. }
            | Self::ToggleTask { database, .. }
            | Self::DeleteTask { database, .. } => Some(database),
        }
    }

    /// Command name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PutClusterTopology { .. } => "PutClusterTopology",
            Self::SetNodeAlive { .. } => "SetNodeAlive",
            Self::PutDatabase { .. } => "PutDatabase",
            Self::DeleteDatabase { .. } => "DeleteDatabase",
            Self::DefineHub { .. } => "DefineHub",
            Self::RegisterAccess { .. } => "RegisterAccess",
            Self::UnregisterAccess { .. } => "UnregisterAccess",
            Self::DefineSink { .. } => "DefineSink",
            Self::DefineExternalReplication { .. } => "DefineExternalReplication",
            Self::PutConnectionString { .. } => "PutConnectionString",
            Self::ToggleTask { .. } => "ToggleTask",
            Self::DeleteTask { .. } => "DeleteTask",
        }
    }
}

/// What an applied command changed, broadcast to every node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterChange {
    /// Log index the change was applied at
    pub index: u64,
    /// Database whose record changed; `None` for cluster topology changes
    pub database: Option<String>,
    /// Command that produced the change
    pub command: &'static str,
}

impl ClusterChange {
    /// Check whether the change affects cluster topology.
    pub fn is_topology_change(&self) -> bool {
        self.database.is_none()
    }
}
