//! Cluster State Machine
//!
//! The state every node converges on by applying the same commands in log order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::commands::ClusterCommand;
use super::record::DatabaseRecord;
use super::topology::{ClusterTopology, NodeTag};
use crate::replication::{ReplicationError, ReplicationResult, TaskId};

/// Applied cluster state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterState {
    /// Index of the last applied command
    pub last_index: u64,
    pub topology: ClusterTopology,
    pub databases: BTreeMap<String, DatabaseRecord>,
}

/// Outcome of applying one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Task created or updated by the command, if any
    pub task_id: Option<TaskId>,
}

impl ClusterState {
    /// Look up a database record.
    pub fn database(&self, name: &str) -> Option<&DatabaseRecord> {
        self.databases.get(name)
    }

    fn database_mut(&mut self, name: &str) -> ReplicationResult<&mut DatabaseRecord> {
        self.databases.get_mut(name).ok_or_else(|| {
            ReplicationError::not_found(format!("database '{}' does not exist", name))
        })
    }

    /// Apply a command at `index`.
    ///
    /// On error the state is left untouched; callers apply to a copy.
    pub fn apply(&mut self, index: u64, command: &ClusterCommand) -> ReplicationResult<ApplyOutcome> {
        let mut task_id = None;
        match command {
            ClusterCommand::PutClusterTopology { topology } => {
                topology.validate()?;
                self.topology = topology.clone();
            }
            ClusterCommand::SetNodeAlive { node, alive } => {
                if !self.topology.set_alive(node, *alive) {
                    return Err(ReplicationError::not_found(format!(
                        "node {} is not a cluster member",
                        node
                    )));
                }
            }
            ClusterCommand::PutDatabase { database, topology } => {
                if topology.members.is_empty() {
                    return Err(ReplicationError::invalid_configuration(format!(
                        "database '{}' needs at least one member",
                        database
                    )));
                }
                if let Some(unknown) = topology
                    .members
                    .iter()
                    .find(|tag| self.topology.node(tag).is_none())
                {
                    return Err(ReplicationError::invalid_configuration(format!(
                        "node {} is not a cluster member",
                        unknown
                    )));
                }
                let record = self
                    .databases
                    .entry(database.clone())
                    .or_insert_with(|| DatabaseRecord::new(database.clone(), topology.clone()));
                record.topology = topology.clone();
            }
            ClusterCommand::DeleteDatabase { database } => {
                if self.databases.remove(database).is_none() {
                    return Err(ReplicationError::not_found(format!(
                        "database '{}' does not exist",
                        database
                    )));
                }
            }
            ClusterCommand::DefineHub {
                database,
                definition,
            } => {
                task_id = Some(self.database_mut(database)?.put_hub(definition.clone(), index)?);
            }
            ClusterCommand::RegisterAccess { database, grant } => {
                self.database_mut(database)?.add_grant(grant.clone())?;
            }
            ClusterCommand::UnregisterAccess {
                database,
                hub,
                thumbprint,
            } => {
                self.database_mut(database)?.remove_grant(hub, thumbprint)?;
            }
            ClusterCommand::DefineSink {
                database,
                definition,
            } => {
                task_id = Some(self.database_mut(database)?.put_sink(definition.clone(), index)?);
            }
            ClusterCommand::DefineExternalReplication {
                database,
                definition,
            } => {
                task_id = Some(
                    self.database_mut(database)?
                        .put_external(definition.clone(), index)?,
                );
            }
            ClusterCommand::PutConnectionString {
                database,
                connection_string,
            } => {
                self.database_mut(database)?
                    .put_connection_string(connection_string.clone())?;
            }
            ClusterCommand::ToggleTask {
                database,
                task_id: id,
                disabled,
            } => {
                self.database_mut(database)?.toggle_task(*id, *disabled)?;
                task_id = Some(*id);
            }
            ClusterCommand::DeleteTask {
                database,
                task_id: id,
            } => {
                self.database_mut(database)?.delete_task(*id)?;
                task_id = Some(*id);
            }
        }

        if let Some(db) = command.database() {
            if let Some(record) = self.databases.get_mut(db) {
                record.etag = index;
            }
        }
        self.last_index = index;
        Ok(ApplyOutcome { task_id })
    }

    /// Check whether a node hosts a database.
    pub fn hosts(&self, node: &NodeTag, database: &str) -> bool {
        self.database(database)
            .map(|r| r.topology.contains(node))
            .unwrap_or(false)
    }
}
