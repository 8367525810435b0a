//! Access Registry
//!
//! Administrative entry point for replication configuration. Every mutation:
//!
//! 1. Is validated against the local snapshot, so configuration errors come
//!    back synchronously without consuming a log index
//! 2. Is proposed to consensus under the caller's request id
//! 3. Returns only after the command index is applied locally
//!
//! Rules that depend only on replicated state (names, grants against their
//! hub, connection strings) are checked again at apply time, and that check
//! is authoritative. The security gate depends on this node's security mode
//! and is only checked here.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::definitions::{
    ExternalReplicationDefinition, HubAccessGrant, HubDefinition, ReplicationConnectionString,
    SinkDefinition, TaskId,
};
use super::errors::{ReplicationError, ReplicationResult};
use super::topology::TopologyResolver;
use crate::cluster::{ClusterCommand, ClusterState, ConsensusLog, DatabaseRecord, NodeTag};
use crate::observability::Event;
use crate::security::{parse_bundle, parse_certificate, ServerSecurity};

/// Grant registration as submitted by an administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterAccessRequest {
    pub name: String,
    /// Base64 public certificate of the sink
    pub certificate: String,
    #[serde(default)]
    pub allowed_hub_to_sink_paths: BTreeSet<String>,
    #[serde(default)]
    pub allowed_sink_to_hub_paths: BTreeSet<String>,
}

/// One page of grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccessListing {
    pub results: Vec<HubAccessGrant>,
    /// Matching grants before paging
    pub total_results: usize,
}

/// Result of committing a task definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskCommitted {
    pub raft_command_index: u64,
    pub task_id: TaskId,
    /// Node that runs the task, when a live member exists
    pub responsible_node: Option<NodeTag>,
}

/// Default page size for `list_access`.
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// Replication configuration front end.
pub struct AccessRegistry {
    consensus: Arc<dyn ConsensusLog>,
    security: ServerSecurity,
    commit_timeout: Duration,
}

fn record<'a>(state: &'a ClusterState, database: &str) -> ReplicationResult<&'a DatabaseRecord> {
    state
        .database(database)
        .ok_or_else(|| ReplicationError::not_found(format!("database '{}' does not exist", database)))
}

fn hub<'a>(record: &'a DatabaseRecord, name: &str) -> ReplicationResult<&'a HubDefinition> {
    record.hub(name).ok_or_else(|| {
        ReplicationError::not_found(format!(
            "hub '{}' does not exist on database '{}'",
            name, record.name
        ))
    })
}

impl AccessRegistry {
    pub fn new(consensus: Arc<dyn ConsensusLog>, security: ServerSecurity, commit_timeout: Duration) -> Self {
        Self {
            consensus,
            security,
            commit_timeout,
        }
    }

    pub fn security(&self) -> &ServerSecurity {
        &self.security
    }

    /// Latest applied state.
    pub fn snapshot(&self) -> Arc<ClusterState> {
        self.consensus.snapshot()
    }

    fn rejected(&self, operation: &str, database: &str, err: ReplicationError) -> ReplicationError {
        tracing::warn!(
            event = Event::AdminRequestRejected.as_str(),
            operation,
            database,
            code = err.kind.code(),
            error = %err.message,
            "configuration request rejected"
        );
        err
    }

    async fn commit(&self, request_id: &str, command: ClusterCommand) -> ReplicationResult<u64> {
        let index = self.consensus.propose(request_id, command).await?;
        self.consensus.wait_for_index(index, self.commit_timeout).await?;
        Ok(index)
    }

    fn committed_task(&self, database: &str, index: u64, find: impl Fn(&DatabaseRecord) -> Option<TaskId>) -> ReplicationResult<TaskCommitted> {
        let state = self.consensus.snapshot();
        let record = record(&state, database)?;
        let task_id = find(record).ok_or_else(|| {
            ReplicationError::not_found(format!("task committed at index {} no longer exists", index))
        })?;
        let responsible_node = record
            .task(task_id)
            .and_then(|task| TopologyResolver::responsible_node(&task, &record.topology, &state.topology));
        Ok(TaskCommitted {
            raft_command_index: index,
            task_id,
            responsible_node,
        })
    }

    // =========================================================================
    // HUBS AND GRANTS
    // =========================================================================

    /// Create or update a hub definition.
    pub async fn define_hub(
        &self,
        database: &str,
        request_id: &str,
        definition: HubDefinition,
    ) -> ReplicationResult<TaskCommitted> {
        let check = || -> ReplicationResult<()> {
            definition.validate(&self.security)?;
            record(&self.consensus.snapshot(), database)?.check_hub_update(&definition)
        };
        check().map_err(|e| self.rejected("define_hub", database, e))?;

        let name = definition.name.clone();
        let index = self
            .commit(
                request_id,
                ClusterCommand::DefineHub {
                    database: database.to_string(),
                    definition,
                },
            )
            .await?;
        let committed = self.committed_task(database, index, |r| r.hub(&name).map(|h| h.task_id))?;
        tracing::info!(
            event = Event::HubDefined.as_str(),
            database,
            hub = %name,
            task_id = %committed.task_id,
            index,
            "hub defined"
        );
        Ok(committed)
    }

    /// Register a certificate grant on a hub. Returns the applied index.
    pub async fn register_access(
        &self,
        database: &str,
        hub_name: &str,
        request_id: &str,
        request: RegisterAccessRequest,
    ) -> ReplicationResult<u64> {
        let build = || -> ReplicationResult<HubAccessGrant> {
            let certificate = parse_certificate(&request.certificate)?;
            let state = self.consensus.snapshot();
            let record = record(&state, database)?;
            let hub = hub(record, hub_name)?;
            if hub.has_legacy_certificates() {
                return Err(ReplicationError::invalid_configuration(format!(
                    "hub '{}' still carries legacy inline certificates; migrate them before registering access",
                    hub.name
                )));
            }
            let grant = HubAccessGrant {
                hub_name: hub.name.clone(),
                grant_name: request.name.clone(),
                certificate_thumbprint: certificate.info.thumbprint.clone(),
                certificate_public_info: certificate.info,
                allowed_hub_to_sink_paths: request.allowed_hub_to_sink_paths.clone(),
                allowed_sink_to_hub_paths: request.allowed_sink_to_hub_paths.clone(),
            };
            grant.validate(hub)?;
            if record.grant(&hub.name, &grant.certificate_thumbprint).is_some() {
                return Err(ReplicationError::duplicate_grant(&hub.name, &grant.certificate_thumbprint));
            }
            Ok(grant)
        };
        let grant = build().map_err(|e| self.rejected("register_access", database, e))?;

        let thumbprint = grant.certificate_thumbprint.clone();
        let index = self
            .commit(
                request_id,
                ClusterCommand::RegisterAccess {
                    database: database.to_string(),
                    grant,
                },
            )
            .await?;
        tracing::info!(
            event = Event::AccessRegistered.as_str(),
            database,
            hub = hub_name,
            thumbprint = %thumbprint,
            index,
            "access registered"
        );
        Ok(index)
    }

    /// Remove a grant. Connections admitted under it are closed on apply.
    pub async fn unregister_access(
        &self,
        database: &str,
        hub_name: &str,
        thumbprint: &str,
        request_id: &str,
    ) -> ReplicationResult<u64> {
        let check = || -> ReplicationResult<()> {
            let state = self.consensus.snapshot();
            let record = record(&state, database)?;
            let hub = hub(record, hub_name)?;
            if record.grant(&hub.name, thumbprint).is_none() {
                return Err(ReplicationError::not_found(format!(
                    "hub '{}' has no grant for certificate {}",
                    hub.name, thumbprint
                )));
            }
            Ok(())
        };
        check().map_err(|e| self.rejected("unregister_access", database, e))?;

        let index = self
            .commit(
                request_id,
                ClusterCommand::UnregisterAccess {
                    database: database.to_string(),
                    hub: hub_name.to_string(),
                    thumbprint: thumbprint.to_string(),
                },
            )
            .await?;
        tracing::info!(
            event = Event::AccessUnregistered.as_str(),
            database,
            hub = hub_name,
            thumbprint,
            index,
            "access unregistered"
        );
        Ok(index)
    }

    /// Page through a hub's grants, optionally filtered by name, thumbprint
    /// or certificate subject (case-insensitive substring).
    pub fn list_access(
        &self,
        database: &str,
        hub_name: &str,
        filter: Option<&str>,
        start: usize,
        page_size: usize,
    ) -> ReplicationResult<AccessListing> {
        let state = self.consensus.snapshot();
        let record = record(&state, database)?;
        let hub = hub(record, hub_name)?;
        let needle = filter.map(str::trim).filter(|f| !f.is_empty()).map(str::to_lowercase);

        let matching: Vec<&HubAccessGrant> = record
            .grants(&hub.name)
            .iter()
            .filter(|g| match &needle {
                None => true,
                Some(n) => {
                    g.grant_name.to_lowercase().contains(n)
                        || g.certificate_public_info.subject.to_lowercase().contains(n)
                        || g.certificate_thumbprint.to_lowercase().contains(n)
                }
            })
            .collect();

        Ok(AccessListing {
            total_results: matching.len(),
            results: matching
                .into_iter()
                .skip(start)
                .take(if page_size == 0 { DEFAULT_PAGE_SIZE } else { page_size })
                .cloned()
                .collect(),
        })
    }

    // =========================================================================
    // DIALING TASKS
    // =========================================================================

    /// Create or update a sink.
    pub async fn define_sink(
        &self,
        database: &str,
        request_id: &str,
        definition: SinkDefinition,
    ) -> ReplicationResult<TaskCommitted> {
        let check = || -> ReplicationResult<()> {
            definition.validate(&self.security)?;
            if let Some(bundle) = &definition.certificate_with_private_key {
                parse_bundle(bundle)?;
            }
            let state = self.consensus.snapshot();
            let record = record(&state, database)?;
            if record.connection_string(&definition.connection_string_name).is_none() {
                return Err(ReplicationError::invalid_configuration(format!(
                    "connection string '{}' does not exist",
                    definition.connection_string_name
                )));
            }
            Ok(())
        };
        check().map_err(|e| self.rejected("define_sink", database, e))?;

        let name = definition.name.clone();
        let index = self
            .commit(
                request_id,
                ClusterCommand::DefineSink {
                    database: database.to_string(),
                    definition,
                },
            )
            .await?;
        let committed = self.committed_task(database, index, |r| {
            r.sinks.iter().find(|s| s.name.eq_ignore_ascii_case(&name)).map(|s| s.task_id)
        })?;
        tracing::info!(
            event = Event::SinkDefined.as_str(),
            database,
            sink = %name,
            task_id = %committed.task_id,
            responsible_node = ?committed.responsible_node,
            index,
            "sink defined"
        );
        Ok(committed)
    }

    /// Create or update an external replication.
    pub async fn define_external(
        &self,
        database: &str,
        request_id: &str,
        definition: ExternalReplicationDefinition,
    ) -> ReplicationResult<TaskCommitted> {
        let check = || -> ReplicationResult<()> {
            definition.validate()?;
            let state = self.consensus.snapshot();
            if record(&state, database)?
                .connection_string(&definition.connection_string_name)
                .is_none()
            {
                return Err(ReplicationError::invalid_configuration(format!(
                    "connection string '{}' does not exist",
                    definition.connection_string_name
                )));
            }
            Ok(())
        };
        check().map_err(|e| self.rejected("define_external", database, e))?;

        let name = definition.name.clone();
        let index = self
            .commit(
                request_id,
                ClusterCommand::DefineExternalReplication {
                    database: database.to_string(),
                    definition,
                },
            )
            .await?;
        let committed = self.committed_task(database, index, |r| {
            r.external_replications
                .iter()
                .find(|e| e.name.eq_ignore_ascii_case(&name))
                .map(|e| e.task_id)
        })?;
        tracing::info!(
            event = Event::ExternalReplicationDefined.as_str(),
            database,
            task = %name,
            task_id = %committed.task_id,
            index,
            "external replication defined"
        );
        Ok(committed)
    }

    /// Create or replace a connection string.
    pub async fn put_connection_string(
        &self,
        database: &str,
        request_id: &str,
        connection_string: ReplicationConnectionString,
    ) -> ReplicationResult<u64> {
        let check = || -> ReplicationResult<()> {
            connection_string.validate()?;
            record(&self.consensus.snapshot(), database).map(|_| ())
        };
        check().map_err(|e| self.rejected("put_connection_string", database, e))?;

        let name = connection_string.name.clone();
        let index = self
            .commit(
                request_id,
                ClusterCommand::PutConnectionString {
                    database: database.to_string(),
                    connection_string,
                },
            )
            .await?;
        tracing::info!(
            event = Event::ConnectionStringDefined.as_str(),
            database,
            connection_string = %name,
            index,
            "connection string defined"
        );
        Ok(index)
    }

    // =========================================================================
    // TASK MANAGEMENT
    // =========================================================================

    fn require_task(&self, database: &str, task_id: TaskId) -> ReplicationResult<()> {
        let state = self.consensus.snapshot();
        record(&state, database)?
            .task(task_id)
            .map(|_| ())
            .ok_or_else(|| ReplicationError::not_found(format!("task {} does not exist", task_id)))
    }

    /// Enable or disable any task.
    pub async fn toggle_task(
        &self,
        database: &str,
        request_id: &str,
        task_id: TaskId,
        disabled: bool,
    ) -> ReplicationResult<u64> {
        self.require_task(database, task_id)
            .map_err(|e| self.rejected("toggle_task", database, e))?;
        let index = self
            .commit(
                request_id,
                ClusterCommand::ToggleTask {
                    database: database.to_string(),
                    task_id,
                    disabled,
                },
            )
            .await?;
        tracing::info!(
            event = Event::TaskToggled.as_str(),
            database,
            task_id = %task_id,
            disabled,
            index,
            "task toggled"
        );
        Ok(index)
    }

    /// Delete any task. Deleting a hub also deletes its grants.
    pub async fn delete_task(&self, database: &str, request_id: &str, task_id: TaskId) -> ReplicationResult<u64> {
        self.require_task(database, task_id)
            .map_err(|e| self.rejected("delete_task", database, e))?;
        let index = self
            .commit(
                request_id,
                ClusterCommand::DeleteTask {
                    database: database.to_string(),
                    task_id,
                },
            )
            .await?;
        tracing::info!(
            event = Event::TaskDeleted.as_str(),
            database,
            task_id = %task_id,
            index,
            "task deleted"
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterNode, ClusterTopology, DatabaseTopology, InMemoryConsensus};
    use crate::replication::{ReplicationErrorKind, ReplicationMode};
    use crate::security::generate_certificate;

    async fn registry(secured: bool) -> AccessRegistry {
        let consensus = Arc::new(InMemoryConsensus::new());
        consensus
            .propose(
                "setup-1",
                ClusterCommand::PutClusterTopology {
                    topology: ClusterTopology {
                        nodes: vec![ClusterNode {
                            tag: NodeTag::new("A"),
                            url: "mem://a".into(),
                            alive: true,
                        }],
                    },
                },
            )
            .await
            .unwrap();
        consensus
            .propose(
                "setup-2",
                ClusterCommand::PutDatabase {
                    database: "orders".into(),
                    topology: DatabaseTopology::new(vec![NodeTag::new("A")]),
                },
            )
            .await
            .unwrap();
        let security = if secured {
            let generated = generate_certificate("node-a", chrono::Duration::days(30)).unwrap();
            ServerSecurity::secured(parse_bundle(&generated.certificate).unwrap())
        } else {
            ServerSecurity::unsecured()
        };
        AccessRegistry::new(consensus, security, Duration::from_secs(1))
    }

    fn grant_request(name: &str) -> RegisterAccessRequest {
        let generated = generate_certificate(name, chrono::Duration::days(30)).unwrap();
        RegisterAccessRequest {
            name: name.into(),
            certificate: generated.public_key,
            allowed_hub_to_sink_paths: ["users/*".to_string()].into_iter().collect(),
            allowed_sink_to_hub_paths: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn test_define_hub_assigns_task_id() {
        let registry = registry(false).await;
        let committed = registry
            .define_hub("orders", "r1", HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK))
            .await
            .unwrap();
        assert_eq!(committed.task_id, TaskId(committed.raft_command_index));
        assert_eq!(committed.responsible_node, Some(NodeTag::new("A")));
    }

    #[tokio::test]
    async fn test_filtering_needs_secured_server() {
        let mut hub = HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK);
        hub.with_filtering = true;

        let unsecured = registry(false).await;
        let err = unsecured.define_hub("orders", "r1", hub.clone()).await.unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::InvalidConfiguration);
        assert!(err.message.contains("filtering"));

        let secured = registry(true).await;
        assert!(secured.define_hub("orders", "r1", hub).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_grant_rejected() {
        let registry = registry(true).await;
        let mut hub = HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK);
        hub.with_filtering = true;
        registry.define_hub("orders", "r1", hub).await.unwrap();

        let request = grant_request("sink-1");
        registry
            .register_access("orders", "h1", "r2", request.clone())
            .await
            .unwrap();
        let err = registry
            .register_access("orders", "h1", "r3", request)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::DuplicateGrant);
        assert_eq!(registry.list_access("orders", "h1", None, 0, 10).unwrap().total_results, 1);
    }

    #[tokio::test]
    async fn test_legacy_hub_refuses_grants() {
        let registry = registry(true).await;
        let mut hub = HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK);
        hub.legacy_certificates = vec!["old".into()];
        registry.define_hub("orders", "r1", hub).await.unwrap();

        let mut request = grant_request("sink-1");
        request.allowed_hub_to_sink_paths.clear();
        let err = registry
            .register_access("orders", "h1", "r2", request)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::InvalidConfiguration);
        assert!(err.message.contains("legacy"));
    }

    #[tokio::test]
    async fn test_turning_on_filtering_checks_existing_grants() {
        let registry = registry(true).await;
        let hub = registry
            .define_hub("orders", "r1", HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK))
            .await
            .unwrap();
        let mut request = grant_request("sink-1");
        request.allowed_hub_to_sink_paths.clear();
        registry.register_access("orders", "h1", "r2", request).await.unwrap();
        let applied = registry.snapshot().last_index;

        let mut filtered = HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK);
        filtered.task_id = hub.task_id;
        filtered.with_filtering = true;
        let err = registry.define_hub("orders", "r3", filtered).await.unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::InvalidConfiguration);
        assert_eq!(registry.snapshot().last_index, applied);
        let state = registry.snapshot();
        assert!(!state.database("orders").unwrap().hub("h1").unwrap().with_filtering);
    }

    #[tokio::test]
    async fn test_register_on_missing_hub_is_not_found() {
        let registry = registry(true).await;
        let err = registry
            .register_access("orders", "nope", "r1", grant_request("sink-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_access_filters_and_pages() {
        let registry = registry(true).await;
        let mut hub = HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK);
        hub.with_filtering = true;
        registry.define_hub("orders", "r1", hub).await.unwrap();
        for (i, name) in ["berlin", "boston", "paris"].iter().enumerate() {
            registry
                .register_access("orders", "h1", &format!("g{}", i), grant_request(name))
                .await
                .unwrap();
        }

        let all = registry.list_access("orders", "h1", None, 0, 2).unwrap();
        assert_eq!(all.total_results, 3);
        assert_eq!(all.results.len(), 2);

        let filtered = registry.list_access("orders", "H1", Some("BO"), 0, 10).unwrap();
        assert_eq!(filtered.total_results, 1);
        assert_eq!(filtered.results[0].grant_name, "boston");
    }

    #[tokio::test]
    async fn test_unregister_access() {
        let registry = registry(true).await;
        let mut hub = HubDefinition::new("h1", ReplicationMode::HUB_TO_SINK);
        hub.with_filtering = true;
        registry.define_hub("orders", "r1", hub).await.unwrap();
        let request = grant_request("sink-1");
        let thumbprint = parse_certificate(&request.certificate).unwrap().info.thumbprint;
        registry.register_access("orders", "h1", "r2", request).await.unwrap();

        registry
            .unregister_access("orders", "h1", &thumbprint.to_lowercase(), "r3")
            .await
            .unwrap();
        assert_eq!(registry.list_access("orders", "h1", None, 0, 10).unwrap().total_results, 0);

        let err = registry
            .unregister_access("orders", "h1", &thumbprint, "r4")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_sink_needs_connection_string() {
        let registry = registry(false).await;
        let sink = SinkDefinition {
            name: "s1".into(),
            connection_string_name: "missing".into(),
            hub_name: "h1".into(),
            certificate_with_private_key: None,
            mode: ReplicationMode::HUB_TO_SINK,
            url: None,
            task_id: TaskId::default(),
            disabled: false,
            mentor_node: None,
        };
        let err = registry.define_sink("orders", "r1", sink.clone()).await.unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::InvalidConfiguration);

        registry
            .put_connection_string(
                "orders",
                "r2",
                ReplicationConnectionString {
                    name: "missing".into(),
                    database: "hub-db".into(),
                    topology_discovery_urls: vec!["mem://hub".into()],
                },
            )
            .await
            .unwrap();
        let committed = registry.define_sink("orders", "r3", sink).await.unwrap();
        assert!(committed.task_id.is_assigned());
        assert_eq!(committed.responsible_node, Some(NodeTag::new("A")));
    }

    #[tokio::test]
    async fn test_toggle_and_delete_unknown_task() {
        let registry = registry(false).await;
        let err = registry.toggle_task("orders", "r1", TaskId(99), true).await.unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::NotFound);
        let err = registry.delete_task("orders", "r2", TaskId(99)).await.unwrap_err();
        assert_eq!(err.kind, ReplicationErrorKind::NotFound);
    }
}
