//! Replication Orchestrator
//!
//! One per loaded database. Owns every connection of that database:
//! - outgoing workers, keyed by task id, at most one per task
//! - incoming connections admitted by the acceptor
//!
//! `reconcile` is the single writer. It compares the committed definitions
//! with what is running, stops what is stale and starts what is missing.
//! Running it twice against the same state changes nothing.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::config::ReplicationSettings;
use super::definitions::{
    OngoingTask, OngoingTaskType, ReplicationConnectionString, ReplicationMode, TaskId,
};
use super::failure::{FailureSnapshot, FailureTracker};
use super::idle::IdleCoordinator;
use super::outgoing::OutgoingWorker;
use super::state::{ConnectionRuntimeState, SharedRuntimeState};
use super::topology::TopologyResolver;
use super::transport::Connector;
use crate::cluster::{ClusterState, ConsensusLog, DatabaseRecord, NodeTag};
use crate::observability::{Event, ReplicationMetrics};
use crate::security::{thumbprints_equal, ServerSecurity};
use crate::storage::DocumentStore;

/// Node-wide collaborators shared by every orchestrator.
pub struct ReplicationContext {
    pub node_tag: NodeTag,
    pub security: ServerSecurity,
    pub settings: ReplicationSettings,
    pub connector: Arc<dyn Connector>,
    pub idle: IdleCoordinator,
    pub metrics: Arc<ReplicationMetrics>,
}

struct OutgoingHandle {
    task: OngoingTask,
    connection_string: ReplicationConnectionString,
    runtime: SharedRuntimeState,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl OutgoingHandle {
    async fn stop(self) {
        self.cancel.cancel();
        // Worker exits after flushing its in-flight batch
        let _ = self.join.await;
    }
}

/// Hub and grant settings an incoming connection was admitted under.
///
/// A connection stays open only while the committed configuration still
/// matches them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingTerms {
    /// `None` for external replication
    pub hub_name: Option<String>,
    /// `None` on an unsecured server
    pub thumbprint: Option<String>,
    pub hub_mode: ReplicationMode,
    pub with_filtering: bool,
    pub hub_to_sink_paths: BTreeSet<String>,
    pub sink_to_hub_paths: BTreeSet<String>,
}

impl IncomingTerms {
    /// Why `record` no longer admits a connection made under these terms.
    fn revocation_reason(&self, record: &DatabaseRecord) -> Option<&'static str> {
        let hub_name = self.hub_name.as_deref()?;
        let Some(hub) = record.hub(hub_name) else {
            return Some("hub deleted");
        };
        if hub.disabled {
            return Some("hub disabled");
        }
        if hub.mode != self.hub_mode || hub.with_filtering != self.with_filtering {
            return Some("hub definition changed");
        }
        let thumbprint = self.thumbprint.as_deref()?;
        match record.grant(hub_name, thumbprint) {
            None => Some("access revoked"),
            Some(grant)
                if grant.allowed_hub_to_sink_paths != self.hub_to_sink_paths
                    || grant.allowed_sink_to_hub_paths != self.sink_to_hub_paths =>
            {
                Some("access changed")
            }
            Some(_) => None,
        }
    }
}

struct IncomingConnection {
    terms: IncomingTerms,
    source: String,
    runtime: SharedRuntimeState,
    cancel: CancellationToken,
}

type IncomingMap = Arc<Mutex<HashMap<Uuid, IncomingConnection>>>;

fn lock_incoming(map: &IncomingMap) -> MutexGuard<'_, HashMap<Uuid, IncomingConnection>> {
    map.lock().unwrap_or_else(|p| p.into_inner())
}

/// Keeps an incoming connection registered until dropped.
pub struct IncomingRegistration {
    id: Uuid,
    cancel: CancellationToken,
    incoming: IncomingMap,
}

impl IncomingRegistration {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancelled when the hub, its grant, or the database goes away.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for IncomingRegistration {
    fn drop(&mut self) {
        lock_incoming(&self.incoming).remove(&self.id);
    }
}

/// Runtime status of one outgoing task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutgoingTaskStatus {
    pub task_id: TaskId,
    pub task_name: String,
    pub task_type: OngoingTaskType,
    pub runtime: ConnectionRuntimeState,
}

/// Runtime status of one incoming connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IncomingConnectionStatus {
    pub id: Uuid,
    pub hub_name: Option<String>,
    pub source: String,
    pub runtime: ConnectionRuntimeState,
}

/// Progress report of a database.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicationStatus {
    pub database: String,
    pub outgoing: Vec<OutgoingTaskStatus>,
    pub incoming: Vec<IncomingConnectionStatus>,
    pub failures: FailureSnapshot,
}

/// Connection owner for one database.
pub struct ReplicationOrchestrator {
    database: String,
    store: Arc<dyn DocumentStore>,
    context: Arc<ReplicationContext>,
    failures: Arc<FailureTracker>,
    outgoing: tokio::sync::Mutex<HashMap<TaskId, OutgoingHandle>>,
    incoming: IncomingMap,
    cancel: CancellationToken,
}

impl ReplicationOrchestrator {
    pub fn new(
        database: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        context: Arc<ReplicationContext>,
    ) -> Self {
        let failures = Arc::new(FailureTracker::new(context.settings.failure_history));
        Self {
            database: database.into(),
            store,
            context,
            failures,
            outgoing: tokio::sync::Mutex::new(HashMap::new()),
            incoming: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn context(&self) -> &Arc<ReplicationContext> {
        &self.context
    }

    pub fn failures(&self) -> &Arc<FailureTracker> {
        &self.failures
    }

    /// Check whether the database was disposed.
    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Dialing tasks this node should run for the database.
    fn desired_tasks(
        &self,
        state: &ClusterState,
        record: &DatabaseRecord,
    ) -> HashMap<TaskId, (OngoingTask, ReplicationConnectionString)> {
        let mut desired = HashMap::new();
        for task in record.ongoing_tasks() {
            if !task.is_dialer() || task.disabled() {
                continue;
            }
            let responsible = TopologyResolver::responsible_node(&task, &record.topology, &state.topology);
            if responsible.as_ref() != Some(&self.context.node_tag) {
                continue;
            }
            let connection_string = task
                .connection_string_name()
                .and_then(|name| record.connection_string(name));
            match connection_string {
                Some(cs) => {
                    desired.insert(task.task_id(), (task.clone(), cs.clone()));
                }
                None => tracing::warn!(
                    database = %self.database,
                    task_id = %task.task_id(),
                    "task references a missing connection string"
                ),
            }
        }
        desired
    }

    /// Bring running connections in line with `state`.
    pub async fn reconcile(&self, state: &ClusterState) {
        if self.is_disposed() {
            return;
        }
        let Some(record) = state.database(&self.database) else {
            self.dispose().await;
            return;
        };
        let mut desired = self.desired_tasks(state, record);

        let mut outgoing = self.outgoing.lock().await;
        let stale: Vec<TaskId> = outgoing
            .iter()
            .filter(|(id, handle)| match desired.get(id) {
                Some((task, cs)) => *task != handle.task || *cs != handle.connection_string,
                None => true,
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            if let Some(handle) = outgoing.remove(&id) {
                tracing::info!(
                    event = Event::TaskStopped.as_str(),
                    database = %self.database,
                    task_id = %id,
                    task = %handle.task.name(),
                    "stopping outgoing task"
                );
                handle.stop().await;
            }
        }

        desired.retain(|id, _| !outgoing.contains_key(id));
        for (id, (task, connection_string)) in desired {
            let handle = self.start(task, connection_string);
            outgoing.insert(id, handle);
        }
        drop(outgoing);

        self.revoke_incoming(record);
    }

    fn start(&self, task: OngoingTask, connection_string: ReplicationConnectionString) -> OutgoingHandle {
        let runtime = SharedRuntimeState::new();
        let cancel = self.cancel.child_token();
        tracing::info!(
            event = Event::TaskStarted.as_str(),
            database = %self.database,
            task_id = %task.task_id(),
            task = %task.name(),
            connection_string = %connection_string.name,
            "starting outgoing task"
        );
        let worker = OutgoingWorker {
            database: self.database.clone(),
            task: task.clone(),
            connection_string: connection_string.clone(),
            store: Arc::clone(&self.store),
            context: Arc::clone(&self.context),
            failures: Arc::clone(&self.failures),
            runtime: runtime.clone(),
        };
        let join = tokio::spawn(worker.run(cancel.clone()));
        OutgoingHandle {
            task,
            connection_string,
            runtime,
            cancel,
            join,
        }
    }

    fn revoke(&self, id: &Uuid, conn: &IncomingConnection, reason: &str) {
        tracing::info!(
            event = Event::IncomingRevoked.as_str(),
            database = %self.database,
            connection = %id,
            hub = conn.terms.hub_name.as_deref().unwrap_or(""),
            source = %conn.source,
            reason,
            "closing incoming connection"
        );
        conn.cancel.cancel();
    }

    /// Close incoming connections whose hub or grant no longer admits them.
    fn revoke_incoming(&self, record: &DatabaseRecord) {
        let incoming = lock_incoming(&self.incoming);
        for (id, conn) in incoming.iter() {
            if let Some(reason) = conn.terms.revocation_reason(record) {
                self.revoke(id, conn, reason);
            }
        }
    }

    /// Track an admitted incoming connection.
    ///
    /// The connection is checked against the latest committed state once it
    /// is tracked. A change applied between authorization and registration
    /// would otherwise reach `reconcile` before the connection was visible.
    pub fn register_incoming(
        &self,
        terms: IncomingTerms,
        source: String,
        runtime: SharedRuntimeState,
        consensus: &dyn ConsensusLog,
    ) -> IncomingRegistration {
        let id = Uuid::new_v4();
        let cancel = self.cancel.child_token();
        let mut incoming = lock_incoming(&self.incoming);
        incoming.insert(
            id,
            IncomingConnection {
                terms,
                source,
                runtime,
                cancel: cancel.clone(),
            },
        );
        drop(incoming);

        let state = consensus.snapshot();
        let incoming = lock_incoming(&self.incoming);
        if let Some(conn) = incoming.get(&id) {
            let reason = match state.database(&self.database) {
                None => Some("database deleted"),
                Some(record) => conn.terms.revocation_reason(record),
            };
            if let Some(reason) = reason {
                self.revoke(&id, conn, reason);
            }
        }
        drop(incoming);

        IncomingRegistration {
            id,
            cancel,
            incoming: Arc::clone(&self.incoming),
        }
    }

    /// Number of incoming connections admitted under `hub`.
    pub fn incoming_for_hub(&self, hub: &str) -> usize {
        lock_incoming(&self.incoming)
            .values()
            .filter(|c| c.terms.hub_name.as_deref().map(|h| h.eq_ignore_ascii_case(hub)).unwrap_or(false))
            .count()
    }

    /// Check whether a grant currently has a connection open.
    pub fn has_incoming_for(&self, hub: &str, thumbprint: &str) -> bool {
        lock_incoming(&self.incoming).values().any(|c| {
            c.terms.hub_name.as_deref().map(|h| h.eq_ignore_ascii_case(hub)).unwrap_or(false)
                && c.terms
                    .thumbprint
                    .as_deref()
                    .map(|t| thumbprints_equal(t, thumbprint))
                    .unwrap_or(false)
        })
    }

    /// Task ids with a running outgoing worker.
    pub async fn running_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.outgoing.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Progress of every connection of the database.
    pub async fn status(&self) -> ReplicationStatus {
        let mut outgoing: Vec<OutgoingTaskStatus> = self
            .outgoing
            .lock()
            .await
            .iter()
            .map(|(id, handle)| OutgoingTaskStatus {
                task_id: *id,
                task_name: handle.task.name().to_string(),
                task_type: handle.task.task_type(),
                runtime: handle.runtime.snapshot(),
            })
            .collect();
        outgoing.sort_by_key(|s| s.task_id);

        let mut incoming: Vec<IncomingConnectionStatus> = lock_incoming(&self.incoming)
            .iter()
            .map(|(id, conn)| IncomingConnectionStatus {
                id: *id,
                hub_name: conn.terms.hub_name.clone(),
                source: conn.source.clone(),
                runtime: conn.runtime.snapshot(),
            })
            .collect();
        incoming.sort_by(|a, b| a.source.cmp(&b.source).then(a.id.cmp(&b.id)));

        ReplicationStatus {
            database: self.database.clone(),
            outgoing,
            incoming,
            failures: self.failures.snapshot(),
        }
    }

    /// Stop every connection. The orchestrator is unusable afterwards.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let handles: Vec<(TaskId, OutgoingHandle)> = self.outgoing.lock().await.drain().collect();
        for (id, handle) in handles {
            tracing::info!(
                event = Event::TaskStopped.as_str(),
                database = %self.database,
                task_id = %id,
                "stopping outgoing task"
            );
            handle.stop().await;
        }
    }
}
