//! Databases Landlord
//!
//! Owns the databases loaded on this node. A database is loaded when a request
//! targets it (admin status, an inbound replication dial) or when it has
//! dialing tasks this node is responsible for. Loading creates its
//! `ReplicationOrchestrator` and reconciles it against the latest state.
//!
//! Storage outlives loading: unloading drops the orchestrator, never the
//! documents, so a reload resumes from the stored replication cursors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;

use crate::cluster::{ClusterState, ConsensusLog, DatabaseRecord, NodeTag};
use crate::observability::Event;
use crate::replication::{
    DatabaseResolver, ReplicationContext, ReplicationError, ReplicationOrchestrator,
    ReplicationResult, TopologyResolver,
};
use crate::storage::{DocumentStore, InMemoryDocumentStore};

struct LoadedDatabase {
    orchestrator: Arc<ReplicationOrchestrator>,
    last_used: Instant,
}

/// Load/unload authority for the databases of one node.
pub struct DatabasesLandlord {
    context: Arc<ReplicationContext>,
    consensus: Arc<dyn ConsensusLog>,
    stores: Mutex<HashMap<String, Arc<InMemoryDocumentStore>>>,
    loaded: tokio::sync::Mutex<HashMap<String, LoadedDatabase>>,
}

/// Check whether `node` runs at least one dialing task of `record`.
fn runs_dialers(state: &ClusterState, record: &DatabaseRecord, node: &NodeTag) -> bool {
    record.ongoing_tasks().iter().any(|task| {
        task.is_dialer()
            && !task.disabled()
            && TopologyResolver::responsible_node(task, &record.topology, &state.topology).as_ref() == Some(node)
    })
}

impl DatabasesLandlord {
    pub fn new(context: Arc<ReplicationContext>, consensus: Arc<dyn ConsensusLog>) -> Self {
        Self {
            context,
            consensus,
            stores: Mutex::new(HashMap::new()),
            loaded: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Storage of `database`, created empty on first use.
    pub fn store(&self, database: &str) -> ReplicationResult<Arc<InMemoryDocumentStore>> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| ReplicationError::storage("store catalog lock poisoned"))?;
        let store = stores.entry(database.to_string()).or_insert_with(|| {
            Arc::new(InMemoryDocumentStore::new(format!(
                "{}@{}",
                database, self.context.node_tag
            )))
        });
        Ok(Arc::clone(store))
    }

    /// Orchestrator of `database`, loading it if needed.
    pub async fn get_or_load(&self, database: &str) -> ReplicationResult<Arc<ReplicationOrchestrator>> {
        let state = self.consensus.snapshot();
        if state.database(database).is_none() {
            return Err(ReplicationError::database_missing(database));
        }
        if !state.hosts(&self.context.node_tag, database) {
            return Err(ReplicationError::topology_exhausted(format!(
                "database '{}' is not hosted on node {}",
                database, self.context.node_tag
            )));
        }

        let mut loaded = self.loaded.lock().await;
        if let Some(entry) = loaded.get_mut(database) {
            if !entry.orchestrator.is_disposed() {
                entry.last_used = Instant::now();
                return Ok(Arc::clone(&entry.orchestrator));
            }
        }

        let store: Arc<dyn DocumentStore> = self.store(database)?;
        let orchestrator = Arc::new(ReplicationOrchestrator::new(
            database,
            store,
            Arc::clone(&self.context),
        ));
        orchestrator.reconcile(&state).await;
        loaded.insert(
            database.to_string(),
            LoadedDatabase {
                orchestrator: Arc::clone(&orchestrator),
                last_used: Instant::now(),
            },
        );
        self.context.metrics.increment_databases_loaded();
        tracing::info!(
            event = Event::DatabaseLoaded.as_str(),
            database,
            node = %self.context.node_tag,
            "database loaded"
        );
        Ok(orchestrator)
    }

    /// Orchestrator of `database` if it is loaded.
    pub async fn loaded(&self, database: &str) -> Option<Arc<ReplicationOrchestrator>> {
        self.loaded
            .lock()
            .await
            .get(database)
            .map(|entry| Arc::clone(&entry.orchestrator))
    }

    pub async fn is_loaded(&self, database: &str) -> bool {
        self.loaded(database).await.is_some()
    }

    pub async fn loaded_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Unload `database` unless a replication connection keeps it active.
    /// Returns whether it was unloaded.
    pub async fn unload(&self, database: &str) -> bool {
        let mut loaded = self.loaded.lock().await;
        if !loaded.contains_key(database) {
            return false;
        }
        if !self.context.idle.can_unload(database) {
            tracing::debug!(
                event = Event::UnloadVetoed.as_str(),
                database,
                active = self.context.idle.active_connection_count(database),
                "unload vetoed by active replication connections"
            );
            return false;
        }
        match loaded.remove(database) {
            Some(entry) => {
                drop(loaded);
                self.release(database, entry).await;
                true
            }
            None => false,
        }
    }

    /// Unload every database unused since `idle_unload_after` before `now`.
    /// Returns the unloaded names.
    pub async fn unload_idle(&self, now: Instant) -> Vec<String> {
        let idle_after = self.context.settings.idle_unload_after();
        let candidates: Vec<String> = {
            let loaded = self.loaded.lock().await;
            loaded
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.last_used) >= idle_after)
                .map(|(name, _)| name.clone())
                .collect()
        };

        let mut unloaded = Vec::new();
        for database in candidates {
            if self.unload(&database).await {
                unloaded.push(database);
            }
        }
        unloaded
    }

    /// Bring loaded databases in line with `state` and load the ones that
    /// have dialing tasks to run here.
    pub async fn sync(&self, state: &ClusterState) {
        let loaded: Vec<(String, Arc<ReplicationOrchestrator>)> = self
            .loaded
            .lock()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.orchestrator)))
            .collect();

        for (name, orchestrator) in &loaded {
            let hosted = state.hosts(&self.context.node_tag, name);
            if hosted {
                orchestrator.reconcile(state).await;
            }
            if !hosted || orchestrator.is_disposed() {
                let entry = self.loaded.lock().await.remove(name);
                if let Some(entry) = entry {
                    self.release(name, entry).await;
                }
            }
        }

        for (name, record) in &state.databases {
            if !record.topology.contains(&self.context.node_tag)
                || !runs_dialers(state, record, &self.context.node_tag)
            {
                continue;
            }
            if let Err(err) = self.get_or_load(name).await {
                tracing::warn!(
                    database = %name,
                    code = err.kind.code(),
                    error = %err.message,
                    "failed to load database with replication tasks"
                );
            }
        }
    }

    /// Dispose every loaded database.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, LoadedDatabase)> = self.loaded.lock().await.drain().collect();
        for (name, entry) in entries {
            self.release(&name, entry).await;
        }
    }

    async fn release(&self, database: &str, entry: LoadedDatabase) {
        entry.orchestrator.dispose().await;
        self.context.metrics.increment_databases_unloaded();
        tracing::info!(
            event = Event::DatabaseUnloaded.as_str(),
            database,
            node = %self.context.node_tag,
            "database unloaded"
        );
    }
}

#[async_trait]
impl DatabaseResolver for DatabasesLandlord {
    async fn load(&self, database: &str) -> ReplicationResult<Arc<ReplicationOrchestrator>> {
        self.get_or_load(database).await
    }
}
