//! Server Node
//!
//! Composition root of one cluster member. Wires together:
//! - the consensus log the node reads configuration from
//! - the `DatabasesLandlord` that loads databases and their orchestrators
//! - the `AccessRegistry` behind the administrative API
//! - the replication listener accept loop
//!
//! Background loops:
//! - apply listener: every applied cluster change reconciles loaded databases
//! - idle sweep: unloads databases nobody used for `idle_unload_after_ms`

mod config;
mod landlord;

pub use config::NodeConfig;
pub use landlord::DatabasesLandlord;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterCommand, ConsensusLog, DatabaseTopology, InMemoryConsensus, NodeTag};
use crate::observability::{Event, ReplicationMetrics};
use crate::replication::{
    AccessRegistry, Connector, IdleCoordinator, IncomingHandler, ReplicationContext,
    ReplicationErrorKind, ReplicationListener, ReplicationResult, ReplicationSettings,
    ReplicationStatus,
};
use crate::security::ServerSecurity;

/// How long admin requests wait for their command to apply.
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(10);

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// One running cluster member.
pub struct ServerNode {
    context: Arc<ReplicationContext>,
    consensus: Arc<dyn ConsensusLog>,
    landlord: Arc<DatabasesLandlord>,
    registry: Arc<AccessRegistry>,
    incoming: Arc<IncomingHandler>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerNode {
    pub fn new(
        node_tag: NodeTag,
        security: ServerSecurity,
        settings: ReplicationSettings,
        connector: Arc<dyn Connector>,
        consensus: Arc<dyn ConsensusLog>,
    ) -> Self {
        let context = Arc::new(ReplicationContext {
            node_tag,
            security: security.clone(),
            settings,
            connector,
            idle: IdleCoordinator::new(),
            metrics: Arc::new(ReplicationMetrics::new()),
        });
        let landlord = Arc::new(DatabasesLandlord::new(Arc::clone(&context), Arc::clone(&consensus)));
        let registry = Arc::new(AccessRegistry::new(Arc::clone(&consensus), security, COMMIT_TIMEOUT));
        let incoming = Arc::new(IncomingHandler::new(
            Arc::clone(&context),
            Arc::clone(&consensus),
            landlord.clone(),
        ));
        Self {
            context,
            consensus,
            landlord,
            registry,
            incoming,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build a standalone node from configuration: its own consensus log,
    /// seeded with the configured topology and databases.
    pub async fn from_config(config: &NodeConfig, connector: Arc<dyn Connector>) -> ReplicationResult<Self> {
        config.validate()?;
        let security = ServerSecurity::from_config(&config.security)?;
        let consensus: Arc<dyn ConsensusLog> = Arc::new(InMemoryConsensus::new());

        consensus
            .propose(
                "bootstrap-topology",
                ClusterCommand::PutClusterTopology {
                    topology: config.topology(),
                },
            )
            .await?;
        for database in &config.databases {
            consensus
                .propose(
                    &format!("bootstrap-database-{}", database),
                    ClusterCommand::PutDatabase {
                        database: database.clone(),
                        topology: DatabaseTopology::new(vec![config.tag()]),
                    },
                )
                .await?;
        }

        Ok(Self::new(
            config.tag(),
            security,
            config.replication.clone(),
            connector,
            consensus,
        ))
    }

    pub fn tag(&self) -> &NodeTag {
        &self.context.node_tag
    }

    pub fn context(&self) -> &Arc<ReplicationContext> {
        &self.context
    }

    pub fn consensus(&self) -> &Arc<dyn ConsensusLog> {
        &self.consensus
    }

    pub fn landlord(&self) -> &Arc<DatabasesLandlord> {
        &self.landlord
    }

    pub fn registry(&self) -> &Arc<AccessRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ReplicationMetrics> {
        &self.context.metrics
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
    }

    /// Start the apply listener and the idle sweep.
    pub fn start(&self) {
        let mut changes = self.consensus.subscribe();
        let consensus = Arc::clone(&self.consensus);
        let landlord = Arc::clone(&self.landlord);
        let cancel = self.cancel.clone();
        self.track(tokio::spawn(async move {
            landlord.sync(&consensus.snapshot()).await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Ok(_) | Err(RecvError::Lagged(_)) => {
                            // One sync covers every change queued so far
                            while changes.try_recv().is_ok() {}
                            landlord.sync(&consensus.snapshot()).await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }));

        let landlord = Arc::clone(&self.landlord);
        let cancel = self.cancel.clone();
        let every = (self.context.settings.idle_unload_after() / 4).max(MIN_SWEEP_INTERVAL);
        self.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        landlord.unload_idle(Instant::now()).await;
                    }
                }
            }
        }));

        tracing::info!(
            event = Event::BootComplete.as_str(),
            node = %self.context.node_tag,
            secured = self.context.security.is_secured(),
            "node started"
        );
    }

    /// Accept replication connections from `listener` until shutdown.
    pub fn serve_replication<L>(&self, mut listener: L)
    where
        L: ReplicationListener + 'static,
    {
        let incoming = Arc::clone(&self.incoming);
        let cancel = self.cancel.clone();
        let node = self.context.node_tag.clone();
        tracing::info!(
            event = Event::ReplicationListening.as_str(),
            node = %node,
            "accepting replication connections"
        );
        self.track(tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let incoming = Arc::clone(&incoming);
                        tokio::spawn(async move { incoming.handle(stream, peer).await });
                    }
                    Err(err) if err.kind == ReplicationErrorKind::Cancelled => break,
                    Err(err) => {
                        tracing::warn!(node = %node, error = %err.message, "accept failed");
                        tokio::time::sleep(MIN_SWEEP_INTERVAL).await;
                    }
                }
            }
        }));
    }

    /// Replication status of `database`, loading it if needed.
    pub async fn status(&self, database: &str) -> ReplicationResult<ReplicationStatus> {
        let orchestrator = self.landlord.get_or_load(database).await?;
        Ok(orchestrator.status().await)
    }

    /// Stop background loops and dispose every database.
    pub async fn shutdown(&self) {
        tracing::info!(
            event = Event::ShutdownStart.as_str(),
            node = %self.context.node_tag,
            "node stopping"
        );
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        self.landlord.shutdown().await;
        tracing::info!(
            event = Event::ShutdownComplete.as_str(),
            node = %self.context.node_tag,
            "node stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::MemoryNetwork;

    #[tokio::test]
    async fn test_from_config_seeds_cluster() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"node_tag": "A", "public_url": "mem://a", "databases": ["orders"]}"#)
                .unwrap();
        let node = ServerNode::from_config(&config, MemoryNetwork::new()).await.unwrap();

        let state = node.consensus().snapshot();
        assert!(state.hosts(&NodeTag::new("A"), "orders"));
        assert_eq!(state.topology.nodes.len(), 1);

        let status = node.status("orders").await.unwrap();
        assert!(status.outgoing.is_empty());
        assert!(node.landlord().is_loaded("orders").await);
    }

    #[tokio::test]
    async fn test_shutdown_unloads_databases() {
        let config: NodeConfig = serde_json::from_str(r#"{"databases": ["orders"]}"#).unwrap();
        let node = ServerNode::from_config(&config, MemoryNetwork::new()).await.unwrap();
        node.start();
        node.status("orders").await.unwrap();

        node.shutdown().await;
        assert!(node.landlord().loaded_databases().await.is_empty());
    }
}
