//! Shared harness for multi-node integration tests.
//!
//! Every cluster gets its own in-memory consensus log; all nodes share one
//! `MemoryNetwork`, so a hub cluster and a sink cluster can talk to each other
//! inside one process.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use aerohub::cluster::{
    ClusterCommand, ClusterNode, ClusterTopology, ConsensusLog, DatabaseTopology, InMemoryConsensus, NodeTag,
};
use aerohub::node::ServerNode;
use aerohub::replication::{
    HubDefinition, MemoryNetwork, ReplicationConnectionString, ReplicationMode, ReplicationSettings,
    SinkDefinition, TaskCommitted, TaskId,
};
use aerohub::security::{generate_certificate, parse_bundle, ServerSecurity};
use aerohub::storage::InMemoryDocumentStore;

pub const HUB_DB: &str = "catalog";
pub const SINK_DB: &str = "catalog-replica";

/// One cluster: a consensus log and its nodes.
pub struct TestCluster {
    pub consensus: Arc<InMemoryConsensus>,
    pub nodes: Vec<Arc<ServerNode>>,
}

impl TestCluster {
    /// Start `tags` as one unsecured cluster on `network`, each listening at `mem://<tag>`.
    pub async fn start(network: &Arc<MemoryNetwork>, tags: &[&str], databases: &[&str]) -> Self {
        Self::start_with_security(network, tags, databases, ServerSecurity::unsecured()).await
    }

    /// Start a cluster whose nodes share `security`.
    pub async fn start_with_security(
        network: &Arc<MemoryNetwork>,
        tags: &[&str],
        databases: &[&str],
        security: ServerSecurity,
    ) -> Self {
        Self::start_with(network, tags, databases, security, ReplicationSettings::fast()).await
    }

    pub async fn start_with(
        network: &Arc<MemoryNetwork>,
        tags: &[&str],
        databases: &[&str],
        security: ServerSecurity,
        settings: ReplicationSettings,
    ) -> Self {
        let cluster = Self::start_unbound(network, tags, databases, security, settings).await;
        for node in &cluster.nodes {
            node.serve_replication(network.bind(&url(node.tag().as_str())));
        }
        cluster
    }

    /// Start the nodes without accepting replication connections; the caller
    /// binds `mem://<tag>` itself.
    pub async fn start_unbound(
        network: &Arc<MemoryNetwork>,
        tags: &[&str],
        databases: &[&str],
        security: ServerSecurity,
        settings: ReplicationSettings,
    ) -> Self {
        let consensus = Arc::new(InMemoryConsensus::new());
        let topology = ClusterTopology {
            nodes: tags
                .iter()
                .map(|tag| ClusterNode {
                    tag: NodeTag::new(*tag),
                    url: url(tag),
                    alive: true,
                })
                .collect(),
        };
        consensus
            .propose("setup-topology", ClusterCommand::PutClusterTopology { topology })
            .await
            .unwrap();
        for database in databases {
            consensus
                .propose(
                    &format!("setup-{}", database),
                    ClusterCommand::PutDatabase {
                        database: database.to_string(),
                        topology: DatabaseTopology::new(tags.iter().map(|t| NodeTag::new(*t)).collect()),
                    },
                )
                .await
                .unwrap();
        }

        let mut nodes = Vec::new();
        for tag in tags {
            let node = Arc::new(ServerNode::new(
                NodeTag::new(*tag),
                security.clone(),
                settings.clone(),
                network.clone(),
                consensus.clone(),
            ));
            node.start();
            nodes.push(node);
        }
        Self { consensus, nodes }
    }

    pub fn node(&self, tag: &str) -> &Arc<ServerNode> {
        self.nodes
            .iter()
            .find(|n| n.tag().as_str() == tag)
            .expect("unknown node tag")
    }

    pub fn first(&self) -> &Arc<ServerNode> {
        &self.nodes[0]
    }

    pub fn store(&self, tag: &str, database: &str) -> Arc<InMemoryDocumentStore> {
        self.node(tag).landlord().store(database).unwrap()
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

pub fn url(tag: &str) -> String {
    format!("mem://{}", tag.to_lowercase())
}

/// Define hub `name` on the hub cluster.
pub async fn define_hub(cluster: &TestCluster, name: &str) -> TaskCommitted {
    cluster
        .first()
        .registry()
        .define_hub(HUB_DB, &format!("hub-{}", name), HubDefinition::new(name, ReplicationMode::HUB_TO_SINK))
        .await
        .unwrap()
}

/// Point the sink cluster at `urls` and define sink `name` against `hub`.
pub async fn define_sink(cluster: &TestCluster, name: &str, hub: &str, urls: &[String]) -> TaskCommitted {
    define_sink_with_certificate(cluster, name, hub, urls, None).await
}

/// `define_sink` presenting `certificate` (a bundle with private key) to the hub.
pub async fn define_sink_with_certificate(
    cluster: &TestCluster,
    name: &str,
    hub: &str,
    urls: &[String],
    certificate: Option<String>,
) -> TaskCommitted {
    define_sink_with(cluster, name, hub, urls, certificate, ReplicationMode::HUB_TO_SINK).await
}

/// Define a sink replicating in `mode`.
pub async fn define_sink_with(
    cluster: &TestCluster,
    name: &str,
    hub: &str,
    urls: &[String],
    certificate: Option<String>,
    mode: ReplicationMode,
) -> TaskCommitted {
    let registry = cluster.first().registry();
    registry
        .put_connection_string(
            SINK_DB,
            &format!("cs-{}", name),
            ReplicationConnectionString {
                name: format!("to-{}", hub),
                database: HUB_DB.to_string(),
                topology_discovery_urls: urls.to_vec(),
            },
        )
        .await
        .unwrap();
    registry
        .define_sink(
            SINK_DB,
            &format!("sink-{}", name),
            SinkDefinition {
                name: name.to_string(),
                connection_string_name: format!("to-{}", hub),
                hub_name: hub.to_string(),
                certificate_with_private_key: certificate,
                mode,
                url: None,
                task_id: TaskId::default(),
                disabled: false,
                mentor_node: None,
            },
        )
        .await
        .unwrap()
}

/// Poll `check` every 20ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// `eventually` for checks that need to await.
pub async fn eventually_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Server security backed by a fresh node certificate.
pub fn secured(subject: &str) -> ServerSecurity {
    let generated = generate_certificate(subject, chrono::Duration::days(30)).unwrap();
    ServerSecurity::secured(parse_bundle(&generated.certificate).unwrap())
}

pub fn has_document(store: &InMemoryDocumentStore, id: &str) -> bool {
    store.get(id).unwrap().is_some()
}
