//! Idle Coordination Tests
//!
//! A database with live replication connections stays loaded; once the last
//! connection ends it can be unloaded, and the next handshake loads it again.
//! A database that is slow or failing to load refuses handshakes as idle, and
//! the sink keeps retrying instead of parking.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aerohub::node::DatabasesLandlord;
use aerohub::replication::{
    ConnectionStatus, DatabaseResolver, IncomingHandler, MemoryNetwork, ReplicationError,
    ReplicationErrorKind, ReplicationListener, ReplicationOrchestrator, ReplicationResult,
    ReplicationSettings,
};
use async_trait::async_trait;
use aerohub::security::ServerSecurity;
use serde_json::json;

use common::*;

const REPLICATION_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_streaming_vetoes_unload() {
    let network = MemoryNetwork::new();
    let hub = TestCluster::start(&network, &["A"], &[HUB_DB]).await;
    let sink = TestCluster::start(&network, &["S"], &[SINK_DB]).await;

    define_hub(&hub, "h1").await;
    let sink_task = define_sink(&sink, "s1", "h1", &[url("A")]).await;

    let hub_node = hub.node("A");
    assert!(
        eventually(REPLICATION_TIMEOUT, || {
            hub_node.context().idle.active_connection_count(HUB_DB) > 0
        })
        .await,
        "sink never connected"
    );
    assert!(!hub_node.context().idle.can_unload(HUB_DB));
    assert!(!hub_node.landlord().unload(HUB_DB).await);
    assert!(hub_node.landlord().is_loaded(HUB_DB).await);

    sink.first()
        .registry()
        .toggle_task(SINK_DB, "disable-s1", sink_task.task_id, true)
        .await
        .unwrap();
    assert!(
        eventually(REPLICATION_TIMEOUT, || {
            hub_node.context().idle.active_connection_count(HUB_DB) == 0
        })
        .await,
        "connection outlived the disabled sink"
    );
    assert!(hub_node.landlord().unload(HUB_DB).await);
    assert!(!hub_node.landlord().is_loaded(HUB_DB).await);

    sink.shutdown().await;
    hub.shutdown().await;
}

/// The idle sweep leaves a streaming hub alone, unloads it once the sink is
/// gone and a returning sink loads it again.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idle_sweep_and_reload_on_handshake() {
    let network = MemoryNetwork::new();
    let settings = ReplicationSettings {
        idle_unload_after_ms: 200,
        ..ReplicationSettings::fast()
    };
    let hub = TestCluster::start_with(&network, &["A"], &[HUB_DB], ServerSecurity::unsecured(), settings).await;
    let sink = TestCluster::start(&network, &["S"], &[SINK_DB]).await;

    define_hub(&hub, "h1").await;
    let sink_task = define_sink(&sink, "s1", "h1", &[url("A")]).await;

    let hub_store = hub.store("A", HUB_DB);
    let sink_store = sink.store("S", SINK_DB);
    hub_store.put("notes/1", "Notes", json!({"text": "one"})).unwrap();
    assert!(eventually(REPLICATION_TIMEOUT, || has_document(&sink_store, "notes/1")).await);

    // Several sweeps pass while the sink is streaming
    tokio::time::sleep(Duration::from_millis(800)).await;
    let hub_node = hub.node("A");
    assert!(hub_node.landlord().is_loaded(HUB_DB).await);

    let registry = sink.first().registry();
    registry
        .toggle_task(SINK_DB, "disable-s1", sink_task.task_id, true)
        .await
        .unwrap();
    assert!(
        eventually_async(REPLICATION_TIMEOUT, || async move {
            !hub_node.landlord().is_loaded(HUB_DB).await
        })
        .await,
        "idle hub database was never unloaded"
    );
    assert!(hub_node.metrics().snapshot().databases_unloaded >= 1);

    // Documents live in the store, not the loaded database
    hub_store.put("notes/2", "Notes", json!({"text": "two"})).unwrap();
    registry
        .toggle_task(SINK_DB, "enable-s1", sink_task.task_id, false)
        .await
        .unwrap();
    assert!(eventually(REPLICATION_TIMEOUT, || has_document(&sink_store, "notes/2")).await);
    assert!(hub_node.landlord().is_loaded(HUB_DB).await);

    sink.shutdown().await;
    hub.shutdown().await;
}

/// Stalls past the load timeout on the first load, fails the next two, then
/// loads through the landlord.
struct FlakyResolver {
    landlord: Arc<DatabasesLandlord>,
    calls: AtomicU32,
}

#[async_trait]
impl DatabaseResolver for FlakyResolver {
    async fn load(&self, database: &str) -> ReplicationResult<Arc<ReplicationOrchestrator>> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                self.landlord.get_or_load(database).await
            }
            1 | 2 => Err(ReplicationError::storage("database files are still opening")),
            _ => self.landlord.get_or_load(database).await,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_database_load_is_retried_not_parked() {
    let network = MemoryNetwork::new();
    let hub = TestCluster::start_unbound(
        &network,
        &["A"],
        &[HUB_DB],
        ServerSecurity::unsecured(),
        ReplicationSettings::fast(),
    )
    .await;
    let hub_node = hub.node("A");
    let resolver = Arc::new(FlakyResolver {
        landlord: Arc::clone(hub_node.landlord()),
        calls: AtomicU32::new(0),
    });
    let handler = Arc::new(IncomingHandler::new(
        Arc::clone(hub_node.context()),
        Arc::clone(hub_node.consensus()),
        resolver.clone(),
    ));
    let mut listener = network.bind(&url("A"));
    let accept_loop = tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler.handle(stream, peer).await });
        }
    });

    define_hub(&hub, "h1").await;
    hub.store("A", HUB_DB)
        .put("notes/1", "Notes", json!({"text": "one"}))
        .unwrap();

    let sink = TestCluster::start(&network, &["S"], &[SINK_DB]).await;
    define_sink(&sink, "s1", "h1", &[url("A")]).await;

    let sink_node = sink.node("S");
    let sink_store = sink.store("S", SINK_DB);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !has_document(&sink_store, "notes/1") {
        let status = sink_node.status(SINK_DB).await.unwrap();
        assert!(
            status
                .outgoing
                .iter()
                .all(|t| t.runtime.status != ConnectionStatus::Error),
            "sink parked while the hub database was loading"
        );
        assert!(
            tokio::time::Instant::now() < deadline,
            "document never arrived once the hub database loaded"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(resolver.calls.load(Ordering::SeqCst) >= 4);
    assert!(hub_node.metrics().snapshot().handshakes_rejected >= 3);

    let status = sink_node.status(SINK_DB).await.unwrap();
    let failures = status
        .failures
        .outgoing
        .iter()
        .find(|f| f.destination == url("A"))
        .expect("no failures recorded against the hub");
    assert!(failures
        .errors
        .iter()
        .any(|e| e.code == ReplicationErrorKind::DatabaseIdle.code()));
    assert!(eventually_async(REPLICATION_TIMEOUT, || async move {
        let status = sink_node.status(SINK_DB).await.unwrap();
        status.outgoing[0].runtime.status == ConnectionStatus::Streaming
    })
    .await);

    accept_loop.abort();
    sink.shutdown().await;
    hub.shutdown().await;
}
