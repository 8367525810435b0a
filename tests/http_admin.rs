//! Admin API Tests
//!
//! Drives the router in-process with `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use aerohub::http_server::HttpServer;
use aerohub::node::ServerNode;
use aerohub::replication::MemoryNetwork;
use aerohub::security::generate_certificate;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::*;

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn admin() -> (TestCluster, Router) {
    let network = MemoryNetwork::new();
    let cluster = TestCluster::start(&network, &["A"], &[HUB_DB]).await;
    let router = HttpServer::new(Arc::clone(cluster.first())).router();
    (cluster, router)
}

fn node_of(cluster: &TestCluster) -> &Arc<ServerNode> {
    cluster.first()
}

// =============================================================================
// Health and metrics
// =============================================================================

#[tokio::test]
async fn test_health_and_metrics() {
    let (cluster, router) = admin().await;

    let (status, body) = send(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node"], "A");

    let (status, body) = send(&router, "GET", "/observability/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["handshakes_accepted"].is_u64());

    cluster.shutdown().await;
}

// =============================================================================
// Hubs and grants
// =============================================================================

#[tokio::test]
async fn test_mutation_requires_request_id() {
    let (cluster, router) = admin().await;

    let (status, body) = send(
        &router,
        "PUT",
        &format!("/databases/{}/tasks/pull-replication/hub", HUB_DB),
        Some(json!({"Name": "h1", "Mode": "HUB_TO_SINK"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "AEROHUB_MISSING_PARAMETER");
    assert_eq!(body["retriable"], false);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_define_hub_returns_task_id() {
    let (cluster, router) = admin().await;

    let (status, body) = send(
        &router,
        "PUT",
        &format!("/databases/{}/tasks/pull-replication/hub?raft-request-id=r1", HUB_DB),
        Some(json!({"Name": "h1", "Mode": "HUB_TO_SINK"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["TaskId"], body["RaftCommandIndex"]);
    assert_eq!(body["ResponsibleNode"], "A");
    assert!(node_of(&cluster).registry().snapshot().database(HUB_DB).unwrap().hub("h1").is_some());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_filtering_hub_rejected_on_unsecured_server() {
    let (cluster, router) = admin().await;

    let (status, body) = send(
        &router,
        "PUT",
        &format!("/databases/{}/tasks/pull-replication/hub?raft-request-id=r1", HUB_DB),
        Some(json!({"Name": "h1", "Mode": "HUB_TO_SINK", "WithFiltering": true})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "AEROHUB_INVALID_CONFIGURATION");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_access_on_missing_hub_is_not_found() {
    let (cluster, router) = admin().await;
    let generated = generate_certificate("sink-eu", chrono::Duration::days(30)).unwrap();

    let (status, _) = send(
        &router,
        "PUT",
        &format!(
            "/databases/{}/tasks/pull-replication/hub/access?name=nope&raft-request-id=r1",
            HUB_DB
        ),
        Some(json!({
            "Name": "sink-eu",
            "Certificate": generated.public_key,
            "AllowedHubToSinkPaths": [],
            "AllowedSinkToHubPaths": []
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &router,
        "GET",
        &format!("/databases/{}/tasks/pull-replication/hub/access?name=nope", HUB_DB),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_register_and_list_access() {
    let (cluster, router) = admin().await;
    send(
        &router,
        "PUT",
        &format!("/databases/{}/tasks/pull-replication/hub?raft-request-id=r1", HUB_DB),
        Some(json!({"Name": "h1", "Mode": "HUB_TO_SINK"})),
    )
    .await;

    let generated = generate_certificate("sink-eu", chrono::Duration::days(30)).unwrap();
    let grant = json!({
        "Name": "sink-eu",
        "Certificate": generated.public_key,
        "AllowedHubToSinkPaths": ["users/*"],
        "AllowedSinkToHubPaths": []
    });
    let uri = format!(
        "/databases/{}/tasks/pull-replication/hub/access?name=h1&raft-request-id=r2",
        HUB_DB
    );
    let (status, body) = send(&router, "PUT", &uri, Some(grant.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["RaftCommandIndex"].as_u64().unwrap() > 0);

    // A new request id with the same certificate conflicts
    let uri = format!(
        "/databases/{}/tasks/pull-replication/hub/access?name=h1&raft-request-id=r3",
        HUB_DB
    );
    let (status, body) = send(&router, "PUT", &uri, Some(grant)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "AEROHUB_DUPLICATE_GRANT");

    let (status, body) = send(
        &router,
        "GET",
        &format!(
            "/databases/{}/tasks/pull-replication/hub/access?name=h1&filter=EU",
            HUB_DB
        ),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["TotalResults"], 1);
    assert_eq!(body["Results"][0]["CertificateThumbprint"], generated.thumbprint.as_str());

    cluster.shutdown().await;
}

// =============================================================================
// Sinks, task state and status
// =============================================================================

#[tokio::test]
async fn test_sink_lifecycle_over_http() {
    let (cluster, router) = admin().await;

    let (status, _) = send(
        &router,
        "PUT",
        &format!("/databases/{}/admin/connection-strings?raft-request-id=r1", HUB_DB),
        Some(json!({
            "Name": "to-remote",
            "Database": "remote",
            "TopologyDiscoveryUrls": ["mem://nowhere"]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &router,
        "POST",
        &format!("/databases/{}/admin/tasks/sink-pull-replication?raft-request-id=r2", HUB_DB),
        Some(json!({
            "Name": "s1",
            "ConnectionStringName": "to-remote",
            "HubName": "h1",
            "Mode": "HUB_TO_SINK"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let task_id = body["TaskId"].as_u64().unwrap();

    let node = Arc::clone(node_of(&cluster));
    let running = eventually_async(Duration::from_secs(2), || {
        let node = Arc::clone(&node);
        async move { node.status(HUB_DB).await.unwrap().outgoing.len() == 1 }
    })
    .await;
    assert!(running);

    let (status, body) = send(
        &router,
        "GET",
        &format!("/databases/{}/tasks/replication/status", HUB_DB),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Database"], HUB_DB);
    assert_eq!(body["Outgoing"][0]["TaskId"], task_id);

    let (status, _) = send(
        &router,
        "POST",
        &format!(
            "/databases/{}/admin/tasks/state?key={}&disable=true&raft-request-id=r3",
            HUB_DB, task_id
        ),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &router,
        "DELETE",
        &format!("/databases/{}/admin/tasks?key={}&raft-request-id=r4", HUB_DB, task_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &router,
        "DELETE",
        &format!("/databases/{}/admin/tasks?key={}&raft-request-id=r5", HUB_DB, task_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "AEROHUB_NOT_FOUND");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_status_of_unknown_database() {
    let (cluster, router) = admin().await;

    let (status, body) = send(&router, "GET", "/databases/unknown/tasks/replication/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "AEROHUB_DATABASE_MISSING");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_generate_certificate() {
    let (cluster, router) = admin().await;

    let (status, body) = send(
        &router,
        "POST",
        "/admin/pull-replication/generate-certificate?subject=sink-eu",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["Thumbprint"].as_str().is_some_and(|t| !t.is_empty()));
    assert!(body["PublicKey"].as_str().is_some());
    assert!(body["Certificate"].as_str().is_some());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_malformed_body_is_invalid_request() {
    let (cluster, router) = admin().await;

    let (status, body) = send(
        &router,
        "PUT",
        &format!("/databases/{}/tasks/pull-replication/hub?raft-request-id=r1", HUB_DB),
        Some(json!({"Mode": "sideways"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "AEROHUB_INVALID_REQUEST");

    cluster.shutdown().await;
}
