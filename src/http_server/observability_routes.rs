//! Observability HTTP Routes
//!
//! Health check and replication metrics.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::node::ServerNode;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node: String,
}

/// Create observability routes
pub fn observability_routes(node: Arc<ServerNode>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(node)
}

/// Health check route (also available at root /health)
pub fn health_routes(node: Arc<ServerNode>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(node)
}

async fn health_handler(State(node): State<Arc<ServerNode>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node: node.tag().to_string(),
    };

    (StatusCode::OK, Json(response))
}

/// Metrics handler - counters since boot
async fn metrics_handler(State(node): State<Arc<ServerNode>>) -> impl IntoResponse {
    (StatusCode::OK, Json(node.metrics().snapshot()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            node: "A".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("ok"));
        assert!(json.contains("\"node\":\"A\""));
    }
}
