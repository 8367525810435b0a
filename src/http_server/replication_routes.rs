//! Replication Admin Routes
//!
//! Endpoints for hubs, access grants, sinks, external replications and
//! connection strings, plus per-database replication status.
//!
//! Every mutation requires a `raft-request-id` query parameter. Retrying with
//! the same id returns the first outcome instead of applying twice.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::errors::{AdminError, AdminResult};
use crate::node::ServerNode;
use crate::replication::{
    AccessListing, ExternalReplicationDefinition, HubDefinition, RegisterAccessRequest,
    ReplicationConnectionString, ReplicationStatus, SinkDefinition, TaskCommitted, TaskId,
    DEFAULT_PAGE_SIZE,
};
use crate::security::{generate_certificate, GeneratedCertificate};

/// Validity of generated sink certificates
const CERTIFICATE_VALIDITY_DAYS: i64 = 365;

// ==================
// Request/Response Types
// ==================

/// Query parameters shared by the admin endpoints
#[derive(Debug, Default, Deserialize)]
pub struct AdminQuery {
    #[serde(rename = "raft-request-id")]
    pub raft_request_id: Option<String>,
    /// Hub name for the access endpoints
    pub name: Option<String>,
    pub thumbprint: Option<String>,
    pub filter: Option<String>,
    pub start: Option<usize>,
    #[serde(rename = "pageSize")]
    pub page_size: Option<usize>,
    /// Task id for toggle and delete
    pub key: Option<u64>,
    pub disable: Option<bool>,
    /// Subject of a generated certificate
    pub subject: Option<String>,
}

impl AdminQuery {
    fn request_id(&self) -> AdminResult<&str> {
        self.raft_request_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AdminError::MissingParam("raft-request-id".to_string()))
    }

    fn hub_name(&self) -> AdminResult<&str> {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| AdminError::MissingParam("name".to_string()))
    }

    fn task_id(&self) -> AdminResult<TaskId> {
        self.key
            .map(TaskId)
            .ok_or_else(|| AdminError::MissingParam("key".to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IndexResponse {
    pub raft_command_index: u64,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> AdminResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| AdminError::InvalidRequest(rejection.body_text()))
}

fn query(params: Result<Query<AdminQuery>, QueryRejection>) -> AdminResult<AdminQuery> {
    params
        .map(|Query(q)| q)
        .map_err(|rejection| AdminError::InvalidRequest(rejection.body_text()))
}

// ==================
// Replication Routes
// ==================

/// Create replication admin routes
pub fn replication_routes(node: Arc<ServerNode>) -> Router {
    Router::new()
        // Hubs and grants
        .route("/databases/:db/tasks/pull-replication/hub", put(define_hub_handler))
        .route(
            "/databases/:db/tasks/pull-replication/hub/access",
            put(register_access_handler)
                .delete(unregister_access_handler)
                .get(list_access_handler),
        )
        // Dialing tasks
        .route(
            "/databases/:db/admin/tasks/sink-pull-replication",
            post(define_sink_handler),
        )
        .route(
            "/databases/:db/admin/tasks/external-replication",
            post(define_external_handler),
        )
        .route(
            "/databases/:db/admin/connection-strings",
            put(put_connection_string_handler),
        )
        // Task management
        .route("/databases/:db/admin/tasks/state", post(toggle_task_handler))
        .route("/databases/:db/admin/tasks", delete(delete_task_handler))
        // Status
        .route("/databases/:db/tasks/replication/status", get(status_handler))
        .route(
            "/admin/pull-replication/generate-certificate",
            post(generate_certificate_handler),
        )
        .with_state(node)
}

// ==================
// Handlers
// ==================

async fn define_hub_handler(
    State(node): State<Arc<ServerNode>>,
    Path(db): Path<String>,
    params: Result<Query<AdminQuery>, QueryRejection>,
    payload: Result<Json<HubDefinition>, JsonRejection>,
) -> AdminResult<Json<TaskCommitted>> {
    let params = query(params)?;
    let definition = body(payload)?;
    let committed = node
        .registry()
        .define_hub(&db, params.request_id()?, definition)
        .await?;
    Ok(Json(committed))
}

async fn register_access_handler(
    State(node): State<Arc<ServerNode>>,
    Path(db): Path<String>,
    params: Result<Query<AdminQuery>, QueryRejection>,
    payload: Result<Json<RegisterAccessRequest>, JsonRejection>,
) -> AdminResult<Json<IndexResponse>> {
    let params = query(params)?;
    let request = body(payload)?;
    let index = node
        .registry()
        .register_access(&db, params.hub_name()?, params.request_id()?, request)
        .await?;
    Ok(Json(IndexResponse {
        raft_command_index: index,
    }))
}

async fn unregister_access_handler(
    State(node): State<Arc<ServerNode>>,
    Path(db): Path<String>,
    params: Result<Query<AdminQuery>, QueryRejection>,
) -> AdminResult<Json<IndexResponse>> {
    let params = query(params)?;
    let thumbprint = params
        .thumbprint
        .as_deref()
        .ok_or_else(|| AdminError::MissingParam("thumbprint".to_string()))?;
    let index = node
        .registry()
        .unregister_access(&db, params.hub_name()?, thumbprint, params.request_id()?)
        .await?;
    Ok(Json(IndexResponse {
        raft_command_index: index,
    }))
}

async fn list_access_handler(
    State(node): State<Arc<ServerNode>>,
    Path(db): Path<String>,
    params: Result<Query<AdminQuery>, QueryRejection>,
) -> AdminResult<Json<AccessListing>> {
    let params = query(params)?;
    let listing = node.registry().list_access(
        &db,
        params.hub_name()?,
        params.filter.as_deref(),
        params.start.unwrap_or(0),
        params.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
    )?;
    Ok(Json(listing))
}

async fn define_sink_handler(
    State(node): State<Arc<ServerNode>>,
    Path(db): Path<String>,
    params: Result<Query<AdminQuery>, QueryRejection>,
    payload: Result<Json<SinkDefinition>, JsonRejection>,
) -> AdminResult<(StatusCode, Json<TaskCommitted>)> {
    let params = query(params)?;
    let definition = body(payload)?;
    let committed = node
        .registry()
        .define_sink(&db, params.request_id()?, definition)
        .await?;
    Ok((StatusCode::CREATED, Json(committed)))
}

async fn define_external_handler(
    State(node): State<Arc<ServerNode>>,
    Path(db): Path<String>,
    params: Result<Query<AdminQuery>, QueryRejection>,
    payload: Result<Json<ExternalReplicationDefinition>, JsonRejection>,
) -> AdminResult<(StatusCode, Json<TaskCommitted>)> {
    let params = query(params)?;
    let definition = body(payload)?;
    let committed = node
        .registry()
        .define_external(&db, params.request_id()?, definition)
        .await?;
    Ok((StatusCode::CREATED, Json(committed)))
}

async fn put_connection_string_handler(
    State(node): State<Arc<ServerNode>>,
    Path(db): Path<String>,
    params: Result<Query<AdminQuery>, QueryRejection>,
    payload: Result<Json<ReplicationConnectionString>, JsonRejection>,
) -> AdminResult<Json<IndexResponse>> {
    let params = query(params)?;
    let connection_string = body(payload)?;
    let index = node
        .registry()
        .put_connection_string(&db, params.request_id()?, connection_string)
        .await?;
    Ok(Json(IndexResponse {
        raft_command_index: index,
    }))
}

async fn toggle_task_handler(
    State(node): State<Arc<ServerNode>>,
    Path(db): Path<String>,
    params: Result<Query<AdminQuery>, QueryRejection>,
) -> AdminResult<Json<IndexResponse>> {
    let params = query(params)?;
    let disable = params
        .disable
        .ok_or_else(|| AdminError::MissingParam("disable".to_string()))?;
    let index = node
        .registry()
        .toggle_task(&db, params.request_id()?, params.task_id()?, disable)
        .await?;
    Ok(Json(IndexResponse {
        raft_command_index: index,
    }))
}

async fn delete_task_handler(
    State(node): State<Arc<ServerNode>>,
    Path(db): Path<String>,
    params: Result<Query<AdminQuery>, QueryRejection>,
) -> AdminResult<Json<IndexResponse>> {
    let params = query(params)?;
    let index = node
        .registry()
        .delete_task(&db, params.request_id()?, params.task_id()?)
        .await?;
    Ok(Json(IndexResponse {
        raft_command_index: index,
    }))
}

async fn status_handler(
    State(node): State<Arc<ServerNode>>,
    Path(db): Path<String>,
) -> AdminResult<Json<ReplicationStatus>> {
    Ok(Json(node.status(&db).await?))
}

async fn generate_certificate_handler(
    params: Result<Query<AdminQuery>, QueryRejection>,
) -> AdminResult<Json<GeneratedCertificate>> {
    let params = query(params)?;
    let subject = params.subject.as_deref().unwrap_or("pull-replication-sink");
    let generated = generate_certificate(subject, chrono::Duration::days(CERTIFICATE_VALIDITY_DAYS))?;
    Ok(Json(generated))
}
