//! # Admin API Errors
//!
//! Every error leaving the administrative API becomes a JSON body
//! `{error, code, status, retriable}` with a matching HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::replication::{ReplicationError, ReplicationErrorKind};

/// Result type for admin handlers
pub type AdminResult<T> = Result<T, AdminError>;

/// Admin API errors
#[derive(Debug, Error)]
pub enum AdminError {
    /// Missing required query parameter
    #[error("Missing required parameter: {0}")]
    MissingParam(String),

    /// Body or query string did not parse
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Rejected or failed replication operation
    #[error("{0}")]
    Replication(#[from] ReplicationError),
}

impl AdminError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdminError::MissingParam(_) | AdminError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::Replication(err) => match err.kind {
                ReplicationErrorKind::InvalidConfiguration | ReplicationErrorKind::ProtocolMismatch => {
                    StatusCode::BAD_REQUEST
                }
                ReplicationErrorKind::Authorization => StatusCode::FORBIDDEN,
                ReplicationErrorKind::NotFound
                | ReplicationErrorKind::UnknownHub
                | ReplicationErrorKind::DatabaseMissing => StatusCode::NOT_FOUND,
                ReplicationErrorKind::DuplicateGrant => StatusCode::CONFLICT,
                ReplicationErrorKind::ConsensusCommit
                | ReplicationErrorKind::DatabaseIdle
                | ReplicationErrorKind::Transient
                | ReplicationErrorKind::TopologyExhausted
                | ReplicationErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                ReplicationErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            AdminError::MissingParam(_) => "AEROHUB_MISSING_PARAMETER",
            AdminError::InvalidRequest(_) => "AEROHUB_INVALID_REQUEST",
            AdminError::Replication(err) => err.kind.code(),
        }
    }

    /// Check whether the caller may retry with the same request id
    pub fn is_retriable(&self) -> bool {
        match self {
            AdminError::Replication(err) => err.is_retriable(),
            _ => false,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    pub status: u16,
    pub retriable: bool,
}

impl From<&AdminError> for ErrorResponse {
    fn from(err: &AdminError) -> Self {
        Self {
            error: match err {
                AdminError::Replication(inner) => inner.message.clone(),
                other => other.to_string(),
            },
            code: err.code(),
            status: err.status_code().as_u16(),
            retriable: err.is_retriable(),
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorResponse::from(&self));
        (status, body).into_response()
    }
}
