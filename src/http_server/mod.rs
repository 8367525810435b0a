//! # aerohub HTTP Server Module
//!
//! Administrative API of a node, built on axum.
//!
//! # Endpoints
//!
//! - `/health` - Health check
//! - `/databases/:db/tasks/pull-replication/hub[/access]` - Hubs and grants
//! - `/databases/:db/admin/...` - Sinks, external replications, connection strings, tasks
//! - `/databases/:db/tasks/replication/status` - Runtime status
//! - `/admin/pull-replication/generate-certificate` - Sink certificates
//! - `/observability/*` - Metrics and monitoring

pub mod config;
pub mod errors;
pub mod observability_routes;
pub mod replication_routes;
pub mod server;

pub use config::HttpServerConfig;
pub use errors::{AdminError, AdminResult, ErrorResponse};
pub use server::HttpServer;
