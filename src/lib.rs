//! aerohub - replication coordination for a multi-tenant document database
//!
//! Hub/sink pull replication and external replication between databases of
//! a cluster whose configuration is committed through consensus.

pub mod cli;
pub mod cluster;
pub mod http_server;
pub mod node;
pub mod observability;
pub mod replication;
pub mod security;
pub mod storage;
