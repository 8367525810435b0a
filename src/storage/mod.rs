//! Document Storage seam
//!
//! Replication treats storage as an opaque source and sink of change-stream
//! batches keyed by etag and change vector.
//!
//! # Contract
//!
//! - `changes_after` returns items in etag order, latest version per item only
//! - `apply_batch` is all-or-nothing; once it returns the batch is durable
//! - `last_replicated_etag` is only advanced by `apply_batch`, together with the items

mod change_vector;
mod item;
mod memory;

pub use change_vector::{ChangeVector, ChangeVectorOrder};
pub use item::{ItemKind, ReplicationItem};
pub use memory::InMemoryDocumentStore;

use tokio::sync::watch;

use crate::replication::ReplicationResult;

/// Storage engine of one database, as seen by replication.
pub trait DocumentStore: Send + Sync {
    /// Id this database writes change-vector entries under.
    fn database_id(&self) -> &str;

    /// Etag of the latest local write.
    fn last_etag(&self) -> u64;

    /// Database-wide change vector.
    fn change_vector(&self) -> ReplicationResult<ChangeVector>;

    /// Up to `max` items with an etag greater than `etag`.
    fn changes_after(&self, etag: u64, max: usize) -> ReplicationResult<Vec<ReplicationItem>>;

    /// Atomically apply a replicated batch and record `source_etag` as the
    /// last etag accepted from `source_database_id`. Returns the resulting
    /// database change vector.
    fn apply_batch(
        &self,
        source_database_id: &str,
        items: &[ReplicationItem],
        source_etag: u64,
    ) -> ReplicationResult<ChangeVector>;

    /// Last etag accepted from a source database (0 if none).
    fn last_replicated_etag(&self, source_database_id: &str) -> ReplicationResult<u64>;

    /// Notified with the new last etag after every write.
    fn subscribe(&self) -> watch::Receiver<u64>;
}
