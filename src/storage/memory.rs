//! In-memory document store
//!
//! Holds the latest version of every item, indexed by etag for the change
//! stream. Used by tests and by nodes started without a storage engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;

use super::change_vector::ChangeVector;
use super::item::{ItemKind, ReplicationItem};
use super::DocumentStore;
use crate::replication::{ReplicationError, ReplicationResult};

type ItemKey = (ItemKind, String);

#[derive(Default)]
struct StoreInner {
    items: HashMap<ItemKey, ReplicationItem>,
    by_etag: BTreeMap<u64, ItemKey>,
    replicated_from: HashMap<String, u64>,
    change_vector: ChangeVector,
    last_etag: u64,
}

impl StoreInner {
    fn store(
        &mut self,
        database_id: &str,
        mut item: ReplicationItem,
        merge_from: Option<&ChangeVector>,
    ) -> ReplicationItem {
        let key = (item.kind, item.id.to_ascii_lowercase());
        self.last_etag += 1;
        let etag = self.last_etag;

        let mut cv = self
            .items
            .get(&key)
            .map(|previous| previous.change_vector.clone())
            .unwrap_or_default();
        match merge_from {
            Some(incoming) => cv.merge(incoming),
            None => cv.set(database_id, etag),
        }
        self.change_vector.merge(&cv);

        if let Some(previous) = self.items.get(&key) {
            self.by_etag.remove(&previous.etag);
        }
        item.etag = etag;
        item.change_vector = cv;
        self.by_etag.insert(etag, key.clone());
        self.items.insert(key, item.clone());
        item
    }
}

/// Document store kept entirely in memory.
pub struct InMemoryDocumentStore {
    database_id: String,
    inner: RwLock<StoreInner>,
    etag_tx: watch::Sender<u64>,
}

impl InMemoryDocumentStore {
    /// Create an empty store writing under `database_id`.
    pub fn new(database_id: impl Into<String>) -> Self {
        let (etag_tx, _) = watch::channel(0);
        Self {
            database_id: database_id.into(),
            inner: RwLock::new(StoreInner::default()),
            etag_tx,
        }
    }

    /// Write a document.
    pub fn put(&self, id: &str, collection: &str, body: Value) -> ReplicationResult<ReplicationItem> {
        self.put_at(id, collection, body, Utc::now())
    }

    /// Write a document with an explicit commit time.
    pub fn put_at(
        &self,
        id: &str,
        collection: &str,
        body: Value,
        last_modified: DateTime<Utc>,
    ) -> ReplicationResult<ReplicationItem> {
        self.local_write(ReplicationItem {
            id: id.to_string(),
            kind: ItemKind::Document,
            collection: Some(collection.to_string()),
            etag: 0,
            change_vector: ChangeVector::new(),
            last_modified,
            deleted: false,
            body: Some(body),
        })
    }

    /// Delete a document, leaving a tombstone for replication.
    pub fn delete(&self, id: &str) -> ReplicationResult<Option<ReplicationItem>> {
        let collection = match self.get(id)? {
            Some(doc) => doc.collection,
            None => return Ok(None),
        };
        self.local_write(ReplicationItem {
            id: id.to_string(),
            kind: ItemKind::Document,
            collection,
            etag: 0,
            change_vector: ChangeVector::new(),
            last_modified: Utc::now(),
            deleted: true,
            body: None,
        })
        .map(Some)
    }

    /// Read a live document.
    pub fn get(&self, id: &str) -> ReplicationResult<Option<ReplicationItem>> {
        let inner = self.read()?;
        Ok(inner
            .items
            .get(&(ItemKind::Document, id.to_ascii_lowercase()))
            .filter(|item| !item.deleted)
            .cloned())
    }

    /// Number of live documents.
    pub fn document_count(&self) -> ReplicationResult<usize> {
        let inner = self.read()?;
        Ok(inner
            .items
            .values()
            .filter(|item| item.kind == ItemKind::Document && !item.deleted)
            .count())
    }

    fn local_write(&self, item: ReplicationItem) -> ReplicationResult<ReplicationItem> {
        if item.id.trim().is_empty() {
            return Err(ReplicationError::storage("document id must not be empty"));
        }
        let written = {
            let mut inner = self.write()?;
            inner.store(&self.database_id, item, None)
        };
        self.etag_tx.send_replace(written.etag);
        Ok(written)
    }

    fn read(&self) -> ReplicationResult<std::sync::RwLockReadGuard<'_, StoreInner>> {
        self.inner
            .read()
            .map_err(|_| ReplicationError::storage("document store lock poisoned"))
    }

    fn write(&self) -> ReplicationResult<std::sync::RwLockWriteGuard<'_, StoreInner>> {
        self.inner
            .write()
            .map_err(|_| ReplicationError::storage("document store lock poisoned"))
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn database_id(&self) -> &str {
        &self.database_id
    }

    fn last_etag(&self) -> u64 {
        *self.etag_tx.borrow()
    }

    fn change_vector(&self) -> ReplicationResult<ChangeVector> {
        Ok(self.read()?.change_vector.clone())
    }

    fn changes_after(&self, etag: u64, max: usize) -> ReplicationResult<Vec<ReplicationItem>> {
        let inner = self.read()?;
        Ok(inner
            .by_etag
            .range(etag.saturating_add(1)..)
            .take(max)
            .filter_map(|(_, key)| inner.items.get(key).cloned())
            .collect())
    }

    fn apply_batch(
        &self,
        source_database_id: &str,
        items: &[ReplicationItem],
        source_etag: u64,
    ) -> ReplicationResult<ChangeVector> {
        if let Some(bad) = items.iter().find(|i| i.id.trim().is_empty()) {
            return Err(ReplicationError::storage(format!(
                "replicated item at etag {} has no id",
                bad.etag
            )));
        }

        let (cv, last_etag, changed) = {
            let mut inner = self.write()?;
            let before = inner.last_etag;
            for item in items {
                let key = (item.kind, item.id.to_ascii_lowercase());
                let already_seen = inner
                    .items
                    .get(&key)
                    .map(|local| local.change_vector.dominates(&item.change_vector))
                    .unwrap_or(false);
                if already_seen {
                    continue;
                }
                let incoming_cv = item.change_vector.clone();
                inner.store(&self.database_id, item.clone(), Some(&incoming_cv));
            }
            let entry = inner
                .replicated_from
                .entry(source_database_id.to_string())
                .or_insert(0);
            *entry = (*entry).max(source_etag);
            (inner.change_vector.clone(), inner.last_etag, inner.last_etag != before)
        };

        if changed {
            self.etag_tx.send_replace(last_etag);
        }
        Ok(cv)
    }

    fn last_replicated_etag(&self, source_database_id: &str) -> ReplicationResult<u64> {
        Ok(self
            .read()?
            .replicated_from
            .get(source_database_id)
            .copied()
            .unwrap_or(0))
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.etag_tx.subscribe()
    }
}
