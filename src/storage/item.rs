//! Replication Items
//!
//! The unit the change stream is made of.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::change_vector::ChangeVector;

/// Kind of replicated payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemKind {
    Document,
    Revision,
    Attachment,
    Counter,
    TimeSeries,
}

/// One entry of a change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicationItem {
    pub id: String,
    pub kind: ItemKind,
    #[serde(default)]
    pub collection: Option<String>,
    /// Etag on the database the item is read from
    pub etag: u64,
    pub change_vector: ChangeVector,
    /// Source-side commit time
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub body: Option<Value>,
}

impl ReplicationItem {
    /// Check whether the item is old enough to ship under a replication delay.
    pub fn is_older_than(&self, now: DateTime<Utc>, delay: std::time::Duration) -> bool {
        match chrono::Duration::from_std(delay) {
            Ok(delay) => self.last_modified <= now - delay,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_boundary() {
        let now = Utc::now();
        let item = ReplicationItem {
            id: "users/1".into(),
            kind: ItemKind::Document,
            collection: Some("Users".into()),
            etag: 1,
            change_vector: ChangeVector::single("a", 1),
            last_modified: now - chrono::Duration::seconds(10),
            deleted: false,
            body: None,
        };
        assert!(item.is_older_than(now, std::time::Duration::from_secs(5)));
        assert!(!item.is_older_than(now, std::time::Duration::from_secs(30)));
        assert!(item.is_older_than(now, std::time::Duration::ZERO));
    }
}
