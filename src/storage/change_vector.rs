//! Change Vectors
//!
//! A change vector maps each database id that ever wrote a document to the
//! highest etag seen from it. Rendered as `dbid:etag` pairs joined by commas,
//! sorted by database id.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::replication::ReplicationError;

/// Ordering of two change vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeVectorOrder {
    Equal,
    /// Left side has seen everything the right side has, and more
    Newer,
    /// Right side has seen everything the left side has, and more
    Older,
    /// Each side has changes the other has not seen
    Conflict,
}

/// Comparable replication progress marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ChangeVector {
    entries: BTreeMap<String, u64>,
}

impl ChangeVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vector with a single entry.
    pub fn single(database_id: &str, etag: u64) -> Self {
        let mut cv = Self::new();
        cv.set(database_id, etag);
        cv
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Etag recorded for a database id (0 if absent).
    pub fn get(&self, database_id: &str) -> u64 {
        self.entries.get(database_id).copied().unwrap_or(0)
    }

    /// Raise the entry for a database id. Entries never move backwards.
    pub fn set(&mut self, database_id: &str, etag: u64) {
        let entry = self.entries.entry(database_id.to_string()).or_insert(0);
        *entry = (*entry).max(etag);
    }

    /// Pointwise maximum of both vectors.
    pub fn merge(&mut self, other: &ChangeVector) {
        for (id, etag) in &other.entries {
            self.set(id, *etag);
        }
    }

    /// Merged copy.
    pub fn merged(&self, other: &ChangeVector) -> ChangeVector {
        let mut cv = self.clone();
        cv.merge(other);
        cv
    }

    /// Compare two vectors.
    pub fn compare(&self, other: &ChangeVector) -> ChangeVectorOrder {
        let mut ahead = false;
        let mut behind = false;
        for id in self.entries.keys().chain(other.entries.keys()) {
            match self.get(id).cmp(&other.get(id)) {
                Ordering::Greater => ahead = true,
                Ordering::Less => behind = true,
                Ordering::Equal => {}
            }
        }
        match (ahead, behind) {
            (false, false) => ChangeVectorOrder::Equal,
            (true, false) => ChangeVectorOrder::Newer,
            (false, true) => ChangeVectorOrder::Older,
            (true, true) => ChangeVectorOrder::Conflict,
        }
    }

    /// Check whether this vector has seen everything `other` has.
    pub fn dominates(&self, other: &ChangeVector) -> bool {
        matches!(
            self.compare(other),
            ChangeVectorOrder::Equal | ChangeVectorOrder::Newer
        )
    }
}

impl fmt::Display for ChangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (id, etag) in &self.entries {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", id, etag)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for ChangeVector {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cv = ChangeVector::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (id, etag) = part.rsplit_once(':').ok_or_else(|| {
                ReplicationError::protocol_mismatch(format!("malformed change vector entry '{}'", part))
            })?;
            let etag = etag.parse::<u64>().map_err(|_| {
                ReplicationError::protocol_mismatch(format!("malformed etag in '{}'", part))
            })?;
            if id.is_empty() {
                return Err(ReplicationError::protocol_mismatch(format!(
                    "missing database id in '{}'",
                    part
                )));
            }
            cv.set(id, etag);
        }
        Ok(cv)
    }
}

impl Serialize for ChangeVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChangeVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let mut cv = ChangeVector::single("b", 3);
        cv.set("a", 7);
        assert_eq!(cv.to_string(), "a:7,b:3");
        assert_eq!("a:7, b:3".parse::<ChangeVector>().unwrap(), cv);
        assert!("a-7".parse::<ChangeVector>().is_err());
        assert!("".parse::<ChangeVector>().unwrap().is_empty());
    }

    #[test]
    fn test_set_never_moves_backwards() {
        let mut cv = ChangeVector::single("a", 7);
        cv.set("a", 2);
        assert_eq!(cv.get("a"), 7);
    }

    #[test]
    fn test_compare() {
        let a = ChangeVector::single("a", 5);
        let mut b = a.clone();
        b.set("b", 1);
        assert_eq!(b.compare(&a), ChangeVectorOrder::Newer);
        assert_eq!(a.compare(&b), ChangeVectorOrder::Older);
        assert!(b.dominates(&a));

        let c = ChangeVector::single("a", 6);
        assert_eq!(b.compare(&c), ChangeVectorOrder::Conflict);
        assert_eq!(b.merged(&c).to_string(), "a:6,b:1");
    }

    #[test]
    fn test_serde_as_string() {
        let cv = ChangeVector::single("a", 1);
        assert_eq!(serde_json::to_string(&cv).unwrap(), "\"a:1\"");
        let back: ChangeVector = serde_json::from_str("\"a:1\"").unwrap();
        assert_eq!(back, cv);
    }
}
