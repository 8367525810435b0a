//! Idle Coordinator
//!
//! Counts streaming connections per database. The idle-unload policy asks
//! `can_unload` before unloading; a non-zero count vetoes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Counts {
    active: Mutex<HashMap<String, usize>>,
}

impl Counts {
    fn adjust(&self, database: &str, increment: bool) {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        let key = database.to_ascii_lowercase();
        if increment {
            *active.entry(key).or_insert(0) += 1;
        } else if let Some(count) = active.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(&key);
            }
        }
    }

    fn get(&self, database: &str) -> usize {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.get(&database.to_ascii_lowercase()).copied().unwrap_or(0)
    }
}

/// Node-wide active connection accounting.
#[derive(Debug, Clone, Default)]
pub struct IdleCoordinator {
    counts: Arc<Counts>,
}

impl IdleCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a connection against `database` until the guard is dropped.
    pub fn register(&self, database: &str) -> ActiveConnectionGuard {
        self.counts.adjust(database, true);
        ActiveConnectionGuard {
            counts: Arc::clone(&self.counts),
            database: database.to_string(),
        }
    }

    /// Connections currently streaming for `database`.
    pub fn active_connection_count(&self, database: &str) -> usize {
        self.counts.get(database)
    }

    /// Check whether the idle policy may unload `database`.
    pub fn can_unload(&self, database: &str) -> bool {
        self.active_connection_count(database) == 0
    }
}

/// Keeps a database counted as active.
#[derive(Debug)]
pub struct ActiveConnectionGuard {
    counts: Arc<Counts>,
    database: String,
}

impl ActiveConnectionGuard {
    pub fn database(&self) -> &str {
        &self.database
    }
}

impl Drop for ActiveConnectionGuard {
    fn drop(&mut self) {
        self.counts.adjust(&self.database, false);
    }
}
