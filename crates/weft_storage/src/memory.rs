//! In-memory checkpoint store.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use weft_core::{CheckpointKey, CheckpointStore, CoreResult, Value};

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Entries held
    pub entries: usize,
    /// Lookups served
    pub reads: u64,
    /// Lookups that found an entry
    pub hits: u64,
    /// Entries written, overwrites included
    pub writes: u64,
}

/// Checkpoints held in a map; lost when the process exits
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<CheckpointKey, Value>>,
    stats: RwLock<StoreStats>,
}

impl MemoryCheckpointStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `entries`
    #[must_use]
    pub fn with_entries(entries: HashMap<CheckpointKey, Value>) -> Self {
        let stats = StoreStats {
            entries: entries.len(),
            ..StoreStats::default()
        };
        Self {
            entries: RwLock::new(entries),
            stats: RwLock::new(stats),
        }
    }

    /// Whether `key` has an entry
    #[must_use]
    pub fn contains(&self, key: &CheckpointKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Remove one entry
    pub fn remove(&self, key: &CheckpointKey) -> bool {
        let mut entries = self.entries.write();
        let removed = entries.remove(key).is_some();
        self.stats.write().entries = entries.len();
        removed
    }

    /// Drop every entry and reset statistics
    pub fn clear(&self) {
        self.entries.write().clear();
        *self.stats.write() = StoreStats::default();
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.stats.read().clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn lookup(&self, key: &CheckpointKey) -> CoreResult<Option<Value>> {
        let found = self.entries.read().get(key).cloned();
        let mut stats = self.stats.write();
        stats.reads += 1;
        if found.is_some() {
            stats.hits += 1;
        }
        Ok(found)
    }

    fn store(&self, key: &CheckpointKey, value: &Value) -> CoreResult<()> {
        let mut entries = self.entries.write();
        entries.insert(*key, value.clone());
        let mut stats = self.stats.write();
        stats.entries = entries.len();
        stats.writes += 1;
        Ok(())
    }

    fn load_all(&self) -> CoreResult<HashMap<CheckpointKey, Value>> {
        Ok(self.entries.read().clone())
    }
}
