//! Checkpoint manager: an in-memory table of reusable results in front of
//! an optional persistent store.

use crate::config::CheckpointMode;
use crate::error::DataflowError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use weft_core::{CheckpointKey, CheckpointStore, Value};

/// Checkpoint counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CheckpointStats {
    /// Entries loaded from the store at start
    pub loaded: u64,
    /// Dispatches served from a checkpoint
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Entries written to the store
    pub written: u64,
    /// Entries waiting for a flush
    pub buffered: usize,
    /// Store reads or writes that failed
    pub store_errors: u64,
}

/// Looks up and records checkpointed results
pub struct CheckpointManager {
    mode: CheckpointMode,
    store: Option<Arc<dyn CheckpointStore>>,
    table: RwLock<HashMap<CheckpointKey, Value>>,
    pending: Mutex<Vec<(CheckpointKey, Value)>>,
    loaded: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    written: AtomicU64,
    store_errors: AtomicU64,
}

impl CheckpointManager {
    /// Manager for `mode`; without a store, results are reused within the run only
    #[must_use]
    pub fn new(mode: CheckpointMode, store: Option<Arc<dyn CheckpointStore>>) -> Self {
        Self {
            mode,
            store,
            table: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            loaded: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            written: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
        }
    }

    /// Persistence mode
    #[must_use]
    pub const fn mode(&self) -> CheckpointMode {
        self.mode
    }

    /// Whether lookups and records do anything
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.mode.is_enabled()
    }

    /// Load every stored entry into memory; returns how many
    ///
    /// # Errors
    ///
    /// Returns `Checkpoint` if the store cannot be read
    pub fn load(&self) -> Result<usize, DataflowError> {
        let Some(store) = self.store.as_ref().filter(|_| self.is_enabled()) else {
            return Ok(0);
        };
        let entries = store.load_all()?;
        let count = entries.len();
        self.table.write().extend(entries);
        self.loaded.store(count as u64, Ordering::Relaxed);
        tracing::info!(entries = count, "Loaded checkpoints");
        Ok(count)
    }

    /// Stored result for `key`, checking memory before the store
    pub fn lookup(&self, key: &CheckpointKey) -> Option<Value> {
        if !self.is_enabled() {
            return None;
        }

        if let Some(value) = self.table.read().get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(value.clone());
        }

        let found = match &self.store {
            Some(store) => match store.lookup(key) {
                Ok(found) => found,
                Err(e) => {
                    self.store_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(key = %key, error = %e, "Checkpoint lookup failed");
                    None
                }
            },
            None => None,
        };

        match found {
            Some(value) => {
                self.table.write().insert(*key, value.clone());
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Record a successful result.
    ///
    /// Store failures are logged; they never fail the task.
    pub fn record(&self, key: CheckpointKey, value: Value) {
        if !self.is_enabled() {
            return;
        }

        if let Some(previous) = self.table.write().insert(key, value.clone()) {
            if previous != value {
                tracing::debug!(
                    key = %key,
                    "Checkpoint key reused with a different result; keeping the latest"
                );
            }
        }

        match self.mode {
            CheckpointMode::TaskExit => {
                if let Some(store) = &self.store {
                    match store.store(&key, &value) {
                        Ok(()) => {
                            self.written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            self.store_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(key = %key, error = %e, "Checkpoint write failed");
                        }
                    }
                }
            }
            CheckpointMode::RunExit | CheckpointMode::Manual => {
                if self.store.is_some() {
                    self.pending.lock().push((key, value));
                }
            }
            CheckpointMode::None => {}
        }
    }

    /// Persist buffered entries; returns how many were written
    ///
    /// # Errors
    ///
    /// Returns `Checkpoint` if the store rejects the batch; the batch stays
    /// buffered for the next flush
    pub fn flush(&self) -> Result<usize, DataflowError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(0);
        }

        match store.store_batch(&batch) {
            Ok(count) => {
                self.written.fetch_add(count as u64, Ordering::Relaxed);
                tracing::info!(entries = count, "Flushed checkpoints");
                Ok(count)
            }
            Err(e) => {
                self.store_errors.fetch_add(1, Ordering::Relaxed);
                let mut pending = self.pending.lock();
                let newer = std::mem::replace(&mut *pending, batch);
                pending.extend(newer);
                Err(e.into())
            }
        }
    }

    /// Entries waiting for a flush
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.lock().len()
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> CheckpointStats {
        CheckpointStats {
            loaded: self.loaded.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            buffered: self.buffered(),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("mode", &self.mode)
            .field("has_store", &self.store.is_some())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::{CoreError, CoreResult, ValueMap};

    #[derive(Default)]
    struct MapStore {
        entries: Mutex<HashMap<CheckpointKey, Value>>,
        fail_writes: bool,
    }

    impl CheckpointStore for MapStore {
        fn lookup(&self, key: &CheckpointKey) -> CoreResult<Option<Value>> {
            Ok(self.entries.lock().get(key).cloned())
        }

        fn store(&self, key: &CheckpointKey, value: &Value) -> CoreResult<()> {
            if self.fail_writes {
                return Err(CoreError::Storage {
                    message: "disk full".to_string(),
                });
            }
            self.entries.lock().insert(*key, value.clone());
            Ok(())
        }

        fn load_all(&self) -> CoreResult<HashMap<CheckpointKey, Value>> {
            Ok(self.entries.lock().clone())
        }
    }

    fn key(n: i64) -> CheckpointKey {
        CheckpointKey::derive("f", &[json!(n)], &ValueMap::new())
    }

    #[test]
    fn test_task_exit_writes_through() {
        let store = Arc::new(MapStore::default());
        let manager = CheckpointManager::new(CheckpointMode::TaskExit, Some(store.clone()));

        assert!(manager.lookup(&key(1)).is_none());
        manager.record(key(1), json!(10));
        assert_eq!(store.entries.lock().get(&key(1)), Some(&json!(10)));
        assert_eq!(manager.lookup(&key(1)), Some(json!(10)));

        let stats = manager.stats();
        assert_eq!((stats.hits, stats.misses, stats.written), (1, 1, 1));
    }

    #[test]
    fn test_run_exit_buffers_until_flush() {
        let store = Arc::new(MapStore::default());
        let manager = CheckpointManager::new(CheckpointMode::RunExit, Some(store.clone()));

        manager.record(key(1), json!(1));
        manager.record(key(2), json!(2));
        assert!(store.entries.lock().is_empty());
        assert_eq!(manager.buffered(), 2);

        assert_eq!(manager.flush().unwrap(), 2);
        assert_eq!(store.entries.lock().len(), 2);
        assert_eq!(manager.flush().unwrap(), 0);
    }

    #[test]
    fn test_load_seeds_lookup() {
        let store = Arc::new(MapStore::default());
        store.entries.lock().insert(key(5), json!("cached"));

        let manager = CheckpointManager::new(CheckpointMode::Manual, Some(store));
        assert_eq!(manager.load().unwrap(), 1);
        assert_eq!(manager.lookup(&key(5)), Some(json!("cached")));
    }

    #[test]
    fn test_disabled_mode_is_inert() {
        let store = Arc::new(MapStore::default());
        store.entries.lock().insert(key(5), json!("cached"));

        let manager = CheckpointManager::new(CheckpointMode::None, Some(store.clone()));
        assert_eq!(manager.load().unwrap(), 0);
        assert!(manager.lookup(&key(5)).is_none());
        manager.record(key(6), json!(6));
        assert_eq!(store.entries.lock().len(), 1);
    }

    #[test]
    fn test_write_failure_is_counted_not_raised() {
        let store = Arc::new(MapStore {
            fail_writes: true,
            ..MapStore::default()
        });
        let manager = CheckpointManager::new(CheckpointMode::TaskExit, Some(store));
        manager.record(key(1), json!(1));
        assert_eq!(manager.stats().store_errors, 1);
        // Still reusable within the run.
        assert_eq!(manager.lookup(&key(1)), Some(json!(1)));
    }

    #[test]
    fn test_failed_flush_keeps_batch() {
        let store = Arc::new(MapStore {
            fail_writes: true,
            ..MapStore::default()
        });
        let manager = CheckpointManager::new(CheckpointMode::RunExit, Some(store));
        manager.record(key(1), json!(1));
        assert!(manager.flush().is_err());
        assert_eq!(manager.buffered(), 1);
    }

    #[test]
    fn test_memory_only_reuse() {
        let manager = CheckpointManager::new(CheckpointMode::TaskExit, None);
        manager.record(key(3), json!(9));
        assert_eq!(manager.lookup(&key(3)), Some(json!(9)));
        assert_eq!(manager.flush().unwrap(), 0);
    }
}
