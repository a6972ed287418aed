//! Persistent checkpoint store on a `redb` database file.
//!
//! One table maps the hex checkpoint key to a JSON record holding the
//! result and the time it was stored. Write transactions are serialized by
//! the database, so concurrent writers to the same key resolve to the last
//! commit.

use crate::error::StoreError;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use weft_core::{CheckpointKey, CheckpointStore, CoreResult, Timestamp, Value};

const CHECKPOINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoints");

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    value: Value,
    stored_at: Timestamp,
}

/// A stored checkpoint with its metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointEntry {
    /// Key
    pub key: CheckpointKey,
    /// Result
    pub value: Value,
    /// When it was written
    pub stored_at: Timestamp,
}

/// Checkpoint store backed by a `redb` file
pub struct RedbCheckpointStore {
    db: Database,
    path: PathBuf,
}

impl RedbCheckpointStore {
    /// Open or create the database at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or is not a checkpoint
    /// database
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&path).map_err(redb::Error::from)?;
        // Create the table up front so readers never see it missing.
        let txn = db.begin_write().map_err(redb::Error::from)?;
        txn.open_table(CHECKPOINTS).map_err(redb::Error::from)?;
        txn.commit().map_err(redb::Error::from)?;

        tracing::debug!(path = %path.display(), "Opened checkpoint database");
        Ok(Self { db, path })
    }

    /// Database file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn get(&self, key: &CheckpointKey) -> Result<Option<StoredRecord>, StoreError> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(CHECKPOINTS).map_err(redb::Error::from)?;
        let hex = key.to_hex();
        match table.get(hex.as_str()).map_err(redb::Error::from)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn put_all(&self, entries: &[(CheckpointKey, Value)]) -> Result<usize, StoreError> {
        let stored_at = Timestamp::now();
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        {
            let mut table = txn.open_table(CHECKPOINTS).map_err(redb::Error::from)?;
            for (key, value) in entries {
                let bytes = serde_json::to_vec(&StoredRecord {
                    value: value.clone(),
                    stored_at,
                })?;
                table
                    .insert(key.to_hex().as_str(), bytes.as_slice())
                    .map_err(redb::Error::from)?;
            }
        }
        txn.commit().map_err(redb::Error::from)?;
        Ok(entries.len())
    }

    /// Every entry, ordered by key
    ///
    /// # Errors
    ///
    /// Returns error if the table cannot be read or holds a malformed record
    pub fn list(&self) -> Result<Vec<CheckpointEntry>, StoreError> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(CHECKPOINTS).map_err(redb::Error::from)?;

        let mut out = Vec::new();
        for item in table.iter().map_err(redb::Error::from)? {
            let (key, record) = item.map_err(redb::Error::from)?;
            let key_str = key.value();
            let parsed = CheckpointKey::from_hex(key_str).map_err(|e| StoreError::InvalidKey {
                key: key_str.to_string(),
                reason: e.to_string(),
            })?;
            let record: StoredRecord = serde_json::from_slice(record.value())?;
            out.push(CheckpointEntry {
                key: parsed,
                value: record.value,
                stored_at: record.stored_at,
            });
        }
        Ok(out)
    }

    /// Number of entries
    ///
    /// # Errors
    ///
    /// Returns error if the table cannot be read
    pub fn len(&self) -> Result<u64, StoreError> {
        let txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = txn.open_table(CHECKPOINTS).map_err(redb::Error::from)?;
        Ok(table.len().map_err(redb::Error::from)?)
    }

    /// Whether there are no entries
    ///
    /// # Errors
    ///
    /// Returns error if the table cannot be read
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Remove one entry
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn remove(&self, key: &CheckpointKey) -> Result<bool, StoreError> {
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        let removed = {
            let mut table = txn.open_table(CHECKPOINTS).map_err(redb::Error::from)?;
            let hex = key.to_hex();
            let old = table.remove(hex.as_str()).map_err(redb::Error::from)?;
            old.is_some()
        };
        txn.commit().map_err(redb::Error::from)?;
        Ok(removed)
    }

    /// Remove every entry; returns how many were removed
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn clear(&self) -> Result<u64, StoreError> {
        let txn = self.db.begin_write().map_err(redb::Error::from)?;
        let removed = {
            let mut table = txn.open_table(CHECKPOINTS).map_err(redb::Error::from)?;
            let count = table.len().map_err(redb::Error::from)?;
            table.retain(|_, _| false).map_err(redb::Error::from)?;
            count
        };
        txn.commit().map_err(redb::Error::from)?;
        tracing::info!(path = %self.path.display(), removed, "Cleared checkpoints");
        Ok(removed)
    }
}

impl std::fmt::Debug for RedbCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbCheckpointStore")
            .field("path", &self.path)
            .finish()
    }
}

impl CheckpointStore for RedbCheckpointStore {
    fn lookup(&self, key: &CheckpointKey) -> CoreResult<Option<Value>> {
        Ok(self.get(key)?.map(|record| record.value))
    }

    fn store(&self, key: &CheckpointKey, value: &Value) -> CoreResult<()> {
        self.put_all(std::slice::from_ref(&(*key, value.clone())))?;
        Ok(())
    }

    fn load_all(&self) -> CoreResult<HashMap<CheckpointKey, Value>> {
        Ok(self
            .list()?
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect())
    }

    fn store_batch(&self, entries: &[(CheckpointKey, Value)]) -> CoreResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        Ok(self.put_all(entries)?)
    }
}
