//! Checkpoint keys and the persistence contract for checkpointed results.
//!
//! A checkpoint key identifies a logical computation: the callable's name
//! together with its fully resolved arguments. Two submissions with the same
//! key are interchangeable, so a stored result can stand in for running the
//! task again in a later run.

use crate::{CoreResult, Hash, Value, ValueMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Key of a checkpointed result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey(Hash);

impl CheckpointKey {
    /// Derive the key for `app` applied to resolved arguments.
    ///
    /// Object keys are sorted before hashing, so the key does not depend on
    /// the order keyword arguments were supplied in.
    #[must_use]
    pub fn derive(app: &str, args: &[Value], kwargs: &ValueMap) -> Self {
        let mut args_buf = String::new();
        for arg in args {
            write_canonical(arg, &mut args_buf);
            args_buf.push('\u{1f}');
        }

        let mut kwargs_buf = String::new();
        let mut names: Vec<&String> = kwargs.keys().collect();
        names.sort();
        for name in names {
            write_canonical(&Value::String(name.clone()), &mut kwargs_buf);
            kwargs_buf.push('=');
            write_canonical(&kwargs[name.as_str()], &mut kwargs_buf);
            kwargs_buf.push('\u{1f}');
        }

        Self(Hash::compute_parts(&[
            app.as_bytes(),
            args_buf.as_bytes(),
            kwargs_buf.as_bytes(),
        ]))
    }

    /// Wrap an existing hash
    #[must_use]
    pub const fn from_hash(hash: Hash) -> Self {
        Self(hash)
    }

    /// Underlying hash
    #[must_use]
    pub const fn hash(&self) -> &Hash {
        &self.0
    }

    /// Hex form, used as the on-disk key
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    /// Parse the hex form
    ///
    /// # Errors
    ///
    /// Returns error if the string is not a 32-byte hex hash
    pub fn from_hex(hex: &str) -> CoreResult<Self> {
        Ok(Self(Hash::from_hex(hex)?))
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ckpt_{}", self.0.to_hex())
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(&Value::String(key.clone()), out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Persistence collaborator for checkpointed results.
///
/// Implementations must tolerate concurrent `store` calls; when two writers
/// race on the same key, the last one wins.
pub trait CheckpointStore: Send + Sync {
    /// Fetch the stored result for `key`
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be read
    fn lookup(&self, key: &CheckpointKey) -> CoreResult<Option<Value>>;

    /// Persist `value` under `key`
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be written
    fn store(&self, key: &CheckpointKey, value: &Value) -> CoreResult<()>;

    /// Load every stored entry; called once when a kernel starts
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be read
    fn load_all(&self) -> CoreResult<HashMap<CheckpointKey, Value>>;

    /// Persist a batch of entries, returning how many were written
    ///
    /// # Errors
    ///
    /// Returns the first write error
    fn store_batch(&self, entries: &[(CheckpointKey, Value)]) -> CoreResult<usize> {
        for (key, value) in entries {
            self.store(key, value)?;
        }
        Ok(entries.len())
    }
}
