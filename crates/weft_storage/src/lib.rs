//! WEFT Storage
//!
//! Checkpoint stores: an in-memory map for single runs and tests, and a
//! `redb` database that lets later runs reuse earlier results.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod memory;
pub mod redb_store;

pub use error::StoreError;
pub use memory::{MemoryCheckpointStore, StoreStats};
pub use redb_store::{CheckpointEntry, RedbCheckpointStore};
