//! WEFT Core Types
//!
//! Pure types shared by the dataflow kernel, its executors and its
//! checkpoint stores. Nothing in this crate performs I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod error;
pub mod hash;
pub mod id;
pub mod time;

/// Task arguments and results are JSON values.
pub use serde_json::Value;
/// Keyword arguments after resolution.
pub type ValueMap = serde_json::Map<String, Value>;

// Re-exports
pub use checkpoint::{CheckpointKey, CheckpointStore};
pub use error::{CoreError, CoreResult};
pub use hash::{Hash, HashError};
pub use id::{RunId, TaskId, TaskIdGenerator};
pub use time::Timestamp;
