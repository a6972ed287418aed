//! Storage errors.

use weft_core::CoreError;

/// Checkpoint store error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database rejected an operation
    #[error("Database error: {0}")]
    Database(#[from] redb::Error),

    /// A stored record could not be encoded or decoded
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A stored key is not a checkpoint key
    #[error("Invalid checkpoint key '{key}': {reason}")]
    InvalidKey {
        /// Key as stored
        key: String,
        /// Why it was rejected
        reason: String,
    },

    /// Filesystem failure around the database file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        CoreError::Storage {
            message: err.to_string(),
        }
    }
}
