//! Errors raised by core types and checkpoint stores.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Failures shared by every crate that touches checkpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value could not be serialized or deserialized
    InvalidEncoding {
        /// Encoder message
        reason: String,
    },

    /// A checkpoint key was not a valid digest
    InvalidHash {
        /// Why the digest was rejected
        reason: String,
    },

    /// The checkpoint backend failed
    Storage {
        /// Backend error message
        message: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding { reason } => write!(f, "cannot encode value: {reason}"),
            Self::InvalidHash { reason } => write!(f, "bad checkpoint key: {reason}"),
            Self::Storage { message } => write!(f, "checkpoint store: {message}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}
