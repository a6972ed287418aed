//! BLAKE3 digests that address checkpointed results.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte BLAKE3 digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; Hash::LEN]);

impl Hash {
    /// Digest width in bytes
    pub const LEN: usize = 32;

    /// Digest of a single buffer
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Digest of several buffers. Each part is prefixed with its length, so
    /// `["ab", "c"]` and `["a", "bc"]` never collide.
    #[must_use]
    pub fn compute_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw digest bytes
    #[must_use]
    pub const fn bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Lowercase hex, 64 characters
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Inverse of [`Hash::to_hex`].
    ///
    /// # Errors
    ///
    /// [`HashError::InvalidHex`] for non-hex input, [`HashError::InvalidLength`]
    /// when the decoded digest is not [`Hash::LEN`] bytes.
    pub fn from_hex(text: &str) -> Result<Self, HashError> {
        let decoded = hex::decode(text).map_err(|_| HashError::InvalidHex)?;
        let digest: [u8; Self::LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| HashError::InvalidLength(decoded.len()))?;
        Ok(Self(digest))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Why a hex digest was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Not a hex string
    InvalidHex,
    /// Decoded to this many bytes instead of 32
    InvalidLength(usize),
}

impl std::error::Error for HashError {}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHex => f.write_str("digest is not valid hex"),
            Self::InvalidLength(len) => {
                write!(f, "digest is {len} bytes, expected {}", Hash::LEN)
            }
        }
    }
}

impl From<HashError> for crate::CoreError {
    fn from(err: HashError) -> Self {
        Self::InvalidHash {
            reason: err.to_string(),
        }
    }
}
