//! Key hashing
//!
//! Routing keys are identified by the SHA-256 digest of the raw key. The
//! digest is the primary key of a mapping and the source of the uniform
//! value used by weighted shard selection.

use crate::error::{Result, ShardError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum accepted key length in bytes
pub const MAX_KEY_LEN: usize = 1024;

/// Number of key characters retained on a mapping for debugging
pub const KEY_PREFIX_LEN: usize = 32;

/// SHA-256 digest of a routing key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyHash([u8; 32]);

impl KeyHash {
    /// Hash a raw key
    pub fn compute(key: &str) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Validate and hash a key supplied by a caller
    pub fn for_key(key: &str) -> Result<Self> {
        validate_key(key)?;
        Ok(Self::compute(key))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Map the hash onto `[0, 1)` using its first 32 bits (big-endian)
    pub fn uniform(&self) -> f64 {
        let head = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        head as f64 / 4_294_967_296.0
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Reject empty or oversized keys
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(ShardError::Validation("Key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(ShardError::Validation(format!(
            "Key too long: {} bytes (max: {})",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// Prefix of a key stored alongside its mapping
pub fn key_prefix(key: &str) -> String {
    key.chars().take(KEY_PREFIX_LEN).collect()
}
