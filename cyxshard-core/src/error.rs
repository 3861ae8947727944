//! Error types for CyxShard
//!
//! Provides a unified error type for routing, registry, and migration operations.

use thiserror::Error;

/// Result type alias for CyxShard operations
pub type Result<T> = std::result::Result<T, ShardError>;

/// Unified error type for CyxShard
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShardError {
    // ===== Caller Errors =====
    #[error("Validation error: {0}")]
    Validation(String),

    // ===== Routing Errors =====
    #[error("No available shards: no active and healthy candidates")]
    NoAvailableShards,

    // ===== Registry Errors =====
    #[error("Shard {shard_id} is not empty: {load_units} load units, {item_count} items")]
    ShardNotEmpty {
        shard_id: String,
        load_units: u64,
        item_count: u64,
    },

    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    // ===== Migration Errors =====
    #[error("Migration {migration_id} failed after {attempts} attempts: {last_error}")]
    MigrationRetryExhausted {
        migration_id: String,
        attempts: u32,
        last_error: String,
    },

    // ===== Store Errors =====
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ShardError {
    /// Whether the failure is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShardError::StoreUnavailable(_))
    }
}

impl From<bincode::Error> for ShardError {
    fn from(err: bincode::Error) -> Self {
        ShardError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ShardError {
    fn from(err: serde_json::Error) -> Self {
        ShardError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShardError::ShardNotEmpty {
            shard_id: "shard-1".to_string(),
            load_units: 3,
            item_count: 5,
        };
        assert_eq!(
            err.to_string(),
            "Shard shard-1 is not empty: 3 load units, 5 items"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ShardError::StoreUnavailable("timeout".to_string()).is_retryable());
        assert!(!ShardError::NoAvailableShards.is_retryable());
        assert!(!ShardError::Validation("empty key".to_string()).is_retryable());
    }
}
