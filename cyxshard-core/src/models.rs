//! Data model for the routing engine
//!
//! These structs are the rows persisted by a `ShardStore`.

use crate::key::KeyHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shard status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStatus {
    Active,
    Unhealthy,
    Inactive,
}

impl Default for ShardStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// An independently addressable partition of the keyspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub id: String,
    pub region: String,

    // Capacity
    pub capacity_units: u64,
    pub load_units: u64,
    pub item_count: u64,

    // Status
    pub status: ShardStatus,

    // Metadata
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Shard {
    /// Create a new active shard with a fresh id and zero load
    pub fn new(region: impl Into<String>, capacity_units: u64) -> Self {
        let now = Utc::now();
        Self {
            id: format!("shard-{}", Uuid::new_v4().simple()),
            region: region.into(),
            capacity_units,
            load_units: 0,
            item_count: 0,
            status: ShardStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create with an explicit id (cluster bootstrap)
    pub fn with_id(id: impl Into<String>, region: impl Into<String>, capacity_units: u64) -> Self {
        Self {
            id: id.into(),
            ..Self::new(region, capacity_units)
        }
    }

    /// Whether the shard still owns load or items
    pub fn is_empty(&self) -> bool {
        self.load_units == 0 && self.item_count == 0
    }

    /// Fraction of capacity in use (capacity 0 counts as full)
    pub fn utilization(&self) -> f64 {
        if self.capacity_units == 0 {
            1.0
        } else {
            self.load_units as f64 / self.capacity_units as f64
        }
    }
}

/// Durable record of which shard currently owns a key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardMapping {
    pub key_hash: KeyHash,
    pub shard_id: String,
    pub original_key_prefix: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// Outstanding load units attributed to the owner through this mapping
    pub load_units: u64,
}

impl ShardMapping {
    /// New mapping holding a single load unit
    pub fn new(key_hash: KeyHash, shard_id: impl Into<String>, key_prefix: String) -> Self {
        let now = Utc::now();
        Self {
            key_hash,
            shard_id: shard_id.into(),
            original_key_prefix: key_prefix,
            created_at: now,
            last_accessed_at: now,
            access_count: 1,
            load_units: 1,
        }
    }
}

/// Migration status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A planned relocation of one key's ownership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    pub id: Uuid,
    pub source_shard_id: String,
    pub target_shard_id: String,
    pub key_hash: KeyHash,
    pub status: MigrationStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Migration {
    /// New pending migration
    pub fn new(
        source_shard_id: impl Into<String>,
        target_shard_id: impl Into<String>,
        key_hash: KeyHash,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_shard_id: source_shard_id.into(),
            target_shard_id: target_shard_id.into(),
            key_hash,
            status: MigrationStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Pending or processing
    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            MigrationStatus::Pending | MigrationStatus::Processing
        )
    }
}

/// Result of one health probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub shard_id: String,
    pub latency_ms: u64,
    pub error_rate: f64,
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
}

/// Per-shard statistics returned by the admin API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardStat {
    pub shard_id: String,
    pub region: String,
    pub status: ShardStatus,
    pub capacity_units: u64,
    pub load_units: u64,
    pub item_count: u64,
    pub utilization: f64,
    pub healthy: bool,
    pub last_latency_ms: Option<u64>,
}

/// Migration counts grouped by source, target and status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStat {
    pub source_shard_id: String,
    pub target_shard_id: String,
    pub status: MigrationStatus,
    pub count: u64,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_new() {
        let shard = Shard::new("eu-west", 1000);
        assert!(shard.id.starts_with("shard-"));
        assert_eq!(shard.status, ShardStatus::Active);
        assert!(shard.is_empty());
        assert_eq!(shard.utilization(), 0.0);
    }

    #[test]
    fn test_shard_utilization() {
        let mut shard = Shard::with_id("s1", "us-east", 200);
        shard.load_units = 50;
        assert_eq!(shard.utilization(), 0.25);

        let zero = Shard::with_id("s2", "us-east", 0);
        assert_eq!(zero.utilization(), 1.0);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ShardStatus::Unhealthy.to_string(), "unhealthy");
        assert_eq!(MigrationStatus::Processing.to_string(), "processing");
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&ShardStatus::Inactive).unwrap();
        assert_eq!(json, "\"inactive\"");
    }

    #[test]
    fn test_migration_new() {
        let migration = Migration::new("a", "b", KeyHash::compute("k"));
        assert_eq!(migration.status, MigrationStatus::Pending);
        assert_eq!(migration.retry_count, 0);
        assert!(migration.is_open());
        assert!(migration.started_at.is_none());
    }
}
