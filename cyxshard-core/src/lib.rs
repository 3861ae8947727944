//! CyxShard Core Library
//!
//! Core abstractions for the CyxShard routing and rebalancing engine.
//! This crate provides:
//! - The shard / mapping / migration / health data model
//! - SHA-256 key hashing and the uniform value used for shard selection
//! - The shard event bus (`shard:load`, `shard:health`, `migration:failed`)
//! - Common error handling

pub mod error;
pub mod events;
pub mod key;
pub mod models;

pub use error::{Result, ShardError};
pub use events::{EventBus, LocalEventBus, ShardEvent, Topic};
pub use key::{key_prefix, validate_key, KeyHash};
pub use models::{
    HealthRecord, Migration, MigrationStat, MigrationStatus, Shard, ShardMapping, ShardStat,
    ShardStatus,
};

/// Number of attempts after which a migration is marked failed
pub const MAX_MIGRATION_ATTEMPTS: u32 = 3;

/// Lower bound on a shard's free-capacity weight so loaded shards are never starved
pub const MIN_SHARD_WEIGHT: f64 = 0.1;
