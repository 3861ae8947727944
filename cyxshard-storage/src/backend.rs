//! Shard store trait
//!
//! Defines the durable-store contract the engine runs against. Every method
//! that touches more than one row (mapping + shard counters) must be atomic
//! in the implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cyxshard_core::{
    HealthRecord, KeyHash, Migration, MigrationStatus, Result, Shard, ShardError, ShardMapping,
    ShardStatus,
};
use uuid::Uuid;

/// Outcome of a first-writer-wins mapping insert
#[derive(Debug, Clone)]
pub enum MappingInsert {
    /// Mapping stored; `shard` is the owner row after its counters were incremented
    Created { mapping: ShardMapping, shard: Shard },
    /// Another writer created the mapping first
    Existing(ShardMapping),
    /// Selected shard is no longer active; nothing was written
    TargetUnavailable(Shard),
}

impl MappingInsert {
    /// Whether this call created the mapping
    pub fn is_created(&self) -> bool {
        matches!(self, MappingInsert::Created { .. })
    }
}

/// Position in a shard's least-recently-accessed order
pub type LruCursor = (DateTime<Utc>, KeyHash);

/// A mapping together with its owner row after an update
#[derive(Debug, Clone)]
pub struct MappingUpdate {
    pub mapping: ShardMapping,
    /// Owner row, present when its counters changed
    pub shard: Option<Shard>,
}

/// Outcome of reassigning a mapping from one shard to another
#[derive(Debug, Clone)]
pub enum ReassignOutcome {
    /// Mapping moved; both rows reflect the adjusted counters
    Moved {
        source: Shard,
        target: Shard,
        load_units: u64,
    },
    /// Mapping already points at the target (re-run of a completed move)
    AlreadyOnTarget,
    /// Mapping no longer exists
    MappingMissing,
    /// Mapping is owned by a shard other than the expected source
    OwnerChanged { current_shard_id: String },
}

/// Async shard store
///
/// All implementations must be Send + Sync for use across tasks.
#[async_trait]
pub trait ShardStore: Send + Sync {
    // ===== Shards =====

    /// Insert or replace a shard row
    async fn put_shard(&self, shard: &Shard) -> Result<()>;

    /// Get a shard by id
    async fn get_shard(&self, id: &str) -> Result<Option<Shard>>;

    /// List shards, optionally filtered by status
    async fn list_shards(&self, status: Option<ShardStatus>) -> Result<Vec<Shard>>;

    /// Atomically adjust a shard's counters (saturating at zero)
    async fn adjust_shard(&self, id: &str, load_delta: i64, item_delta: i64) -> Result<Shard>;

    /// Change a shard's status; `Inactive` is refused while the shard is not empty
    async fn set_shard_status(&self, id: &str, status: ShardStatus) -> Result<Shard>;

    /// Change a shard's status only if it is currently `expected`.
    ///
    /// Returns `None` without writing when the status differs. `Inactive` is
    /// refused while the shard is not empty.
    async fn transition_shard_status(
        &self,
        id: &str,
        expected: ShardStatus,
        status: ShardStatus,
    ) -> Result<Option<Shard>>;

    // ===== Mappings =====

    /// Get the mapping for a key hash
    async fn get_mapping(&self, key_hash: &KeyHash) -> Result<Option<ShardMapping>>;

    /// Insert a mapping unless one exists, incrementing the owner's load and
    /// item count when created. A target that is not `Active` is refused.
    async fn create_mapping(&self, mapping: ShardMapping) -> Result<MappingInsert>;

    /// Record an access; with `add_load` the mapping and its owner each gain
    /// one load unit
    async fn touch_mapping(
        &self,
        key_hash: &KeyHash,
        at: DateTime<Utc>,
        add_load: bool,
    ) -> Result<Option<MappingUpdate>>;

    /// Release one outstanding load unit held through the mapping
    async fn release_mapping(&self, key_hash: &KeyHash) -> Result<Option<MappingUpdate>>;

    /// Move a mapping from `source` to `target`, carrying its item and load units
    async fn reassign_mapping(
        &self,
        key_hash: &KeyHash,
        source: &str,
        target: &str,
    ) -> Result<ReassignOutcome>;

    /// Mappings owned by a shard, least recently accessed first, starting
    /// strictly after `after` when given
    async fn mappings_for_shard(
        &self,
        shard_id: &str,
        after: Option<LruCursor>,
        limit: usize,
    ) -> Result<Vec<ShardMapping>>;

    /// Delete up to `limit` mappings last accessed before `cutoff`, releasing
    /// their counters on the owning shards. Returns the number deleted.
    async fn delete_stale_mappings(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize>;

    // ===== Migrations =====

    /// Insert or replace a migration row
    async fn put_migration(&self, migration: &Migration) -> Result<()>;

    /// Get a migration by id
    async fn get_migration(&self, id: Uuid) -> Result<Option<Migration>>;

    /// List migrations, oldest first, optionally filtered by status
    async fn list_migrations(
        &self,
        status: Option<MigrationStatus>,
        limit: usize,
    ) -> Result<Vec<Migration>>;

    // ===== Health =====

    /// Append a health record
    async fn append_health_record(&self, record: &HealthRecord) -> Result<()>;

    /// Health records for a shard, newest first
    async fn health_records(&self, shard_id: &str, limit: usize) -> Result<Vec<HealthRecord>>;

    /// Remove health records checked before `cutoff`
    async fn prune_health_records(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Apply a signed delta to a counter, saturating at zero
pub fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Apply counter deltas to a shard row and stamp it
pub(crate) fn adjust_counters(shard: &mut Shard, load_delta: i64, item_delta: i64) {
    shard.load_units = apply_delta(shard.load_units, load_delta);
    shard.item_count = apply_delta(shard.item_count, item_delta);
    shard.updated_at = Utc::now();
}

/// Refuse retiring a shard that still owns load or items
pub(crate) fn check_status_change(shard: &Shard, status: ShardStatus) -> Result<()> {
    if status == ShardStatus::Inactive && !shard.is_empty() {
        return Err(ShardError::ShardNotEmpty {
            shard_id: shard.id.clone(),
            load_units: shard.load_units,
            item_count: shard.item_count,
        });
    }
    Ok(())
}

/// Sort a shard's mappings least recently accessed first and keep one page
pub(crate) fn lru_page(
    mut mappings: Vec<ShardMapping>,
    after: Option<LruCursor>,
    limit: usize,
) -> Vec<ShardMapping> {
    if let Some(cursor) = after {
        mappings.retain(|m| (m.last_accessed_at, m.key_hash) > cursor);
    }
    mappings.sort_by(|a, b| {
        a.last_accessed_at
            .cmp(&b.last_accessed_at)
            .then_with(|| a.key_hash.cmp(&b.key_hash))
    });
    mappings.truncate(limit);
    mappings
}

/// Move a mapping's item and load from source to target rows
pub(crate) fn move_counters(source: &mut Shard, target: &mut Shard, load_units: u64) {
    let load = load_units as i64;
    adjust_counters(source, -load, -1);
    adjust_counters(target, load, 1);
}
