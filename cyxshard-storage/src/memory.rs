//! In-memory shard store
//!
//! Used for testing and development. Not persistent. All tables sit behind a
//! single lock, so every multi-row operation is trivially atomic.

use crate::backend::{
    adjust_counters, check_status_change, lru_page, move_counters, LruCursor, MappingInsert,
    MappingUpdate, ReassignOutcome, ShardStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cyxshard_core::{
    HealthRecord, KeyHash, Migration, MigrationStatus, Result, Shard, ShardError, ShardMapping,
    ShardStatus,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Store operations, used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    PutShard,
    GetShard,
    ListShards,
    AdjustShard,
    SetShardStatus,
    TransitionShardStatus,
    GetMapping,
    CreateMapping,
    TouchMapping,
    ReleaseMapping,
    ReassignMapping,
    MappingsForShard,
    DeleteStaleMappings,
    PutMigration,
    GetMigration,
    ListMigrations,
    AppendHealthRecord,
    HealthRecords,
    PruneHealthRecords,
}

#[derive(Default)]
struct Tables {
    shards: HashMap<String, Shard>,
    mappings: HashMap<KeyHash, ShardMapping>,
    migrations: HashMap<Uuid, Migration>,
    health: HashMap<String, Vec<HealthRecord>>,
}

/// In-memory shard store
pub struct MemoryStore {
    tables: RwLock<Tables>,

    /// Remaining injected failures per operation
    faults: Mutex<HashMap<StoreOp, (u32, ShardError)>>,

    /// Artificial latency applied before every operation
    delay: RwLock<Option<Duration>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            faults: Mutex::new(HashMap::new()),
            delay: RwLock::new(None),
        }
    }

    /// Make the next `count` calls of `op` fail with `StoreUnavailable`
    pub fn fail_next(&self, op: StoreOp, count: u32) {
        let err = ShardError::StoreUnavailable(format!("injected fault on {:?}", op));
        self.fail_next_with(op, count, err);
    }

    /// Make the next `count` calls of `op` fail with `err`
    pub fn fail_next_with(&self, op: StoreOp, count: u32, err: ShardError) {
        self.faults.lock().insert(op, (count, err));
    }

    /// Delay every operation (simulates a slow backend)
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write() = delay;
    }

    /// Number of stored mappings
    pub fn mapping_count(&self) -> usize {
        self.tables.read().mappings.len()
    }

    async fn enter(&self, op: StoreOp) -> Result<()> {
        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut faults = self.faults.lock();
        if let Some((remaining, err)) = faults.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(err.clone());
            }
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShardStore for MemoryStore {
    async fn put_shard(&self, shard: &Shard) -> Result<()> {
        self.enter(StoreOp::PutShard).await?;
        self.tables
            .write()
            .shards
            .insert(shard.id.clone(), shard.clone());
        Ok(())
    }

    async fn get_shard(&self, id: &str) -> Result<Option<Shard>> {
        self.enter(StoreOp::GetShard).await?;
        Ok(self.tables.read().shards.get(id).cloned())
    }

    async fn list_shards(&self, status: Option<ShardStatus>) -> Result<Vec<Shard>> {
        self.enter(StoreOp::ListShards).await?;
        let tables = self.tables.read();
        let mut shards: Vec<Shard> = tables
            .shards
            .values()
            .filter(|s| status.map_or(true, |st| s.status == st))
            .cloned()
            .collect();
        shards.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(shards)
    }

    async fn adjust_shard(&self, id: &str, load_delta: i64, item_delta: i64) -> Result<Shard> {
        self.enter(StoreOp::AdjustShard).await?;
        let mut tables = self.tables.write();
        let shard = tables
            .shards
            .get_mut(id)
            .ok_or_else(|| ShardError::ShardNotFound(id.to_string()))?;
        adjust_counters(shard, load_delta, item_delta);
        Ok(shard.clone())
    }

    async fn set_shard_status(&self, id: &str, status: ShardStatus) -> Result<Shard> {
        self.enter(StoreOp::SetShardStatus).await?;
        let mut tables = self.tables.write();
        let shard = tables
            .shards
            .get_mut(id)
            .ok_or_else(|| ShardError::ShardNotFound(id.to_string()))?;

        check_status_change(shard, status)?;
        shard.status = status;
        shard.updated_at = Utc::now();
        Ok(shard.clone())
    }

    async fn transition_shard_status(
        &self,
        id: &str,
        expected: ShardStatus,
        status: ShardStatus,
    ) -> Result<Option<Shard>> {
        self.enter(StoreOp::TransitionShardStatus).await?;
        let mut tables = self.tables.write();
        let shard = tables
            .shards
            .get_mut(id)
            .ok_or_else(|| ShardError::ShardNotFound(id.to_string()))?;

        if shard.status != expected {
            return Ok(None);
        }
        check_status_change(shard, status)?;
        shard.status = status;
        shard.updated_at = Utc::now();
        Ok(Some(shard.clone()))
    }

    async fn get_mapping(&self, key_hash: &KeyHash) -> Result<Option<ShardMapping>> {
        self.enter(StoreOp::GetMapping).await?;
        Ok(self.tables.read().mappings.get(key_hash).cloned())
    }

    async fn create_mapping(&self, mapping: ShardMapping) -> Result<MappingInsert> {
        self.enter(StoreOp::CreateMapping).await?;
        let mut guard = self.tables.write();
        let tables = &mut *guard;

        if let Some(existing) = tables.mappings.get(&mapping.key_hash) {
            return Ok(MappingInsert::Existing(existing.clone()));
        }

        let shard = tables
            .shards
            .get_mut(&mapping.shard_id)
            .ok_or_else(|| ShardError::ShardNotFound(mapping.shard_id.clone()))?;
        if shard.status != ShardStatus::Active {
            return Ok(MappingInsert::TargetUnavailable(shard.clone()));
        }
        adjust_counters(shard, mapping.load_units as i64, 1);
        let shard = shard.clone();

        tables.mappings.insert(mapping.key_hash, mapping.clone());

        Ok(MappingInsert::Created { mapping, shard })
    }

    async fn touch_mapping(
        &self,
        key_hash: &KeyHash,
        at: DateTime<Utc>,
        add_load: bool,
    ) -> Result<Option<MappingUpdate>> {
        self.enter(StoreOp::TouchMapping).await?;
        let mut guard = self.tables.write();
        let tables = &mut *guard;

        let Some(mapping) = tables.mappings.get_mut(key_hash) else {
            return Ok(None);
        };
        mapping.last_accessed_at = at;
        mapping.access_count += 1;

        let mut shard = None;
        if add_load {
            mapping.load_units += 1;
            if let Some(owner) = tables.shards.get_mut(&mapping.shard_id) {
                adjust_counters(owner, 1, 0);
                shard = Some(owner.clone());
            }
        }

        Ok(Some(MappingUpdate {
            mapping: mapping.clone(),
            shard,
        }))
    }

    async fn release_mapping(&self, key_hash: &KeyHash) -> Result<Option<MappingUpdate>> {
        self.enter(StoreOp::ReleaseMapping).await?;
        let mut guard = self.tables.write();
        let tables = &mut *guard;

        let Some(mapping) = tables.mappings.get_mut(key_hash) else {
            return Ok(None);
        };

        let mut shard = None;
        if mapping.load_units > 0 {
            mapping.load_units -= 1;
            if let Some(owner) = tables.shards.get_mut(&mapping.shard_id) {
                adjust_counters(owner, -1, 0);
                shard = Some(owner.clone());
            }
        }

        Ok(Some(MappingUpdate {
            mapping: mapping.clone(),
            shard,
        }))
    }

    async fn reassign_mapping(
        &self,
        key_hash: &KeyHash,
        source: &str,
        target: &str,
    ) -> Result<ReassignOutcome> {
        self.enter(StoreOp::ReassignMapping).await?;
        let mut guard = self.tables.write();
        let tables = &mut *guard;

        let Some(mapping) = tables.mappings.get_mut(key_hash) else {
            return Ok(ReassignOutcome::MappingMissing);
        };
        if mapping.shard_id == target {
            return Ok(ReassignOutcome::AlreadyOnTarget);
        }
        if mapping.shard_id != source {
            return Ok(ReassignOutcome::OwnerChanged {
                current_shard_id: mapping.shard_id.clone(),
            });
        }

        let mut source_row = tables
            .shards
            .get(source)
            .cloned()
            .ok_or_else(|| ShardError::ShardNotFound(source.to_string()))?;
        let mut target_row = tables
            .shards
            .get(target)
            .cloned()
            .ok_or_else(|| ShardError::ShardNotFound(target.to_string()))?;

        let load_units = mapping.load_units;
        move_counters(&mut source_row, &mut target_row, load_units);
        mapping.shard_id = target.to_string();

        tables.shards.insert(source_row.id.clone(), source_row.clone());
        tables.shards.insert(target_row.id.clone(), target_row.clone());

        Ok(ReassignOutcome::Moved {
            source: source_row,
            target: target_row,
            load_units,
        })
    }

    async fn mappings_for_shard(
        &self,
        shard_id: &str,
        after: Option<LruCursor>,
        limit: usize,
    ) -> Result<Vec<ShardMapping>> {
        self.enter(StoreOp::MappingsForShard).await?;
        let tables = self.tables.read();
        let mappings: Vec<ShardMapping> = tables
            .mappings
            .values()
            .filter(|m| m.shard_id == shard_id)
            .cloned()
            .collect();
        Ok(lru_page(mappings, after, limit))
    }

    async fn delete_stale_mappings(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize> {
        self.enter(StoreOp::DeleteStaleMappings).await?;
        let mut guard = self.tables.write();
        let tables = &mut *guard;

        let mut stale: Vec<(DateTime<Utc>, KeyHash)> = tables
            .mappings
            .values()
            .filter(|m| m.last_accessed_at < cutoff)
            .map(|m| (m.last_accessed_at, m.key_hash))
            .collect();
        stale.sort();
        stale.truncate(limit);

        for (_, key_hash) in &stale {
            if let Some(mapping) = tables.mappings.remove(key_hash) {
                if let Some(owner) = tables.shards.get_mut(&mapping.shard_id) {
                    adjust_counters(owner, -(mapping.load_units as i64), -1);
                }
            }
        }

        Ok(stale.len())
    }

    async fn put_migration(&self, migration: &Migration) -> Result<()> {
        self.enter(StoreOp::PutMigration).await?;
        self.tables
            .write()
            .migrations
            .insert(migration.id, migration.clone());
        Ok(())
    }

    async fn get_migration(&self, id: Uuid) -> Result<Option<Migration>> {
        self.enter(StoreOp::GetMigration).await?;
        Ok(self.tables.read().migrations.get(&id).cloned())
    }

    async fn list_migrations(
        &self,
        status: Option<MigrationStatus>,
        limit: usize,
    ) -> Result<Vec<Migration>> {
        self.enter(StoreOp::ListMigrations).await?;
        let tables = self.tables.read();
        let mut migrations: Vec<Migration> = tables
            .migrations
            .values()
            .filter(|m| status.map_or(true, |st| m.status == st))
            .cloned()
            .collect();
        migrations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        migrations.truncate(limit);
        Ok(migrations)
    }

    async fn append_health_record(&self, record: &HealthRecord) -> Result<()> {
        self.enter(StoreOp::AppendHealthRecord).await?;
        self.tables
            .write()
            .health
            .entry(record.shard_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn health_records(&self, shard_id: &str, limit: usize) -> Result<Vec<HealthRecord>> {
        self.enter(StoreOp::HealthRecords).await?;
        let tables = self.tables.read();
        let mut records = tables.health.get(shard_id).cloned().unwrap_or_default();
        records.sort_by(|a, b| b.checked_at.cmp(&a.checked_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn prune_health_records(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.enter(StoreOp::PruneHealthRecords).await?;
        let mut tables = self.tables.write();
        let mut removed = 0;
        for records in tables.health.values_mut() {
            let before = records.len();
            records.retain(|r| r.checked_at >= cutoff);
            removed += before - records.len();
        }
        Ok(removed)
    }
}
