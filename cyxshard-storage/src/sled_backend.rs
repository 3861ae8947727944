//! Sled-based shard store
//!
//! Durable store for shards, mappings, migrations and health records.
//! Operations that touch a mapping and its owner's counters run as sled
//! multi-tree transactions, so a crash never leaves counters out of step
//! with the mappings table.

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
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
};
use sled::Transactional;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

const SHARDS_TREE: &str = "shards";
const MAPPINGS_TREE: &str = "mappings";
const MIGRATIONS_TREE: &str = "migrations";
const HEALTH_TREE: &str = "health";

/// Sled-based shard store
pub struct SledStore {
    db: sled::Db,
    shards: sled::Tree,
    mappings: sled::Tree,
    migrations: sled::Tree,
    health: sled::Tree,
}

impl SledStore {
    /// Open or create a store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!(path = ?path.as_ref(), "Opening Sled shard store");

        let db = sled::open(path.as_ref()).map_err(|e| {
            ShardError::StoreUnavailable(format!("Failed to open Sled: {}", e))
        })?;

        Self::from_db(db)
    }

    /// Open an in-memory store (for testing)
    pub fn open_temporary() -> Result<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| {
            ShardError::StoreUnavailable(format!("Failed to open Sled: {}", e))
        })?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let tree = |name: &str| db.open_tree(name).map_err(storage_error);
        Ok(Self {
            shards: tree(SHARDS_TREE)?,
            mappings: tree(MAPPINGS_TREE)?,
            migrations: tree(MIGRATIONS_TREE)?,
            health: tree(HEALTH_TREE)?,
            db,
        })
    }

    /// Flush to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await.map_err(storage_error)?;
        Ok(())
    }

    /// Get database size estimate
    pub fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    fn get_value<K: AsRef<[u8]>, V: DeserializeOwned>(
        &self,
        tree: &sled::Tree,
        key: K,
    ) -> Result<Option<V>> {
        match tree.get(key).map_err(storage_error)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_value<K: AsRef<[u8]>, V: Serialize>(
        &self,
        tree: &sled::Tree,
        key: K,
        value: &V,
    ) -> Result<()> {
        let encoded = bincode::serialize(value)?;
        tree.insert(key, encoded).map_err(storage_error)?;
        Ok(())
    }

    fn scan<V: DeserializeOwned>(&self, tree: &sled::Tree) -> Result<Vec<V>> {
        let mut values = Vec::new();
        for item in tree.iter() {
            let (_, bytes) = item.map_err(storage_error)?;
            values.push(bincode::deserialize(&bytes)?);
        }
        Ok(values)
    }
}

fn storage_error(err: sled::Error) -> ShardError {
    ShardError::StoreUnavailable(err.to_string())
}

fn map_tx_error(err: TransactionError<ShardError>) -> ShardError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => storage_error(e),
    }
}

fn abort<T>(err: ShardError) -> ConflictableTransactionResult<T, ShardError> {
    Err(ConflictableTransactionError::Abort(err))
}

fn tx_decode<T: DeserializeOwned>(bytes: &[u8]) -> ConflictableTransactionResult<T, ShardError> {
    bincode::deserialize(bytes).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn tx_encode<T: Serialize>(value: &T) -> ConflictableTransactionResult<Vec<u8>, ShardError> {
    bincode::serialize(value).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

/// Health keys sort chronologically within a shard prefix
fn health_key(record: &HealthRecord) -> String {
    let nanos = record.checked_at.timestamp_nanos_opt().unwrap_or(0).max(0);
    format!("{}/{:020}/{}", record.shard_id, nanos, Uuid::new_v4().simple())
}

#[async_trait]
impl ShardStore for SledStore {
    // ===== Shards =====

    async fn put_shard(&self, shard: &Shard) -> Result<()> {
        self.put_value(&self.shards, shard.id.as_bytes(), shard)?;
        debug!(shard_id = %shard.id, status = %shard.status, "Stored shard");
        Ok(())
    }

    async fn get_shard(&self, id: &str) -> Result<Option<Shard>> {
        self.get_value(&self.shards, id.as_bytes())
    }

    async fn list_shards(&self, status: Option<ShardStatus>) -> Result<Vec<Shard>> {
        // Keys are shard ids, so iteration order is already sorted by id
        let shards: Vec<Shard> = self.scan(&self.shards)?;
        Ok(shards
            .into_iter()
            .filter(|s| status.map_or(true, |st| s.status == st))
            .collect())
    }

    async fn adjust_shard(&self, id: &str, load_delta: i64, item_delta: i64) -> Result<Shard> {
        self.shards
            .transaction(|shards| {
                let Some(bytes) = shards.get(id.as_bytes())? else {
                    return abort(ShardError::ShardNotFound(id.to_string()));
                };
                let mut shard: Shard = tx_decode(&bytes)?;
                adjust_counters(&mut shard, load_delta, item_delta);
                shards.insert(id.as_bytes(), tx_encode(&shard)?)?;
                Ok(shard)
            })
            .map_err(map_tx_error)
    }

    async fn set_shard_status(&self, id: &str, status: ShardStatus) -> Result<Shard> {
        self.shards
            .transaction(|shards| {
                let Some(bytes) = shards.get(id.as_bytes())? else {
                    return abort(ShardError::ShardNotFound(id.to_string()));
                };
                let mut shard: Shard = tx_decode(&bytes)?;
                if let Err(e) = check_status_change(&shard, status) {
                    return abort(e);
                }

                shard.status = status;
                shard.updated_at = Utc::now();
                shards.insert(id.as_bytes(), tx_encode(&shard)?)?;
                Ok(shard)
            })
            .map_err(map_tx_error)
    }

    async fn transition_shard_status(
        &self,
        id: &str,
        expected: ShardStatus,
        status: ShardStatus,
    ) -> Result<Option<Shard>> {
        self.shards
            .transaction(|shards| {
                let Some(bytes) = shards.get(id.as_bytes())? else {
                    return abort(ShardError::ShardNotFound(id.to_string()));
                };
                let mut shard: Shard = tx_decode(&bytes)?;
                if shard.status != expected {
                    return Ok(None);
                }
                if let Err(e) = check_status_change(&shard, status) {
                    return abort(e);
                }

                shard.status = status;
                shard.updated_at = Utc::now();
                shards.insert(id.as_bytes(), tx_encode(&shard)?)?;
                Ok(Some(shard))
            })
            .map_err(map_tx_error)
    }

    // ===== Mappings =====

    async fn get_mapping(&self, key_hash: &KeyHash) -> Result<Option<ShardMapping>> {
        self.get_value(&self.mappings, key_hash.as_bytes())
    }

    async fn create_mapping(&self, mapping: ShardMapping) -> Result<MappingInsert> {
        let key = mapping.key_hash.as_bytes().to_vec();

        (&self.shards, &self.mappings)
            .transaction(|(shards, mappings)| {
                if let Some(bytes) = mappings.get(&key)? {
                    return Ok(MappingInsert::Existing(tx_decode(&bytes)?));
                }

                let Some(bytes) = shards.get(mapping.shard_id.as_bytes())? else {
                    return abort(ShardError::ShardNotFound(mapping.shard_id.clone()));
                };
                let mut shard: Shard = tx_decode(&bytes)?;
                if shard.status != ShardStatus::Active {
                    return Ok(MappingInsert::TargetUnavailable(shard));
                }
                adjust_counters(&mut shard, mapping.load_units as i64, 1);

                shards.insert(shard.id.as_bytes(), tx_encode(&shard)?)?;
                mappings.insert(key.as_slice(), tx_encode(&mapping)?)?;

                Ok(MappingInsert::Created {
                    mapping: mapping.clone(),
                    shard,
                })
            })
            .map_err(map_tx_error)
    }

    async fn touch_mapping(
        &self,
        key_hash: &KeyHash,
        at: DateTime<Utc>,
        add_load: bool,
    ) -> Result<Option<MappingUpdate>> {
        let key = key_hash.as_bytes();

        (&self.shards, &self.mappings)
            .transaction(|(shards, mappings)| {
                let Some(bytes) = mappings.get(key)? else {
                    return Ok(None);
                };
                let mut mapping: ShardMapping = tx_decode(&bytes)?;
                mapping.last_accessed_at = at;
                mapping.access_count += 1;

                let mut shard = None;
                if add_load {
                    mapping.load_units += 1;
                    if let Some(bytes) = shards.get(mapping.shard_id.as_bytes())? {
                        let mut owner: Shard = tx_decode(&bytes)?;
                        adjust_counters(&mut owner, 1, 0);
                        shards.insert(owner.id.as_bytes(), tx_encode(&owner)?)?;
                        shard = Some(owner);
                    }
                }

                mappings.insert(key.as_slice(), tx_encode(&mapping)?)?;
                Ok(Some(MappingUpdate { mapping, shard }))
            })
            .map_err(map_tx_error)
    }

    async fn release_mapping(&self, key_hash: &KeyHash) -> Result<Option<MappingUpdate>> {
        let key = key_hash.as_bytes();

        (&self.shards, &self.mappings)
            .transaction(|(shards, mappings)| {
                let Some(bytes) = mappings.get(key)? else {
                    return Ok(None);
                };
                let mut mapping: ShardMapping = tx_decode(&bytes)?;

                let mut shard = None;
                if mapping.load_units > 0 {
                    mapping.load_units -= 1;
                    if let Some(bytes) = shards.get(mapping.shard_id.as_bytes())? {
                        let mut owner: Shard = tx_decode(&bytes)?;
                        adjust_counters(&mut owner, -1, 0);
                        shards.insert(owner.id.as_bytes(), tx_encode(&owner)?)?;
                        shard = Some(owner);
                    }
                    mappings.insert(key.as_slice(), tx_encode(&mapping)?)?;
                }

                Ok(Some(MappingUpdate { mapping, shard }))
            })
            .map_err(map_tx_error)
    }

    async fn reassign_mapping(
        &self,
        key_hash: &KeyHash,
        source: &str,
        target: &str,
    ) -> Result<ReassignOutcome> {
        let key = key_hash.as_bytes();

        (&self.shards, &self.mappings)
            .transaction(|(shards, mappings)| {
                let Some(bytes) = mappings.get(key)? else {
                    return Ok(ReassignOutcome::MappingMissing);
                };
                let mut mapping: ShardMapping = tx_decode(&bytes)?;
                if mapping.shard_id == target {
                    return Ok(ReassignOutcome::AlreadyOnTarget);
                }
                if mapping.shard_id != source {
                    return Ok(ReassignOutcome::OwnerChanged {
                        current_shard_id: mapping.shard_id.clone(),
                    });
                }

                let Some(source_bytes) = shards.get(source.as_bytes())? else {
                    return abort(ShardError::ShardNotFound(source.to_string()));
                };
                let Some(target_bytes) = shards.get(target.as_bytes())? else {
                    return abort(ShardError::ShardNotFound(target.to_string()));
                };
                let mut source_row: Shard = tx_decode(&source_bytes)?;
                let mut target_row: Shard = tx_decode(&target_bytes)?;

                let load_units = mapping.load_units;
                move_counters(&mut source_row, &mut target_row, load_units);
                mapping.shard_id = target.to_string();

                shards.insert(source.as_bytes(), tx_encode(&source_row)?)?;
                shards.insert(target.as_bytes(), tx_encode(&target_row)?)?;
                mappings.insert(key.as_slice(), tx_encode(&mapping)?)?;

                Ok(ReassignOutcome::Moved {
                    source: source_row,
                    target: target_row,
                    load_units,
                })
            })
            .map_err(map_tx_error)
    }

    async fn mappings_for_shard(
        &self,
        shard_id: &str,
        after: Option<LruCursor>,
        limit: usize,
    ) -> Result<Vec<ShardMapping>> {
        let mappings: Vec<ShardMapping> = self
            .scan::<ShardMapping>(&self.mappings)?
            .into_iter()
            .filter(|m| m.shard_id == shard_id)
            .collect();
        Ok(lru_page(mappings, after, limit))
    }

    async fn delete_stale_mappings(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize> {
        let mut stale: Vec<(DateTime<Utc>, KeyHash)> = self
            .scan::<ShardMapping>(&self.mappings)?
            .into_iter()
            .filter(|m| m.last_accessed_at < cutoff)
            .map(|m| (m.last_accessed_at, m.key_hash))
            .collect();
        stale.sort();
        stale.truncate(limit);

        let mut deleted = 0;
        for (_, key_hash) in stale {
            let key = key_hash.as_bytes();
            let removed = (&self.shards, &self.mappings)
                .transaction(|(shards, mappings)| {
                    let Some(bytes) = mappings.get(key)? else {
                        return Ok(false);
                    };
                    let mapping: ShardMapping = tx_decode(&bytes)?;
                    // Touched again since the scan
                    if mapping.last_accessed_at >= cutoff {
                        return Ok(false);
                    }

                    mappings.remove(key.as_slice())?;
                    if let Some(bytes) = shards.get(mapping.shard_id.as_bytes())? {
                        let mut owner: Shard = tx_decode(&bytes)?;
                        adjust_counters(&mut owner, -(mapping.load_units as i64), -1);
                        shards.insert(owner.id.as_bytes(), tx_encode(&owner)?)?;
                    }
                    Ok(true)
                })
                .map_err(map_tx_error)?;

            if removed {
                deleted += 1;
            }
        }

        Ok(deleted)
    }

    // ===== Migrations =====

    async fn put_migration(&self, migration: &Migration) -> Result<()> {
        self.put_value(&self.migrations, migration.id.as_bytes(), migration)
    }

    async fn get_migration(&self, id: Uuid) -> Result<Option<Migration>> {
        self.get_value(&self.migrations, id.as_bytes())
    }

    async fn list_migrations(
        &self,
        status: Option<MigrationStatus>,
        limit: usize,
    ) -> Result<Vec<Migration>> {
        let mut migrations: Vec<Migration> = self
            .scan::<Migration>(&self.migrations)?
            .into_iter()
            .filter(|m| status.map_or(true, |st| m.status == st))
            .collect();
        migrations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        migrations.truncate(limit);
        Ok(migrations)
    }

    // ===== Health =====

    async fn append_health_record(&self, record: &HealthRecord) -> Result<()> {
        self.put_value(&self.health, health_key(record).as_bytes(), record)
    }

    async fn health_records(&self, shard_id: &str, limit: usize) -> Result<Vec<HealthRecord>> {
        let prefix = format!("{}/", shard_id);
        let mut records = Vec::new();

        for item in self.health.scan_prefix(prefix.as_bytes()).rev() {
            if records.len() >= limit {
                break;
            }
            let (_, bytes) = item.map_err(storage_error)?;
            records.push(bincode::deserialize(&bytes)?);
        }

        Ok(records)
    }

    async fn prune_health_records(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;

        for item in self.health.iter() {
            let (key, bytes) = item.map_err(storage_error)?;
            let record: HealthRecord = bincode::deserialize(&bytes)?;
            if record.checked_at < cutoff {
                self.health.remove(key).map_err(storage_error)?;
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "Pruned health records");
        }
        Ok(removed)
    }
}
