//! Store wrapper that bounds every call with a timeout
//!
//! A call that exceeds the limit fails with `StoreUnavailable`, which the
//! router surfaces to callers and the executor treats as a retryable failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cyxshard_core::{
    HealthRecord, KeyHash, Migration, MigrationStatus, Result, Shard, ShardError, ShardMapping,
    ShardStatus,
};
use cyxshard_storage::{LruCursor, MappingInsert, MappingUpdate, ReassignOutcome, ShardStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

/// `ShardStore` decorator applying a per-call timeout
pub struct TimedStore {
    inner: Arc<dyn ShardStore>,
    limit: Duration,
}

impl TimedStore {
    pub fn new(inner: Arc<dyn ShardStore>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        match timeout(self.limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, limit = ?self.limit, "Store call timed out");
                Err(ShardError::StoreUnavailable(format!(
                    "{} timed out after {:?}",
                    op, self.limit
                )))
            }
        }
    }
}

#[async_trait]
impl ShardStore for TimedStore {
    async fn put_shard(&self, shard: &Shard) -> Result<()> {
        self.bounded("put_shard", self.inner.put_shard(shard)).await
    }

    async fn get_shard(&self, id: &str) -> Result<Option<Shard>> {
        self.bounded("get_shard", self.inner.get_shard(id)).await
    }

    async fn list_shards(&self, status: Option<ShardStatus>) -> Result<Vec<Shard>> {
        self.bounded("list_shards", self.inner.list_shards(status))
            .await
    }

    async fn adjust_shard(&self, id: &str, load_delta: i64, item_delta: i64) -> Result<Shard> {
        self.bounded(
            "adjust_shard",
            self.inner.adjust_shard(id, load_delta, item_delta),
        )
        .await
    }

    async fn set_shard_status(&self, id: &str, status: ShardStatus) -> Result<Shard> {
        self.bounded("set_shard_status", self.inner.set_shard_status(id, status))
            .await
    }

    async fn transition_shard_status(
        &self,
        id: &str,
        expected: ShardStatus,
        status: ShardStatus,
    ) -> Result<Option<Shard>> {
        self.bounded(
            "transition_shard_status",
            self.inner.transition_shard_status(id, expected, status),
        )
        .await
    }

    async fn get_mapping(&self, key_hash: &KeyHash) -> Result<Option<ShardMapping>> {
        self.bounded("get_mapping", self.inner.get_mapping(key_hash))
            .await
    }

    async fn create_mapping(&self, mapping: ShardMapping) -> Result<MappingInsert> {
        self.bounded("create_mapping", self.inner.create_mapping(mapping))
            .await
    }

    async fn touch_mapping(
        &self,
        key_hash: &KeyHash,
        at: DateTime<Utc>,
        add_load: bool,
    ) -> Result<Option<MappingUpdate>> {
        self.bounded(
            "touch_mapping",
            self.inner.touch_mapping(key_hash, at, add_load),
        )
        .await
    }

    async fn release_mapping(&self, key_hash: &KeyHash) -> Result<Option<MappingUpdate>> {
        self.bounded("release_mapping", self.inner.release_mapping(key_hash))
            .await
    }

    async fn reassign_mapping(
        &self,
        key_hash: &KeyHash,
        source: &str,
        target: &str,
    ) -> Result<ReassignOutcome> {
        self.bounded(
            "reassign_mapping",
            self.inner.reassign_mapping(key_hash, source, target),
        )
        .await
    }

    async fn mappings_for_shard(
        &self,
        shard_id: &str,
        after: Option<LruCursor>,
        limit: usize,
    ) -> Result<Vec<ShardMapping>> {
        self.bounded(
            "mappings_for_shard",
            self.inner.mappings_for_shard(shard_id, after, limit),
        )
        .await
    }

    async fn delete_stale_mappings(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize> {
        self.bounded(
            "delete_stale_mappings",
            self.inner.delete_stale_mappings(cutoff, limit),
        )
        .await
    }

    async fn put_migration(&self, migration: &Migration) -> Result<()> {
        self.bounded("put_migration", self.inner.put_migration(migration))
            .await
    }

    async fn get_migration(&self, id: Uuid) -> Result<Option<Migration>> {
        self.bounded("get_migration", self.inner.get_migration(id))
            .await
    }

    async fn list_migrations(
        &self,
        status: Option<MigrationStatus>,
        limit: usize,
    ) -> Result<Vec<Migration>> {
        self.bounded("list_migrations", self.inner.list_migrations(status, limit))
            .await
    }

    async fn append_health_record(&self, record: &HealthRecord) -> Result<()> {
        self.bounded(
            "append_health_record",
            self.inner.append_health_record(record),
        )
        .await
    }

    async fn health_records(&self, shard_id: &str, limit: usize) -> Result<Vec<HealthRecord>> {
        self.bounded("health_records", self.inner.health_records(shard_id, limit))
            .await
    }

    async fn prune_health_records(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.bounded(
            "prune_health_records",
            self.inner.prune_health_records(cutoff),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyxshard_storage::MemoryStore;

    #[tokio::test]
    async fn test_passes_through_fast_calls() {
        let memory = Arc::new(MemoryStore::new());
        let store = TimedStore::new(memory, Duration::from_secs(1));

        store.put_shard(&Shard::with_id("a", "r", 10)).await.unwrap();
        assert!(store.get_shard("a").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_becomes_store_unavailable() {
        let memory = Arc::new(MemoryStore::new());
        memory.set_delay(Some(Duration::from_secs(10)));
        let store = TimedStore::new(memory, Duration::from_millis(100));

        let result = store.get_shard("a").await;
        assert!(matches!(result, Err(ShardError::StoreUnavailable(_))));
    }
}
