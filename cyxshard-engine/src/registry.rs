//! Shard registry
//!
//! Durable shard records plus an advisory in-memory cache. The cache holds
//! every non-inactive shard; it is replaced wholesale by `refresh()` and
//! patched with each row the store hands back after a mutation.

use crate::metrics;
use cyxshard_core::{EventBus, Result, Shard, ShardError, ShardEvent, ShardStatus};
use cyxshard_storage::ShardStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Registry of shards
pub struct ShardRegistry {
    store: Arc<dyn ShardStore>,
    bus: Arc<dyn EventBus>,
    cache: RwLock<HashMap<String, Shard>>,
}

impl ShardRegistry {
    /// Create a registry with an empty cache
    pub fn new(store: Arc<dyn ShardStore>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            store,
            bus,
            cache: RwLock::new(HashMap::new()),
        }
    }

    // ===== Cache =====

    /// Reload the cache from the store; returns the non-inactive shards
    pub async fn refresh(&self) -> Result<Vec<Shard>> {
        let shards: Vec<Shard> = self
            .store
            .list_shards(None)
            .await?
            .into_iter()
            .filter(|s| s.status != ShardStatus::Inactive)
            .collect();

        let mut cache = self.cache.write();
        cache.clear();
        for shard in &shards {
            cache.insert(shard.id.clone(), shard.clone());
        }
        Ok(shards)
    }

    /// Write back a row returned by the store
    pub fn observe(&self, shard: &Shard) {
        let mut cache = self.cache.write();
        if shard.status == ShardStatus::Inactive {
            cache.remove(&shard.id);
        } else {
            cache.insert(shard.id.clone(), shard.clone());
        }
    }

    /// Apply a `shard:load` event from the bus
    pub fn apply_event(&self, event: &ShardEvent) {
        if let ShardEvent::Load {
            shard_id,
            load_units,
            item_count,
            at,
        } = event
        {
            let mut cache = self.cache.write();
            if let Some(shard) = cache.get_mut(shard_id) {
                // Ignore events older than what we already hold
                if *at >= shard.updated_at {
                    shard.load_units = *load_units;
                    shard.item_count = *item_count;
                    shard.updated_at = *at;
                }
            }
        }
    }

    /// Cached shard by id
    pub fn get(&self, id: &str) -> Option<Shard> {
        self.cache.read().get(id).cloned()
    }

    /// Cached active shards, sorted by id
    pub fn active_shards(&self) -> Vec<Shard> {
        let mut shards: Vec<Shard> = self
            .cache
            .read()
            .values()
            .filter(|s| s.status == ShardStatus::Active)
            .cloned()
            .collect();
        shards.sort_by(|a, b| a.id.cmp(&b.id));
        shards
    }

    /// All cached shards, sorted by id
    pub fn cached_shards(&self) -> Vec<Shard> {
        let mut shards: Vec<Shard> = self.cache.read().values().cloned().collect();
        shards.sort_by(|a, b| a.id.cmp(&b.id));
        shards
    }

    /// Publish a `shard:load` event stamped with the row's own timestamp
    pub fn publish_load(&self, shard: &Shard) {
        metrics::set_shard_load(&shard.id, shard.load_units);
        self.bus.publish(ShardEvent::Load {
            shard_id: shard.id.clone(),
            load_units: shard.load_units,
            item_count: shard.item_count,
            at: shard.updated_at,
        });
    }

    // ===== Lifecycle =====

    /// Register a new active shard with zero load
    #[instrument(skip(self))]
    pub async fn add_shard(&self, region: &str, capacity_units: u64) -> Result<Shard> {
        if region.trim().is_empty() {
            return Err(ShardError::Validation("region must not be empty".into()));
        }
        if capacity_units == 0 {
            return Err(ShardError::Validation("capacity must be positive".into()));
        }

        let shard = Shard::new(region, capacity_units);
        self.store.put_shard(&shard).await?;
        self.observe(&shard);

        info!(shard_id = %shard.id, region, capacity_units, "Shard added");
        Ok(shard)
    }

    /// Register shards that are not yet known to the store
    pub async fn bootstrap(&self, shards: Vec<Shard>) -> Result<usize> {
        let mut added = 0;
        for shard in shards {
            if self.store.get_shard(&shard.id).await?.is_some() {
                debug!(shard_id = %shard.id, "Bootstrap shard already registered");
                continue;
            }
            self.store.put_shard(&shard).await?;
            self.observe(&shard);
            added += 1;
        }

        if added > 0 {
            info!(added, "Bootstrapped shards");
        }
        Ok(added)
    }

    /// Mark a shard inactive; refused while it still holds load or items
    #[instrument(skip(self))]
    pub async fn remove_shard(&self, id: &str) -> Result<Shard> {
        let shard = self.store.set_shard_status(id, ShardStatus::Inactive).await?;
        self.cache.write().remove(id);

        info!(shard_id = %id, "Shard removed");
        Ok(shard)
    }

    /// Move a shard from `expected` to `status`; `None` when the stored
    /// status no longer matches and nothing was written
    pub async fn transition_status(
        &self,
        id: &str,
        expected: ShardStatus,
        status: ShardStatus,
    ) -> Result<Option<Shard>> {
        let shard = self
            .store
            .transition_shard_status(id, expected, status)
            .await?;
        if let Some(shard) = &shard {
            self.observe(shard);
        }
        Ok(shard)
    }

    /// Fresh shard row from the store
    pub async fn get_shard(&self, id: &str) -> Result<Option<Shard>> {
        self.store.get_shard(id).await
    }

    // ===== Counters =====

    pub async fn increment_load(&self, id: &str, units: u64) -> Result<Shard> {
        self.adjust(id, units as i64, 0).await
    }

    pub async fn decrement_load(&self, id: &str, units: u64) -> Result<Shard> {
        self.adjust(id, -(units as i64), 0).await
    }

    pub async fn increment_item_count(&self, id: &str, items: u64) -> Result<Shard> {
        self.adjust(id, 0, items as i64).await
    }

    async fn adjust(&self, id: &str, load_delta: i64, item_delta: i64) -> Result<Shard> {
        let shard = self.store.adjust_shard(id, load_delta, item_delta).await?;
        self.observe(&shard);
        Ok(shard)
    }
}
