//! Consistent router
//!
//! Resolves keys to shards. An existing mapping always wins; otherwise a
//! shard is chosen by load-weighted selection driven by the key hash, so the
//! same fleet state always yields the same choice for the same key.

use crate::config::RouterConfig;
use crate::health::HealthMonitor;
use crate::metrics;
use crate::registry::ShardRegistry;
use chrono::Utc;
use cyxshard_core::{
    key_prefix, KeyHash, Result, Shard, ShardError, ShardMapping, MIN_SHARD_WEIGHT,
};
use cyxshard_storage::{MappingInsert, ShardStore};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Reselections allowed when the chosen shard turns out to be unavailable
const MAX_SELECT_ATTEMPTS: usize = 3;

/// Free-capacity fraction of a shard, floored at `MIN_SHARD_WEIGHT`
pub fn free_fraction(shard: &Shard) -> f64 {
    if shard.capacity_units == 0 {
        return MIN_SHARD_WEIGHT;
    }
    (1.0 - shard.load_units as f64 / shard.capacity_units as f64).max(MIN_SHARD_WEIGHT)
}

/// Selection weight: free fraction scaled by capacity
pub fn shard_weight(shard: &Shard) -> f64 {
    shard.capacity_units.max(1) as f64 * free_fraction(shard)
}

/// Pick a shard for a key hash by cumulative weight.
///
/// Candidates are ordered by id; the first whose cumulative normalized
/// weight reaches the hash's uniform value wins, falling back to the last.
pub fn select_shard<'a>(candidates: &'a [Shard], hash: &KeyHash) -> Option<&'a Shard> {
    let mut ordered: Vec<&Shard> = candidates.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));

    let last = *ordered.last()?;
    let total: f64 = ordered.iter().map(|s| shard_weight(s)).sum();
    if total <= 0.0 {
        return Some(last);
    }

    let u = hash.uniform();
    let mut cumulative = 0.0;
    for shard in &ordered {
        cumulative += shard_weight(shard) / total;
        if cumulative >= u {
            return Some(shard);
        }
    }
    Some(last)
}

/// Key router
pub struct ConsistentRouter {
    store: Arc<dyn ShardStore>,
    registry: Arc<ShardRegistry>,
    health: Arc<HealthMonitor>,
    config: RouterConfig,
}

impl ConsistentRouter {
    pub fn new(
        store: Arc<dyn ShardStore>,
        registry: Arc<ShardRegistry>,
        health: Arc<HealthMonitor>,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            registry,
            health,
            config,
        }
    }

    /// Resolve a key to its owning shard, creating the mapping on first use
    #[instrument(skip(self, key), fields(key_len = key.len()))]
    pub async fn resolve(&self, key: &str) -> Result<String> {
        let hash = KeyHash::for_key(key)?;

        match self.resolve_hash(key, hash).await {
            Ok(shard_id) => Ok(shard_id),
            Err(e) => {
                let result = match e {
                    ShardError::NoAvailableShards => "no_shards",
                    ShardError::Validation(_) => "invalid",
                    _ => "error",
                };
                metrics::record_route(result);
                Err(e)
            }
        }
    }

    async fn resolve_hash(&self, key: &str, hash: KeyHash) -> Result<String> {
        if let Some(shard_id) = self.touch(&hash).await? {
            metrics::record_route("hit");
            return Ok(shard_id);
        }

        for attempt in 1..=MAX_SELECT_ATTEMPTS {
            let candidates: Vec<Shard> = self
                .registry
                .active_shards()
                .into_iter()
                .filter(|s| self.health.is_healthy(&s.id))
                .collect();

            let selected =
                select_shard(&candidates, &hash).ok_or(ShardError::NoAvailableShards)?;
            let mapping = ShardMapping::new(hash, selected.id.clone(), key_prefix(key));

            match self.store.create_mapping(mapping).await? {
                MappingInsert::Created { mapping, shard } => {
                    self.registry.observe(&shard);
                    debug!(key_hash = ?hash, shard_id = %mapping.shard_id, "Created mapping");
                    metrics::record_route("miss");
                    return Ok(mapping.shard_id);
                }
                MappingInsert::Existing(mapping) => {
                    // A concurrent resolve created the mapping first; treat as a hit
                    debug!(key_hash = ?hash, shard_id = %mapping.shard_id, "Mapping created concurrently");
                    metrics::record_route("hit");
                    return Ok(self.touch(&hash).await?.unwrap_or(mapping.shard_id));
                }
                MappingInsert::TargetUnavailable(shard) => {
                    debug!(
                        key_hash = ?hash,
                        shard_id = %shard.id,
                        status = %shard.status,
                        attempt,
                        "Selected shard is no longer active; reselecting"
                    );
                    self.registry.observe(&shard);
                    self.registry.refresh().await?;
                }
            }
        }

        warn!(key_hash = ?hash, "Shard selection kept landing on unavailable shards");
        Err(ShardError::NoAvailableShards)
    }

    async fn touch(&self, hash: &KeyHash) -> Result<Option<String>> {
        let update = self
            .store
            .touch_mapping(hash, Utc::now(), self.config.count_repeat_access)
            .await?;

        Ok(update.map(|update| {
            if let Some(shard) = &update.shard {
                self.registry.observe(shard);
            }
            update.mapping.shard_id
        }))
    }

    /// Release one load unit held by a key
    #[instrument(skip(self, key), fields(key_len = key.len()))]
    pub async fn release(&self, key: &str) -> Result<()> {
        let hash = KeyHash::for_key(key)?;

        match self.store.release_mapping(&hash).await? {
            None => debug!(key_hash = ?hash, "Release of unknown key"),
            Some(update) => match update.shard {
                Some(shard) => self.registry.observe(&shard),
                None => debug!(key_hash = ?hash, "Release with no outstanding load"),
            },
        }
        Ok(())
    }

    /// Current owner of a key, without touching counters
    pub async fn lookup(&self, key: &str) -> Result<Option<String>> {
        let hash = KeyHash::for_key(key)?;
        Ok(self.store.get_mapping(&hash).await?.map(|m| m.shard_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::health::StoreRoundTripProber;
    use cyxshard_core::{LocalEventBus, ShardStatus};
    use cyxshard_storage::MemoryStore;
    use proptest::prelude::*;

    fn shard(id: &str, capacity: u64, load: u64) -> Shard {
        let mut shard = Shard::with_id(id, "r", capacity);
        shard.load_units = load;
        shard
    }

    async fn router(config: RouterConfig) -> (ConsistentRouter, Arc<ShardRegistry>) {
        let store: Arc<dyn ShardStore> = Arc::new(MemoryStore::new());
        let bus = Arc::new(LocalEventBus::new());
        let registry = Arc::new(ShardRegistry::new(store.clone(), bus.clone()));
        let prober = Arc::new(StoreRoundTripProber::new(store.clone(), 1));
        let health = Arc::new(HealthMonitor::new(
            store.clone(),
            registry.clone(),
            bus,
            prober,
            HealthConfig::default(),
        ));
        (
            ConsistentRouter::new(store, registry.clone(), health, config),
            registry,
        )
    }

    #[test]
    fn test_free_fraction_floor() {
        assert_eq!(free_fraction(&shard("a", 100, 0)), 1.0);
        assert_eq!(free_fraction(&shard("a", 100, 95)), MIN_SHARD_WEIGHT);
        assert_eq!(free_fraction(&shard("a", 100, 500)), MIN_SHARD_WEIGHT);
        assert_eq!(free_fraction(&shard("a", 0, 0)), MIN_SHARD_WEIGHT);
    }

    #[test]
    fn test_select_empty() {
        assert!(select_shard(&[], &KeyHash::compute("k")).is_none());
    }

    #[test]
    fn test_select_single() {
        let shards = vec![shard("only", 10, 10)];
        let picked = select_shard(&shards, &KeyHash::compute("k")).unwrap();
        assert_eq!(picked.id, "only");
    }

    #[test]
    fn test_select_ignores_input_order() {
        let forward = vec![shard("a", 100, 10), shard("b", 200, 50), shard("c", 100, 0)];
        let mut reversed = forward.clone();
        reversed.reverse();

        for i in 0..200 {
            let hash = KeyHash::compute(&format!("key-{}", i));
            assert_eq!(
                select_shard(&forward, &hash).unwrap().id,
                select_shard(&reversed, &hash).unwrap().id
            );
        }
    }

    proptest! {
        #[test]
        fn prop_selection_deterministic(key in "[a-z0-9]{1,64}", loads in prop::collection::vec(0u64..2000, 1..8)) {
            let shards: Vec<Shard> = loads
                .iter()
                .enumerate()
                .map(|(i, load)| shard(&format!("s{}", i), 1000, *load))
                .collect();
            let hash = KeyHash::compute(&key);

            let first = select_shard(&shards, &hash).map(|s| s.id.clone());
            let second = select_shard(&shards, &hash).map(|s| s.id.clone());
            prop_assert!(first.is_some());
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_selection_returns_candidate(key in ".{1,32}", count in 1usize..10) {
            let shards: Vec<Shard> = (0..count)
                .map(|i| shard(&format!("s{}", i), (i as u64) * 100, 0))
                .collect();
            let picked = select_shard(&shards, &KeyHash::compute(&key)).unwrap();
            prop_assert!(shards.iter().any(|s| s.id == picked.id));
        }
    }

    #[tokio::test]
    async fn test_resolve_creates_then_hits() {
        let (router, registry) = router(RouterConfig::default()).await;
        let shard = registry.add_shard("r", 100).await.unwrap();

        assert_eq!(router.resolve("user:1").await.unwrap(), shard.id);
        assert_eq!(router.resolve("user:1").await.unwrap(), shard.id);

        let cached = registry.get(&shard.id).unwrap();
        assert_eq!((cached.load_units, cached.item_count), (2, 1));
    }

    #[tokio::test]
    async fn test_resolve_without_repeat_counting() {
        let config = RouterConfig {
            count_repeat_access: false,
        };
        let (router, registry) = router(config).await;
        let shard = registry.add_shard("r", 100).await.unwrap();

        router.resolve("k").await.unwrap();
        router.resolve("k").await.unwrap();

        let cached = registry.get(&shard.id).unwrap();
        assert_eq!(cached.load_units, 1);
    }

    #[tokio::test]
    async fn test_resolve_validation() {
        let (router, registry) = router(RouterConfig::default()).await;
        registry.add_shard("r", 100).await.unwrap();

        assert!(matches!(
            router.resolve("").await,
            Err(ShardError::Validation(_))
        ));
        let long = "x".repeat(1025);
        assert!(matches!(
            router.resolve(&long).await,
            Err(ShardError::Validation(_))
        ));
        assert!(matches!(
            router.release("").await,
            Err(ShardError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_without_shards() {
        let (router, _) = router(RouterConfig::default()).await;
        assert!(matches!(
            router.resolve("k").await,
            Err(ShardError::NoAvailableShards)
        ));
    }

    #[tokio::test]
    async fn test_resolve_reselects_when_cached_shard_was_retired() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(LocalEventBus::new());
        let registry = Arc::new(ShardRegistry::new(store.clone(), bus.clone()));
        let prober = Arc::new(StoreRoundTripProber::new(store.clone(), 1));
        let health = Arc::new(HealthMonitor::new(
            store.clone(),
            registry.clone(),
            bus,
            prober,
            HealthConfig::default(),
        ));
        let router = ConsistentRouter::new(
            store.clone(),
            registry.clone(),
            health,
            RouterConfig::default(),
        );

        registry
            .bootstrap(vec![Shard::with_id("a", "r", 100), Shard::with_id("b", "r", 100)])
            .await
            .unwrap();
        // Retired behind the cache's back
        store.set_shard_status("b", ShardStatus::Inactive).await.unwrap();
        assert_eq!(registry.active_shards().len(), 2);

        for i in 0..20 {
            assert_eq!(router.resolve(&format!("k{}", i)).await.unwrap(), "a");
        }
        assert!(store.get_shard("b").await.unwrap().unwrap().is_empty());
        assert!(registry.get("b").is_none());

        store.set_shard_status("a", ShardStatus::Unhealthy).await.unwrap();
        assert!(matches!(
            router.resolve("fresh-key").await,
            Err(ShardError::NoAvailableShards)
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (router, registry) = router(RouterConfig::default()).await;
        let shard = registry.add_shard("r", 100).await.unwrap();

        router.resolve("k").await.unwrap();
        router.release("k").await.unwrap();
        router.release("k").await.unwrap();
        router.release("never-seen").await.unwrap();

        let cached = registry.get(&shard.id).unwrap();
        assert_eq!((cached.load_units, cached.item_count), (0, 1));
        assert_eq!(router.lookup("k").await.unwrap(), Some(shard.id));
        assert_eq!(router.lookup("never-seen").await.unwrap(), None);
    }
}
