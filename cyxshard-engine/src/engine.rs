//! Shard engine facade
//!
//! Wires registry, health monitor, router, planner, executor and scheduler
//! around one store and one event bus, and exposes the routing and
//! administrative operations.

use crate::config::EngineConfig;
use crate::executor::{DrainReport, MigrationExecutor};
use crate::health::{HealthMonitor, HealthSweep, ShardProber, StoreRoundTripProber};
use crate::planner::{RebalanceOutcome, RebalancingPlanner};
use crate::registry::ShardRegistry;
use crate::router::ConsistentRouter;
use crate::scheduler::{
    run_cleanup, CleanupReport, MaintenanceContext, MaintenanceIntervals, MaintenanceScheduler,
};
use crate::timed::TimedStore;
use cyxshard_core::{
    EventBus, HealthRecord, LocalEventBus, Migration, MigrationStat, Result, Shard, ShardStat,
};
use cyxshard_storage::ShardStore;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Health records returned by `get_shard_health`
const HEALTH_HISTORY_LIMIT: usize = 100;

/// Builder for [`ShardEngine`]
pub struct ShardEngineBuilder {
    store: Arc<dyn ShardStore>,
    bus: Option<Arc<dyn EventBus>>,
    prober: Option<Arc<dyn ShardProber>>,
    config: EngineConfig,
}

impl ShardEngineBuilder {
    /// Use a shared event bus (defaults to a private `LocalEventBus`)
    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Use a custom prober (defaults to `StoreRoundTripProber`)
    pub fn prober(mut self, prober: Arc<dyn ShardProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Set configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Assemble the engine; no background work starts until `start()`
    pub fn build(self) -> ShardEngine {
        let config = self.config;
        let store: Arc<dyn ShardStore> =
            Arc::new(TimedStore::new(self.store, config.store_timeout()));
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(LocalEventBus::new()) as Arc<dyn EventBus>);
        let prober = self.prober.unwrap_or_else(|| {
            Arc::new(StoreRoundTripProber::new(
                store.clone(),
                config.health.probe_rounds,
            )) as Arc<dyn ShardProber>
        });

        let registry = Arc::new(ShardRegistry::new(store.clone(), bus.clone()));
        let health = Arc::new(HealthMonitor::new(
            store.clone(),
            registry.clone(),
            bus.clone(),
            prober,
            config.health.clone(),
        ));
        let router = ConsistentRouter::new(
            store.clone(),
            registry.clone(),
            health.clone(),
            config.router.clone(),
        );
        let executor = Arc::new(MigrationExecutor::new(
            store.clone(),
            registry.clone(),
            health.clone(),
            bus.clone(),
            config.executor.clone(),
        ));
        let planner = Arc::new(RebalancingPlanner::new(
            registry.clone(),
            health.clone(),
            executor.clone(),
            config.planner.clone(),
        ));

        let ctx = MaintenanceContext {
            store: store.clone(),
            bus: bus.clone(),
            registry: registry.clone(),
            health: health.clone(),
            planner: planner.clone(),
            executor: executor.clone(),
        };
        let intervals = MaintenanceIntervals {
            stats: config.scheduler.stats_interval(),
            health: config.health.check_interval(),
            rebalance: config.planner.check_interval(),
            drain: config.executor.drain_interval(),
            cleanup: config.scheduler.cleanup_interval(),
        };
        let scheduler = MaintenanceScheduler::new(ctx.clone(), intervals, config.scheduler.clone());

        ShardEngine {
            config,
            store,
            registry,
            health,
            router,
            planner,
            executor,
            ctx,
            scheduler,
        }
    }
}

/// Shard routing and rebalancing engine
pub struct ShardEngine {
    config: EngineConfig,
    store: Arc<dyn ShardStore>,
    registry: Arc<ShardRegistry>,
    health: Arc<HealthMonitor>,
    router: ConsistentRouter,
    planner: Arc<RebalancingPlanner>,
    executor: Arc<MigrationExecutor>,
    ctx: MaintenanceContext,
    scheduler: MaintenanceScheduler,
}

impl ShardEngine {
    /// Start building an engine over a store
    pub fn builder(store: Arc<dyn ShardStore>) -> ShardEngineBuilder {
        ShardEngineBuilder {
            store,
            bus: None,
            prober: None,
            config: EngineConfig::default(),
        }
    }

    /// Engine with default configuration
    pub fn new(store: Arc<dyn ShardStore>) -> Self {
        Self::builder(store).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    // ===== Lifecycle =====

    /// Load shard state from the store
    pub async fn refresh(&self) -> Result<usize> {
        Ok(self.registry.refresh().await?.len())
    }

    /// Load state and start the background tasks
    pub async fn start(&self) -> Result<()> {
        let shards = self.refresh().await?;
        self.scheduler.start();
        info!(shards, "Shard engine started");
        Ok(())
    }

    /// Stop background tasks, letting in-flight ticks finish
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        info!("Shard engine stopped");
    }

    // ===== Routing =====

    /// Resolve a key to its owning shard
    pub async fn resolve(&self, key: &str) -> Result<String> {
        self.router.resolve(key).await
    }

    /// Release one load unit held by a key
    pub async fn release(&self, key: &str) -> Result<()> {
        self.router.release(key).await
    }

    /// Current owner of a key without touching counters
    pub async fn lookup(&self, key: &str) -> Result<Option<String>> {
        self.router.lookup(key).await
    }

    // ===== Shards =====

    /// Register a new shard
    pub async fn add_shard(&self, region: &str, capacity_units: u64) -> Result<Shard> {
        self.registry.add_shard(region, capacity_units).await
    }

    /// Register shards unknown to the store
    pub async fn bootstrap_shards(&self, shards: Vec<Shard>) -> Result<usize> {
        self.registry.bootstrap(shards).await
    }

    /// Retire an empty shard
    pub async fn remove_shard(&self, id: &str) -> Result<Shard> {
        let shard = self.registry.remove_shard(id).await?;
        self.health.forget(id);
        Ok(shard)
    }

    /// Per-shard statistics, fresh from the store
    pub async fn get_shard_stats(&self) -> Result<Vec<ShardStat>> {
        let shards = self.store.list_shards(None).await?;
        Ok(shards
            .into_iter()
            .map(|shard| {
                let latest = self.health.latest(&shard.id);
                ShardStat {
                    utilization: shard.utilization(),
                    healthy: latest.as_ref().map_or(true, |r| r.healthy),
                    last_latency_ms: latest.map(|r| r.latency_ms),
                    shard_id: shard.id,
                    region: shard.region,
                    status: shard.status,
                    capacity_units: shard.capacity_units,
                    load_units: shard.load_units,
                    item_count: shard.item_count,
                }
            })
            .collect())
    }

    /// Health history of a shard, newest first
    pub async fn get_shard_health(&self, shard_id: &str) -> Result<Vec<HealthRecord>> {
        self.store
            .health_records(shard_id, HEALTH_HISTORY_LIMIT)
            .await
    }

    // ===== Migrations =====

    /// Migration counts grouped by source, target and status
    pub async fn get_migration_stats(&self) -> Result<Vec<MigrationStat>> {
        self.executor.migration_stats().await
    }

    /// Failed migrations, oldest first
    pub async fn failed_migrations(&self, limit: usize) -> Result<Vec<Migration>> {
        self.executor.failed_migrations(limit).await
    }

    /// Re-queue a failed migration
    pub async fn retry_failed_migration(&self, id: Uuid) -> Result<Migration> {
        self.executor.retry_failed(id).await
    }

    // ===== Maintenance =====

    /// Run a rebalance pass now
    pub async fn rebalance_now(&self) -> Result<RebalanceOutcome> {
        self.planner.rebalance().await
    }

    /// Drain one migration batch now
    pub async fn drain_migrations_now(&self) -> Result<DrainReport> {
        self.executor.drain().await
    }

    /// Probe every shard now
    pub async fn check_health_now(&self) -> Result<HealthSweep> {
        self.health.check_all().await
    }

    /// Run stale-mapping cleanup now
    pub async fn cleanup_now(&self) -> Result<CleanupReport> {
        run_cleanup(&self.ctx, &self.config.scheduler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyxshard_core::{ShardError, ShardStatus};
    use cyxshard_storage::MemoryStore;

    #[tokio::test]
    async fn test_engine_round_trip() {
        let engine = ShardEngine::new(Arc::new(MemoryStore::new()));
        let shard = engine.add_shard("eu-west", 100).await.unwrap();

        let owner = engine.resolve("user:42").await.unwrap();
        assert_eq!(owner, shard.id);
        assert_eq!(engine.lookup("user:42").await.unwrap(), Some(owner));

        let stats = engine.get_shard_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].load_units, 1);
        assert!(stats[0].healthy);
        assert_eq!(stats[0].last_latency_ms, None);

        engine.release("user:42").await.unwrap();
        let stats = engine.get_shard_stats().await.unwrap();
        assert_eq!(stats[0].load_units, 0);
        assert_eq!(stats[0].item_count, 1);
    }

    #[tokio::test]
    async fn test_check_health_now_records_history() {
        let engine = ShardEngine::new(Arc::new(MemoryStore::new()));
        let shard = engine.add_shard("r", 10).await.unwrap();

        let sweep = engine.check_health_now().await.unwrap();
        assert_eq!(sweep.checked, 1);
        assert_eq!(sweep.healthy, 1);

        let history = engine.get_shard_health(&shard.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].healthy);

        let stats = engine.get_shard_stats().await.unwrap();
        assert!(stats[0].last_latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_remove_shard_flow() {
        let engine = ShardEngine::new(Arc::new(MemoryStore::new()));
        let shard = engine.add_shard("r", 10).await.unwrap();
        engine.resolve("k").await.unwrap();

        assert!(matches!(
            engine.remove_shard(&shard.id).await,
            Err(ShardError::ShardNotEmpty { .. })
        ));

        engine.release("k").await.unwrap();
        // The mapping still counts as an item
        assert!(engine.remove_shard(&shard.id).await.is_err());

        let stats = engine.get_shard_stats().await.unwrap();
        assert_eq!(stats[0].status, ShardStatus::Active);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let engine = ShardEngine::new(Arc::new(MemoryStore::new()));
        engine
            .bootstrap_shards(vec![Shard::with_id("a", "r", 10)])
            .await
            .unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.resolve("k").await.unwrap(), "a");
        engine.shutdown().await;
    }
}
