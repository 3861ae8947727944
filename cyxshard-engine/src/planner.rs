//! Rebalancing Planner
//!
//! Compares each active shard's load with the fleet average and queues
//! migrations from overloaded shards to underloaded, healthy ones. Only one
//! pass runs at a time; a concurrent request returns immediately.

use crate::config::PlannerConfig;
use crate::executor::MigrationExecutor;
use crate::health::HealthMonitor;
use crate::metrics;
use crate::registry::ShardRegistry;
use cyxshard_core::{Result, Shard, ShardStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Result of a rebalance pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RebalanceReport {
    /// Number of active shards considered
    pub shard_count: usize,
    /// Fleet average load
    pub average_load: f64,
    /// Shards above the upper bound, most loaded first
    pub overloaded: Vec<String>,
    /// Healthy shards below the lower bound, least loaded first
    pub underloaded: Vec<String>,
    /// Migrations queued by this pass
    pub planned: usize,
    /// Load units those migrations move
    pub planned_load: u64,
}

impl RebalanceReport {
    /// Whether the pass queued any work
    pub fn is_noop(&self) -> bool {
        self.planned == 0
    }

    /// Summary string
    pub fn summary(&self) -> String {
        format!(
            "{} shards, avg load {:.1}, {} overloaded, {} underloaded, {} migrations ({} load units)",
            self.shard_count,
            self.average_load,
            self.overloaded.len(),
            self.underloaded.len(),
            self.planned,
            self.planned_load
        )
    }
}

/// Outcome of a rebalance request
#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceOutcome {
    Completed(RebalanceReport),
    /// Another pass was already running
    AlreadyRunning,
}

/// Clears the rebalancing flag on drop, including on early return
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Rebalancing planner
pub struct RebalancingPlanner {
    registry: Arc<ShardRegistry>,
    health: Arc<HealthMonitor>,
    executor: Arc<MigrationExecutor>,
    config: PlannerConfig,
    is_rebalancing: AtomicBool,
}

impl RebalancingPlanner {
    /// Create a new planner
    pub fn new(
        registry: Arc<ShardRegistry>,
        health: Arc<HealthMonitor>,
        executor: Arc<MigrationExecutor>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            registry,
            health,
            executor,
            config,
            is_rebalancing: AtomicBool::new(false),
        }
    }

    /// Whether a pass is currently running
    pub fn is_rebalancing(&self) -> bool {
        self.is_rebalancing.load(Ordering::Acquire)
    }

    /// Run a rebalance pass unless one is already in progress
    pub async fn rebalance(&self) -> Result<RebalanceOutcome> {
        if self
            .is_rebalancing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Rebalance already in progress");
            return Ok(RebalanceOutcome::AlreadyRunning);
        }
        let _guard = PassGuard(&self.is_rebalancing);

        let report = self.run_pass().await?;
        metrics::record_rebalance_pass();
        Ok(RebalanceOutcome::Completed(report))
    }

    #[instrument(skip(self))]
    async fn run_pass(&self) -> Result<RebalanceReport> {
        let shards: Vec<Shard> = self
            .registry
            .refresh()
            .await?
            .into_iter()
            .filter(|s| s.status == ShardStatus::Active)
            .collect();

        let mut report = RebalanceReport {
            shard_count: shards.len(),
            ..Default::default()
        };

        let total: u64 = shards.iter().map(|s| s.load_units).sum();
        if shards.is_empty() || total == 0 {
            debug!("No load to rebalance");
            return Ok(report);
        }

        let avg = total as f64 / shards.len() as f64;
        let t = self.config.threshold;
        report.average_load = avg;

        // Loads as they will be once already-queued migrations drain
        let queued = self.executor.queued_moves().await?;
        let mut projected: HashMap<&str, f64> = shards
            .iter()
            .map(|s| {
                let delta = queued.load_deltas.get(&s.id).copied().unwrap_or(0);
                (s.id.as_str(), (s.load_units as i64 + delta).max(0) as f64)
            })
            .collect();
        let mut open = queued.keys;

        let mut overloaded: Vec<&Shard> = shards
            .iter()
            .filter(|s| projected[s.id.as_str()] > avg * (1.0 + t))
            .collect();
        let mut underloaded: Vec<&Shard> = shards
            .iter()
            .filter(|s| projected[s.id.as_str()] < avg * (1.0 - t))
            .filter(|s| self.health.is_healthy(&s.id))
            .collect();

        overloaded.sort_by(|a, b| {
            projected[b.id.as_str()]
                .total_cmp(&projected[a.id.as_str()])
                .then(a.id.cmp(&b.id))
        });
        underloaded.sort_by(|a, b| {
            projected[a.id.as_str()]
                .total_cmp(&projected[b.id.as_str()])
                .then(a.id.cmp(&b.id))
        });
        report.overloaded = overloaded.iter().map(|s| s.id.clone()).collect();
        report.underloaded = underloaded.iter().map(|s| s.id.clone()).collect();

        if overloaded.is_empty() || underloaded.is_empty() {
            debug!(summary = %report.summary(), "Fleet within threshold");
            return Ok(report);
        }

        let cap = self.config.max_migrations_per_pass;

        'sources: for source in &overloaded {
            for target in &underloaded {
                if report.planned >= cap {
                    break 'sources;
                }

                let source_load = projected[source.id.as_str()];
                let target_load = projected[target.id.as_str()];
                if source_load <= target_load {
                    continue;
                }

                let amount = (source_load - avg).min(avg - target_load).floor();
                if amount < 1.0 {
                    continue;
                }

                let moves = self
                    .executor
                    .plan_migrations(source, target, amount as u64, &open, cap - report.planned)
                    .await?;

                for migration in &moves.migrations {
                    open.insert(migration.key_hash);
                }
                if let Some(load) = projected.get_mut(source.id.as_str()) {
                    *load -= moves.load_units as f64;
                }
                if let Some(load) = projected.get_mut(target.id.as_str()) {
                    *load += moves.load_units as f64;
                }
                report.planned += moves.migrations.len();
                report.planned_load += moves.load_units;
            }
        }

        info!(summary = %report.summary(), "Rebalance pass complete");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorConfig, HealthConfig};
    use crate::health::StoreRoundTripProber;
    use cyxshard_core::{KeyHash, LocalEventBus, MigrationStatus, ShardEvent, ShardMapping};
    use cyxshard_storage::{MemoryStore, ShardStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        health: Arc<HealthMonitor>,
        planner: Arc<RebalancingPlanner>,
    }

    async fn fixture(loads: &[(&str, u64)], config: PlannerConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn ShardStore> = store.clone();
        let bus = Arc::new(LocalEventBus::new());
        let registry = Arc::new(ShardRegistry::new(dyn_store.clone(), bus.clone()));
        let health = Arc::new(HealthMonitor::new(
            dyn_store.clone(),
            registry.clone(),
            bus.clone(),
            Arc::new(StoreRoundTripProber::new(dyn_store.clone(), 1)),
            HealthConfig::default(),
        ));
        let executor = Arc::new(MigrationExecutor::new(
            dyn_store.clone(),
            registry.clone(),
            health.clone(),
            bus,
            ExecutorConfig::default(),
        ));

        for (id, load) in loads {
            store.put_shard(&Shard::with_id(*id, "r", 10_000)).await.unwrap();
            for i in 0..*load {
                let key = format!("{}-{}", id, i);
                store
                    .create_mapping(ShardMapping::new(KeyHash::compute(&key), *id, key))
                    .await
                    .unwrap();
            }
        }

        let planner = Arc::new(RebalancingPlanner::new(
            registry,
            health.clone(),
            executor,
            config,
        ));
        Fixture {
            store,
            health,
            planner,
        }
    }

    fn completed(outcome: RebalanceOutcome) -> RebalanceReport {
        match outcome {
            RebalanceOutcome::Completed(report) => report,
            RebalanceOutcome::AlreadyRunning => panic!("pass unexpectedly skipped"),
        }
    }

    #[tokio::test]
    async fn test_balanced_fleet_is_noop() {
        let f = fixture(&[("a", 10), ("b", 11), ("c", 9)], PlannerConfig::default()).await;
        let report = completed(f.planner.rebalance().await.unwrap());
        assert!(report.is_noop());
        assert!(report.overloaded.is_empty());
    }

    #[tokio::test]
    async fn test_empty_fleet_is_noop() {
        let f = fixture(&[("a", 0), ("b", 0)], PlannerConfig::default()).await;
        let report = completed(f.planner.rebalance().await.unwrap());
        assert!(report.is_noop());
        assert_eq!(report.average_load, 0.0);
    }

    #[tokio::test]
    async fn test_moves_toward_average() {
        let f = fixture(&[("a", 60), ("b", 0), ("c", 0)], PlannerConfig::default()).await;
        let report = completed(f.planner.rebalance().await.unwrap());

        assert_eq!(report.overloaded, vec!["a".to_string()]);
        assert_eq!(report.planned, 40);

        let pending = f
            .store
            .list_migrations(Some(MigrationStatus::Pending), usize::MAX)
            .await
            .unwrap();
        assert!(pending.iter().all(|m| m.source_shard_id == "a"));
        let to_b = pending.iter().filter(|m| m.target_shard_id == "b").count();
        let to_c = pending.iter().filter(|m| m.target_shard_id == "c").count();
        assert_eq!((to_b, to_c), (20, 20));
    }

    #[tokio::test]
    async fn test_unhealthy_underloaded_shard_gets_nothing() {
        let f = fixture(&[("a", 60), ("b", 0), ("c", 0)], PlannerConfig::default()).await;
        f.health.apply_event(&ShardEvent::Health {
            shard_id: "c".to_string(),
            healthy: false,
            latency_ms: 900,
            error_rate: 1.0,
            at: chrono::Utc::now(),
        });

        let report = completed(f.planner.rebalance().await.unwrap());
        assert_eq!(report.underloaded, vec!["b".to_string()]);
        assert_eq!(report.planned, 20);

        let pending = f
            .store
            .list_migrations(Some(MigrationStatus::Pending), usize::MAX)
            .await
            .unwrap();
        assert!(pending.iter().all(|m| m.target_shard_id == "b"));
    }

    #[tokio::test]
    async fn test_second_pass_accounts_for_queued_moves() {
        let f = fixture(&[("a", 60), ("b", 0), ("c", 0)], PlannerConfig::default()).await;
        completed(f.planner.rebalance().await.unwrap());
        let second = completed(f.planner.rebalance().await.unwrap());
        assert!(second.is_noop());

        let pending = f
            .store
            .list_migrations(Some(MigrationStatus::Pending), usize::MAX)
            .await
            .unwrap();
        let mut keys: Vec<KeyHash> = pending.iter().map(|m| m.key_hash).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), pending.len());
    }

    #[tokio::test]
    async fn test_pass_cap() {
        let config = PlannerConfig {
            max_migrations_per_pass: 5,
            ..Default::default()
        };
        let f = fixture(&[("a", 60), ("b", 0), ("c", 0)], config).await;
        let report = completed(f.planner.rebalance().await.unwrap());
        assert_eq!(report.planned, 5);
    }

    #[tokio::test]
    async fn test_single_flight_flag_resets() {
        let f = fixture(&[("a", 1)], PlannerConfig::default()).await;
        assert!(!f.planner.is_rebalancing());
        completed(f.planner.rebalance().await.unwrap());
        assert!(!f.planner.is_rebalancing());

        f.planner.is_rebalancing.store(true, Ordering::Release);
        assert_eq!(
            f.planner.rebalance().await.unwrap(),
            RebalanceOutcome::AlreadyRunning
        );
    }
}
