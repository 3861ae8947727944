//! Maintenance Scheduler
//!
//! Runs the engine's background work as independent tokio tasks, each with
//! its own interval and a shared cancellation token:
//! - stats refresh (reload shard cache, publish `shard:load`)
//! - health checks
//! - rebalance evaluation
//! - migration draining
//! - stale-mapping cleanup and health-record pruning
//! - event listener applying `shard:load` / `shard:health` to local caches
//!
//! A failing tick is logged and never stops the other tasks. A tick that has
//! started always runs to completion before its task observes shutdown.

use crate::config::SchedulerConfig;
use crate::executor::MigrationExecutor;
use crate::health::HealthMonitor;
use crate::planner::{RebalanceOutcome, RebalancingPlanner};
use crate::registry::ShardRegistry;
use chrono::Utc;
use cyxshard_core::{EventBus, Result, Topic};
use cyxshard_storage::ShardStore;
use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Subscription id used on the event bus
const LISTENER_ID: &str = "maintenance-scheduler";

/// Result of a cleanup run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupReport {
    pub mappings_deleted: usize,
    pub health_records_pruned: usize,
}

impl CleanupReport {
    /// Summary string
    pub fn summary(&self) -> String {
        format!(
            "{} stale mappings deleted, {} health records pruned",
            self.mappings_deleted, self.health_records_pruned
        )
    }
}

/// Components the scheduled tasks drive
#[derive(Clone)]
pub struct MaintenanceContext {
    pub store: Arc<dyn ShardStore>,
    pub bus: Arc<dyn EventBus>,
    pub registry: Arc<ShardRegistry>,
    pub health: Arc<HealthMonitor>,
    pub planner: Arc<RebalancingPlanner>,
    pub executor: Arc<MigrationExecutor>,
}

/// Interval settings for every task
#[derive(Debug, Clone)]
pub struct MaintenanceIntervals {
    pub stats: Duration,
    pub health: Duration,
    pub rebalance: Duration,
    pub drain: Duration,
    pub cleanup: Duration,
}

/// Background task supervisor
pub struct MaintenanceScheduler {
    ctx: MaintenanceContext,
    intervals: MaintenanceIntervals,
    config: SchedulerConfig,
    /// Replaced on every start; a cancelled token is never reused
    token: Mutex<CancellationToken>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    pub fn new(
        ctx: MaintenanceContext,
        intervals: MaintenanceIntervals,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ctx,
            intervals,
            config,
            token: Mutex::new(CancellationToken::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Whether the tasks are running
    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    /// Spawn all tasks; a second call while running is a no-op, a call
    /// after `shutdown()` starts a fresh set of tasks
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            warn!("Maintenance scheduler already running");
            return;
        }

        let token = CancellationToken::new();
        *self.token.lock() = token.clone();

        info!(
            stats = ?self.intervals.stats,
            health = ?self.intervals.health,
            rebalance = ?self.intervals.rebalance,
            drain = ?self.intervals.drain,
            cleanup = ?self.intervals.cleanup,
            "Starting maintenance scheduler"
        );

        let ctx = self.ctx.clone();
        handles.push(self.spawn_periodic(&token, "stats", self.intervals.stats, move || {
            let ctx = ctx.clone();
            async move { refresh_stats(&ctx).await.map(|_| ()) }
        }));

        let ctx = self.ctx.clone();
        handles.push(self.spawn_periodic(&token, "health", self.intervals.health, move || {
            let ctx = ctx.clone();
            async move { ctx.health.check_all().await.map(|_| ()) }
        }));

        let ctx = self.ctx.clone();
        handles.push(
            self.spawn_periodic(&token, "rebalance", self.intervals.rebalance, move || {
                let ctx = ctx.clone();
                async move {
                    if let RebalanceOutcome::AlreadyRunning = ctx.planner.rebalance().await? {
                        debug!("Skipped rebalance tick: pass already running");
                    }
                    Ok(())
                }
            }),
        );

        let ctx = self.ctx.clone();
        handles.push(self.spawn_periodic(&token, "drain", self.intervals.drain, move || {
            let ctx = ctx.clone();
            async move { ctx.executor.drain().await.map(|_| ()) }
        }));

        let ctx = self.ctx.clone();
        let config = self.config.clone();
        handles.push(
            self.spawn_periodic(&token, "cleanup", self.intervals.cleanup, move || {
                let ctx = ctx.clone();
                let config = config.clone();
                async move { run_cleanup(&ctx, &config).await.map(|_| ()) }
            }),
        );

        handles.push(self.spawn_listener(&token));
    }

    /// Cancel every task and wait for in-flight ticks to finish
    pub async fn shutdown(&self) {
        self.token.lock().cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Maintenance task panicked");
            }
        }
        info!("Maintenance scheduler stopped");
    }

    fn spawn_periodic<F, Fut>(
        &self,
        token: &CancellationToken,
        name: &'static str,
        period: Duration,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let token = token.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = tick().await {
                            error!(task = name, error = %e, "Maintenance tick failed");
                        }
                    }
                }
            }
            debug!(task = name, "Maintenance task stopped");
        })
    }

    fn spawn_listener(&self, token: &CancellationToken) -> JoinHandle<()> {
        let token = token.clone();
        let ctx = self.ctx.clone();
        let mut load_rx = ctx.bus.subscribe(Topic::ShardLoad, LISTENER_ID);
        let mut health_rx = ctx.bus.subscribe(Topic::ShardHealth, LISTENER_ID);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    Some(event) = load_rx.recv() => ctx.registry.apply_event(&event),
                    Some(event) = health_rx.recv() => ctx.health.apply_event(&event),
                    else => break,
                }
            }

            ctx.bus.unsubscribe(Topic::ShardLoad, LISTENER_ID);
            ctx.bus.unsubscribe(Topic::ShardHealth, LISTENER_ID);
            debug!("Event listener stopped");
        })
    }
}

/// Reload the shard cache and publish every shard's load
pub async fn refresh_stats(ctx: &MaintenanceContext) -> Result<usize> {
    let shards = ctx.registry.refresh().await?;
    for shard in &shards {
        ctx.registry.publish_load(shard);
    }
    debug!(shards = shards.len(), "Shard stats refreshed");
    Ok(shards.len())
}

/// Delete stale mappings and prune old health records
pub async fn run_cleanup(ctx: &MaintenanceContext, config: &SchedulerConfig) -> Result<CleanupReport> {
    let now = Utc::now();
    let mapping_cutoff = now - config.mapping_retention();
    let health_cutoff = now - config.health_retention();
    let batch = config.cleanup_batch_size.max(1);

    let mut report = CleanupReport::default();
    loop {
        let deleted = ctx.store.delete_stale_mappings(mapping_cutoff, batch).await?;
        report.mappings_deleted += deleted;
        if deleted < batch {
            break;
        }
    }
    report.health_records_pruned = ctx.store.prune_health_records(health_cutoff).await?;

    if report.mappings_deleted > 0 {
        // Counters changed under the cache
        refresh_stats(ctx).await?;
    }

    info!(summary = %report.summary(), "Cleanup complete");
    Ok(report)
}
