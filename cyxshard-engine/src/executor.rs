//! Migration Executor
//!
//! Drains the migration queue in bounded batches:
//! - oldest pending migrations first (plus stalled `processing` ones)
//! - target re-checked for `active` + healthy before every move
//! - mapping reassignment and counter move as one atomic store call
//! - bounded retries, then `failed` with a `migration:failed` event
//!
//! Also owns the planning step the rebalancer uses to pick mappings to move.

use crate::config::ExecutorConfig;
use crate::health::HealthMonitor;
use crate::metrics;
use crate::registry::ShardRegistry;
use chrono::{DateTime, Utc};
use cyxshard_core::{
    EventBus, KeyHash, Migration, MigrationStat, MigrationStatus, Result, Shard, ShardError,
    ShardEvent, ShardStatus,
};
use cyxshard_storage::{LruCursor, ReassignOutcome, ShardStore};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Mappings read per page while planning
const PLAN_PAGE_SIZE: usize = 256;

/// Result of one drain
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainReport {
    /// Migrations picked up
    pub processed: usize,
    /// Migrations completed (including no-op completions)
    pub completed: usize,
    /// Migrations sent back to `pending`
    pub retried: usize,
    /// Migrations marked `failed`
    pub failed: usize,
}

impl DrainReport {
    /// Summary string
    pub fn summary(&self) -> String {
        format!(
            "{} processed, {} completed, {} retried, {} failed",
            self.processed, self.completed, self.retried, self.failed
        )
    }
}

/// Migrations planned for one source/target pair
#[derive(Debug, Default, Clone)]
pub struct PlannedMoves {
    pub migrations: Vec<Migration>,
    /// Load units those migrations will move
    pub load_units: u64,
}

/// Migrations already queued
#[derive(Debug, Default, Clone)]
pub struct QueuedMoves {
    /// Keys with a pending or processing migration
    pub keys: HashSet<KeyHash>,
    /// Net load each shard gains (or loses) once the queue drains
    pub load_deltas: HashMap<String, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Completed,
    Retried,
    Failed,
}

enum Failure {
    /// Worth another attempt
    Retryable(String),
    /// Will never succeed
    Permanent(String),
}

impl From<ShardError> for Failure {
    fn from(err: ShardError) -> Self {
        if err.is_retryable() {
            Failure::Retryable(err.to_string())
        } else {
            Failure::Permanent(err.to_string())
        }
    }
}

/// Clears a single-flight flag on drop
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Migration executor
pub struct MigrationExecutor {
    store: Arc<dyn ShardStore>,
    registry: Arc<ShardRegistry>,
    health: Arc<HealthMonitor>,
    bus: Arc<dyn EventBus>,
    config: ExecutorConfig,
    draining: AtomicBool,
}

impl MigrationExecutor {
    /// Create a new executor
    pub fn new(
        store: Arc<dyn ShardStore>,
        registry: Arc<ShardRegistry>,
        health: Arc<HealthMonitor>,
        bus: Arc<dyn EventBus>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            health,
            bus,
            config,
            draining: AtomicBool::new(false),
        }
    }

    // ===== Planning =====

    /// Enqueue migrations for `source`'s least recently accessed mappings
    /// whose load sums to at most `amount`.
    ///
    /// Keys in `exclude` (already queued) and mappings holding no load are
    /// skipped; at most `max_migrations` are created.
    #[instrument(skip(self, source, target, exclude), fields(source_id = %source.id, target_id = %target.id))]
    pub async fn plan_migrations(
        &self,
        source: &Shard,
        target: &Shard,
        amount: u64,
        exclude: &HashSet<KeyHash>,
        max_migrations: usize,
    ) -> Result<PlannedMoves> {
        let mut planned = PlannedMoves::default();
        if amount == 0 || max_migrations == 0 {
            return Ok(planned);
        }

        let mut cursor: Option<LruCursor> = None;
        'pages: loop {
            let page = self
                .store
                .mappings_for_shard(&source.id, cursor, PLAN_PAGE_SIZE)
                .await?;
            let exhausted = page.len() < PLAN_PAGE_SIZE;
            cursor = page.last().map(|m| (m.last_accessed_at, m.key_hash));

            for mapping in page {
                if planned.migrations.len() >= max_migrations || planned.load_units >= amount {
                    break 'pages;
                }
                if mapping.load_units == 0 || exclude.contains(&mapping.key_hash) {
                    continue;
                }
                if planned.load_units + mapping.load_units > amount {
                    continue;
                }

                let migration = Migration::new(&source.id, &target.id, mapping.key_hash);
                self.store.put_migration(&migration).await?;
                metrics::record_migration("planned");

                planned.load_units += mapping.load_units;
                planned.migrations.push(migration);
            }

            if exhausted {
                break;
            }
        }

        debug!(
            planned = planned.migrations.len(),
            load_units = planned.load_units,
            amount,
            "Planned migrations"
        );
        Ok(planned)
    }

    /// Pending and processing migrations with the load they will move
    pub async fn queued_moves(&self) -> Result<QueuedMoves> {
        let mut queued = QueuedMoves::default();
        let open = self
            .store
            .list_migrations(None, usize::MAX)
            .await?
            .into_iter()
            .filter(Migration::is_open);

        for migration in open {
            if !queued.keys.insert(migration.key_hash) {
                continue;
            }
            let Some(mapping) = self.store.get_mapping(&migration.key_hash).await? else {
                continue;
            };
            if mapping.shard_id != migration.source_shard_id {
                continue;
            }

            let load = mapping.load_units as i64;
            *queued
                .load_deltas
                .entry(migration.source_shard_id)
                .or_default() -= load;
            *queued
                .load_deltas
                .entry(migration.target_shard_id)
                .or_default() += load;
        }
        Ok(queued)
    }

    // ===== Draining =====

    /// Process one batch of queued migrations.
    ///
    /// A drain already in progress makes this return an empty report.
    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already in progress");
            return Ok(DrainReport::default());
        }
        let _guard = FlightGuard(&self.draining);

        let batch = self.next_batch().await?;
        let mut report = DrainReport::default();

        for migration in batch {
            report.processed += 1;
            match self.process(migration).await {
                Disposition::Completed => report.completed += 1,
                Disposition::Retried => report.retried += 1,
                Disposition::Failed => report.failed += 1,
            }
        }

        if report.processed > 0 {
            info!(summary = %report.summary(), "Migration batch drained");
        }
        Ok(report)
    }

    async fn next_batch(&self) -> Result<Vec<Migration>> {
        let limit = self.config.batch_size;
        let stall_cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stall_timeout())
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let mut batch: Vec<Migration> = self
            .store
            .list_migrations(Some(MigrationStatus::Processing), usize::MAX)
            .await?
            .into_iter()
            .filter(|m| m.started_at.map_or(true, |at| at < stall_cutoff))
            .take(limit)
            .collect();

        for migration in &batch {
            warn!(migration_id = %migration.id, "Resuming stalled migration");
        }

        let remaining = limit.saturating_sub(batch.len());
        if remaining > 0 {
            batch.extend(
                self.store
                    .list_migrations(Some(MigrationStatus::Pending), remaining)
                    .await?,
            );
        }
        batch.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(batch)
    }

    async fn process(&self, mut migration: Migration) -> Disposition {
        migration.status = MigrationStatus::Processing;
        migration.started_at = Some(Utc::now());
        if let Err(e) = self.store.put_migration(&migration).await {
            return self.record_failure(migration, e.into()).await;
        }

        match self.apply(&migration).await {
            Ok(()) => self.complete(migration).await,
            Err(failure) => self.record_failure(migration, failure).await,
        }
    }

    async fn apply(&self, migration: &Migration) -> std::result::Result<(), Failure> {
        let target = self
            .store
            .get_shard(&migration.target_shard_id)
            .await?
            .ok_or_else(|| {
                Failure::Retryable(format!(
                    "target shard {} not found",
                    migration.target_shard_id
                ))
            })?;

        if target.status != ShardStatus::Active || !self.health.is_healthy(&target.id) {
            return Err(Failure::Retryable(format!(
                "target shard {} is {} and not accepting migrations",
                target.id,
                if target.status == ShardStatus::Active {
                    "unhealthy".to_string()
                } else {
                    target.status.to_string()
                }
            )));
        }

        let outcome = self
            .store
            .reassign_mapping(
                &migration.key_hash,
                &migration.source_shard_id,
                &migration.target_shard_id,
            )
            .await?;

        match outcome {
            ReassignOutcome::Moved {
                source,
                target,
                load_units,
            } => {
                self.registry.observe(&source);
                self.registry.observe(&target);
                self.registry.publish_load(&source);
                self.registry.publish_load(&target);
                debug!(
                    migration_id = %migration.id,
                    load_units,
                    "Mapping reassigned"
                );
                Ok(())
            }
            ReassignOutcome::AlreadyOnTarget => {
                debug!(migration_id = %migration.id, "Mapping already on target");
                Ok(())
            }
            ReassignOutcome::MappingMissing => {
                debug!(migration_id = %migration.id, "Mapping no longer exists");
                Ok(())
            }
            ReassignOutcome::OwnerChanged { current_shard_id } => Err(Failure::Permanent(
                format!("owner changed: mapping now on {}", current_shard_id),
            )),
        }
    }

    async fn complete(&self, mut migration: Migration) -> Disposition {
        migration.status = MigrationStatus::Completed;
        migration.completed_at = Some(Utc::now());

        if let Err(e) = self.store.put_migration(&migration).await {
            // The move itself is durable; a re-run completes as a no-op
            warn!(migration_id = %migration.id, error = %e, "Failed to record completion");
            return Disposition::Retried;
        }

        metrics::record_migration("completed");
        Disposition::Completed
    }

    async fn record_failure(&self, mut migration: Migration, failure: Failure) -> Disposition {
        migration.retry_count += 1;

        let (reason, permanent) = match failure {
            Failure::Retryable(reason) => (reason, false),
            Failure::Permanent(reason) => (reason, true),
        };

        if !permanent && migration.retry_count < self.config.max_attempts {
            migration.status = MigrationStatus::Pending;
            migration.started_at = None;
            migration.error_message = Some(reason.clone());

            warn!(
                migration_id = %migration.id,
                attempt = migration.retry_count,
                error = %reason,
                "Migration attempt failed, will retry"
            );
            if let Err(e) = self.store.put_migration(&migration).await {
                error!(migration_id = %migration.id, error = %e, "Failed to requeue migration");
            }
            metrics::record_migration("retried");
            return Disposition::Retried;
        }

        let err = if permanent {
            reason.clone()
        } else {
            ShardError::MigrationRetryExhausted {
                migration_id: migration.id.to_string(),
                attempts: migration.retry_count,
                last_error: reason.clone(),
            }
            .to_string()
        };

        migration.status = MigrationStatus::Failed;
        migration.completed_at = Some(Utc::now());
        migration.error_message = Some(err.clone());

        error!(
            migration_id = %migration.id,
            source = %migration.source_shard_id,
            target = %migration.target_shard_id,
            attempts = migration.retry_count,
            error = %err,
            "Migration failed"
        );
        if let Err(e) = self.store.put_migration(&migration).await {
            error!(migration_id = %migration.id, error = %e, "Failed to record migration failure");
        }

        self.bus.publish(ShardEvent::MigrationFailed {
            migration_id: migration.id.to_string(),
            source_shard_id: migration.source_shard_id.clone(),
            target_shard_id: migration.target_shard_id.clone(),
            attempts: migration.retry_count,
            error: err,
        });
        metrics::record_migration("failed");
        Disposition::Failed
    }

    // ===== Operator =====

    /// Failed migrations, oldest first
    pub async fn failed_migrations(&self, limit: usize) -> Result<Vec<Migration>> {
        self.store
            .list_migrations(Some(MigrationStatus::Failed), limit)
            .await
    }

    /// Reset a failed migration to `pending` with a fresh retry budget
    #[instrument(skip(self))]
    pub async fn retry_failed(&self, id: Uuid) -> Result<Migration> {
        let mut migration = self
            .store
            .get_migration(id)
            .await?
            .ok_or_else(|| ShardError::Validation(format!("Unknown migration: {}", id)))?;

        if migration.status != MigrationStatus::Failed {
            return Err(ShardError::Validation(format!(
                "Migration {} is {}, not failed",
                id, migration.status
            )));
        }

        migration.status = MigrationStatus::Pending;
        migration.retry_count = 0;
        migration.error_message = None;
        migration.started_at = None;
        migration.completed_at = None;
        self.store.put_migration(&migration).await?;

        info!(migration_id = %id, "Failed migration re-queued");
        Ok(migration)
    }

    /// Migration counts grouped by source, target and status
    pub async fn migration_stats(&self) -> Result<Vec<MigrationStat>> {
        let migrations = self.store.list_migrations(None, usize::MAX).await?;

        let mut groups: BTreeMap<(String, String, MigrationStatus), (u64, Option<(DateTime<Utc>, String)>)> =
            BTreeMap::new();
        for migration in migrations {
            let entry = groups
                .entry((
                    migration.source_shard_id.clone(),
                    migration.target_shard_id.clone(),
                    migration.status,
                ))
                .or_insert((0, None));
            entry.0 += 1;

            if let Some(message) = migration.error_message {
                let at = migration.completed_at.unwrap_or(migration.created_at);
                if entry.1.as_ref().map_or(true, |(seen, _)| at >= *seen) {
                    entry.1 = Some((at, message));
                }
            }
        }

        Ok(groups
            .into_iter()
            .map(|((source, target, status), (count, last_error))| MigrationStat {
                source_shard_id: source,
                target_shard_id: target,
                status,
                count,
                last_error: last_error.map(|(_, message)| message),
            })
            .collect())
    }
}
