//! Health monitoring for shards
//!
//! Every sweep probes each non-inactive shard:
//! - probe through a `ShardProber` (latency + error rate), bounded by a timeout
//! - persist a `HealthRecord` and publish a `shard:health` event
//! - flip `active` <-> `unhealthy` when the error rate crosses the threshold
//!
//! Shards that were never probed count as healthy.

use crate::config::HealthConfig;
use crate::metrics;
use crate::registry::ShardRegistry;
use chrono::Utc;
use cyxshard_core::{EventBus, HealthRecord, Result, Shard, ShardEvent, ShardStatus};
use cyxshard_storage::ShardStore;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Outcome of probing one shard
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    pub latency_ms: u64,
    pub error_rate: f64,
}

/// Trait for shard probe implementations
#[async_trait::async_trait]
pub trait ShardProber: Send + Sync {
    /// Probe a shard
    async fn probe(&self, shard: &Shard) -> ProbeResult;
}

/// Probes a shard by reading its row from the durable store several times
pub struct StoreRoundTripProber {
    store: Arc<dyn ShardStore>,
    rounds: u32,
}

impl StoreRoundTripProber {
    pub fn new(store: Arc<dyn ShardStore>, rounds: u32) -> Self {
        Self {
            store,
            rounds: rounds.max(1),
        }
    }
}

#[async_trait::async_trait]
impl ShardProber for StoreRoundTripProber {
    async fn probe(&self, shard: &Shard) -> ProbeResult {
        let mut failed = 0u32;
        let mut total = Duration::ZERO;

        for _ in 0..self.rounds {
            let start = Instant::now();
            match self.store.get_shard(&shard.id).await {
                Ok(Some(_)) => {}
                Ok(None) => failed += 1,
                Err(e) => {
                    debug!(shard_id = %shard.id, error = %e, "Probe round failed");
                    failed += 1;
                }
            }
            total += start.elapsed();
        }

        ProbeResult {
            latency_ms: (total / self.rounds).as_millis() as u64,
            error_rate: failed as f64 / self.rounds as f64,
        }
    }
}

/// Result of a health sweep
#[derive(Debug, Default, Clone)]
pub struct HealthSweep {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Shards moved to `unhealthy` by this sweep
    pub demoted: Vec<String>,
    /// Shards restored to `active` by this sweep
    pub restored: Vec<String>,
}

impl HealthSweep {
    /// Summary string
    pub fn summary(&self) -> String {
        format!(
            "{} checked, {} healthy, {} unhealthy, {} demoted, {} restored",
            self.checked,
            self.healthy,
            self.unhealthy,
            self.demoted.len(),
            self.restored.len()
        )
    }
}

/// Health monitor that tracks shard health over time
pub struct HealthMonitor {
    store: Arc<dyn ShardStore>,
    registry: Arc<ShardRegistry>,
    bus: Arc<dyn EventBus>,
    prober: Arc<dyn ShardProber>,
    config: HealthConfig,
    /// Latest probe per shard
    latest: RwLock<HashMap<String, HealthRecord>>,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(
        store: Arc<dyn ShardStore>,
        registry: Arc<ShardRegistry>,
        bus: Arc<dyn EventBus>,
        prober: Arc<dyn ShardProber>,
        config: HealthConfig,
    ) -> Self {
        Self {
            store,
            registry,
            bus,
            prober,
            config,
            latest: RwLock::new(HashMap::new()),
        }
    }

    /// Whether the shard's latest probe was healthy (unknown counts as healthy)
    pub fn is_healthy(&self, shard_id: &str) -> bool {
        self.latest
            .read()
            .get(shard_id)
            .map_or(true, |record| record.healthy)
    }

    /// Latest probe for a shard
    pub fn latest(&self, shard_id: &str) -> Option<HealthRecord> {
        self.latest.read().get(shard_id).cloned()
    }

    /// Apply a `shard:health` event from the bus
    pub fn apply_event(&self, event: &ShardEvent) {
        if let ShardEvent::Health {
            shard_id,
            healthy,
            latency_ms,
            error_rate,
            at,
        } = event
        {
            let mut latest = self.latest.write();
            let newer = latest
                .get(shard_id)
                .map_or(true, |current| *at >= current.checked_at);
            if newer {
                latest.insert(
                    shard_id.clone(),
                    HealthRecord {
                        shard_id: shard_id.clone(),
                        latency_ms: *latency_ms,
                        error_rate: *error_rate,
                        healthy: *healthy,
                        checked_at: *at,
                    },
                );
            }
        }
    }

    /// Forget a shard (after removal)
    pub fn forget(&self, shard_id: &str) {
        self.latest.write().remove(shard_id);
    }

    /// Probe every non-inactive shard
    #[instrument(skip(self))]
    pub async fn check_all(&self) -> Result<HealthSweep> {
        let shards: Vec<Shard> = self
            .store
            .list_shards(None)
            .await?
            .into_iter()
            .filter(|s| s.status != ShardStatus::Inactive)
            .collect();

        let results = join_all(shards.iter().map(|shard| self.check_and_transition(shard))).await;

        let mut sweep = HealthSweep::default();
        for (shard, result) in shards.iter().zip(results) {
            sweep.checked += 1;
            let (record, changed) = match result {
                Ok(checked) => checked,
                Err(e) => {
                    warn!(shard_id = %shard.id, error = %e, "Health check failed");
                    continue;
                }
            };

            if record.healthy {
                sweep.healthy += 1;
                if changed {
                    sweep.restored.push(shard.id.clone());
                }
            } else {
                sweep.unhealthy += 1;
                if changed {
                    sweep.demoted.push(shard.id.clone());
                }
            }
        }

        debug!(summary = %sweep.summary(), "Health sweep complete");
        Ok(sweep)
    }

    /// Probe one shard, record the result and apply any status transition
    pub async fn check_shard(&self, shard: &Shard) -> Result<HealthRecord> {
        Ok(self.check_and_transition(shard).await?.0)
    }

    /// As `check_shard`, also reporting whether the shard's status changed
    async fn check_and_transition(&self, shard: &Shard) -> Result<(HealthRecord, bool)> {
        let limit = self.config.probe_timeout();
        let probe = match timeout(limit, self.prober.probe(shard)).await {
            Ok(probe) => probe,
            Err(_) => {
                warn!(shard_id = %shard.id, timeout = ?limit, "Health probe timed out");
                ProbeResult {
                    latency_ms: limit.as_millis() as u64,
                    error_rate: 1.0,
                }
            }
        };

        let record = HealthRecord {
            shard_id: shard.id.clone(),
            latency_ms: probe.latency_ms,
            error_rate: probe.error_rate,
            healthy: probe.error_rate <= self.config.error_rate_threshold,
            checked_at: Utc::now(),
        };

        self.latest
            .write()
            .insert(shard.id.clone(), record.clone());
        metrics::record_health_check(record.healthy);

        if let Err(e) = self.store.append_health_record(&record).await {
            warn!(shard_id = %shard.id, error = %e, "Failed to persist health record");
        }

        self.bus.publish(ShardEvent::Health {
            shard_id: record.shard_id.clone(),
            healthy: record.healthy,
            latency_ms: record.latency_ms,
            error_rate: record.error_rate,
            at: record.checked_at,
        });

        let transition = match (record.healthy, shard.status) {
            (false, ShardStatus::Active) => Some((ShardStatus::Active, ShardStatus::Unhealthy)),
            (true, ShardStatus::Unhealthy) => Some((ShardStatus::Unhealthy, ShardStatus::Active)),
            _ => None,
        };

        let mut changed = false;
        if let Some((expected, status)) = transition {
            match self
                .registry
                .transition_status(&shard.id, expected, status)
                .await?
            {
                None => debug!(
                    shard_id = %shard.id,
                    expected = %expected,
                    "Shard status changed during health check; transition skipped"
                ),
                Some(_) if status == ShardStatus::Unhealthy => {
                    changed = true;
                    warn!(
                        shard_id = %shard.id,
                        error_rate = record.error_rate,
                        latency_ms = record.latency_ms,
                        "Shard marked unhealthy"
                    );
                }
                Some(_) => {
                    changed = true;
                    info!(shard_id = %shard.id, "Shard restored to active");
                }
            }
        }

        Ok((record, changed))
    }
}
