//! Engine configuration
//!
//! Defaults, overridden by an optional TOML file, then by `SHARD_*`
//! environment variables, then validated.

use cyxshard_core::{ShardError, MAX_MIGRATION_ATTEMPTS};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl From<ConfigError> for ShardError {
    fn from(err: ConfigError) -> Self {
        ShardError::Configuration(err.to_string())
    }
}

/// Router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Count a repeat resolve of an existing mapping as additional load
    pub count_repeat_access: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            count_repeat_access: true,
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between health sweeps in seconds
    pub check_interval_secs: u64,
    /// Timeout for a single shard probe in milliseconds
    pub probe_timeout_ms: u64,
    /// Error rate above which a shard is marked unhealthy
    pub error_rate_threshold: f64,
    /// Store round-trips per probe
    pub probe_rounds: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            probe_timeout_ms: 2_000,
            error_rate_threshold: 0.05,
            probe_rounds: 5,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Rebalancing planner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Interval between rebalance evaluations in seconds
    pub check_interval_secs: u64,
    /// Relative deviation from the average load that triggers rebalancing
    pub threshold: f64,
    /// Maximum migrations planned by one pass
    pub max_migrations_per_pass: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            threshold: 0.2,
            max_migrations_per_pass: 500,
        }
    }
}

impl PlannerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Migration executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Interval between queue drains in seconds
    pub drain_interval_secs: u64,
    /// Migrations processed per drain
    pub batch_size: usize,
    /// Attempts before a migration is marked failed
    pub max_attempts: u32,
    /// A migration left `processing` longer than this is picked up again
    pub stall_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            drain_interval_secs: 5,
            batch_size: 50,
            max_attempts: MAX_MIGRATION_ATTEMPTS,
            stall_timeout_secs: 300,
        }
    }
}

impl ExecutorConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

/// Maintenance scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between shard stats refreshes in seconds
    pub stats_interval_secs: u64,
    /// Interval between stale-mapping cleanups in seconds
    pub cleanup_interval_secs: u64,
    /// Mappings not accessed for this many days are deleted
    pub mapping_retention_days: u64,
    /// Health records older than this many hours are pruned
    pub health_retention_hours: u64,
    /// Mappings deleted per cleanup round
    pub cleanup_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 15,
            cleanup_interval_secs: 3_600,
            mapping_retention_days: 30,
            health_retention_hours: 24,
            cleanup_batch_size: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn mapping_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.mapping_retention_days as i64)
    }

    pub fn health_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.health_retention_hours as i64)
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on every durable-store call in milliseconds
    pub store_timeout_ms: u64,
    pub router: RouterConfig,
    pub health: HealthConfig,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: 5_000,
            router: RouterConfig::default(),
            health: HealthConfig::default(),
            planner: PlannerConfig::default(),
            executor: ExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, optional TOML file, environment, validation
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Override fields from `SHARD_*` environment variables
    pub fn apply_env(&mut self) {
        override_from_env("SHARD_STORE_TIMEOUT_MS", &mut self.store_timeout_ms);

        if let Ok(v) = std::env::var("SHARD_COUNT_REPEAT_ACCESS") {
            self.router.count_repeat_access = v == "true" || v == "1";
        }

        override_from_env("SHARD_HEALTH_INTERVAL_SECS", &mut self.health.check_interval_secs);
        override_from_env("SHARD_HEALTH_TIMEOUT_MS", &mut self.health.probe_timeout_ms);
        override_from_env(
            "SHARD_HEALTH_ERROR_THRESHOLD",
            &mut self.health.error_rate_threshold,
        );
        override_from_env("SHARD_HEALTH_PROBE_ROUNDS", &mut self.health.probe_rounds);

        override_from_env(
            "SHARD_REBALANCE_INTERVAL_SECS",
            &mut self.planner.check_interval_secs,
        );
        override_from_env("SHARD_REBALANCE_THRESHOLD", &mut self.planner.threshold);
        override_from_env(
            "SHARD_MAX_MIGRATIONS_PER_PASS",
            &mut self.planner.max_migrations_per_pass,
        );

        override_from_env(
            "SHARD_DRAIN_INTERVAL_SECS",
            &mut self.executor.drain_interval_secs,
        );
        override_from_env("SHARD_MIGRATION_BATCH_SIZE", &mut self.executor.batch_size);
        override_from_env(
            "SHARD_MIGRATION_MAX_ATTEMPTS",
            &mut self.executor.max_attempts,
        );

        override_from_env(
            "SHARD_STATS_INTERVAL_SECS",
            &mut self.scheduler.stats_interval_secs,
        );
        override_from_env(
            "SHARD_CLEANUP_INTERVAL_SECS",
            &mut self.scheduler.cleanup_interval_secs,
        );
        override_from_env(
            "SHARD_MAPPING_RETENTION_DAYS",
            &mut self.scheduler.mapping_retention_days,
        );
        override_from_env(
            "SHARD_HEALTH_RETENTION_HOURS",
            &mut self.scheduler.health_retention_hours,
        );
    }

    /// Reject out-of-range values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_timeout_ms == 0 {
            return Err(invalid("store_timeout_ms", "must be positive"));
        }

        let t = self.planner.threshold;
        if !(t > 0.0 && t < 1.0) {
            return Err(invalid("planner.threshold", format!("{} not in (0, 1)", t)));
        }

        let e = self.health.error_rate_threshold;
        if !(0.0..=1.0).contains(&e) {
            return Err(invalid(
                "health.error_rate_threshold",
                format!("{} not in [0, 1]", e),
            ));
        }

        if self.health.probe_rounds == 0 {
            return Err(invalid("health.probe_rounds", "must be positive"));
        }
        if self.executor.batch_size == 0 {
            return Err(invalid("executor.batch_size", "must be positive"));
        }
        if self.executor.max_attempts == 0 {
            return Err(invalid("executor.max_attempts", "must be positive"));
        }
        if self.planner.max_migrations_per_pass == 0 {
            return Err(invalid("planner.max_migrations_per_pass", "must be positive"));
        }

        let intervals = [
            ("health.check_interval_secs", self.health.check_interval_secs),
            ("health.probe_timeout_ms", self.health.probe_timeout_ms),
            ("planner.check_interval_secs", self.planner.check_interval_secs),
            ("executor.drain_interval_secs", self.executor.drain_interval_secs),
            ("scheduler.stats_interval_secs", self.scheduler.stats_interval_secs),
            (
                "scheduler.cleanup_interval_secs",
                self.scheduler.cleanup_interval_secs,
            ),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(invalid(name, "must be positive"));
            }
        }

        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn override_from_env<T: FromStr>(name: &str, field: &mut T) {
    if let Some(value) = std::env::var(name).ok().and_then(|v| v.parse().ok()) {
        *field = value;
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue(field.to_string(), reason.into())
}
