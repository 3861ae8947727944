//! CyxShard Engine Library
//!
//! Routing, health monitoring and rebalancing for a fleet of shards.
//!
//! The engine:
//! - Resolves keys to shards with load-weighted, hash-driven selection
//! - Probes shard health and steers new keys away from unhealthy shards
//! - Plans migrations from overloaded to underloaded shards
//! - Drains queued migrations with bounded retries
//! - Runs the periodic maintenance (stats, cleanup) in the background

pub mod config;
pub mod engine;
pub mod executor;
pub mod health;
pub mod metrics;
pub mod planner;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod timed;

// Re-export main types
pub use config::{
    ConfigError, EngineConfig, ExecutorConfig, HealthConfig, PlannerConfig, RouterConfig,
    SchedulerConfig,
};
pub use engine::{ShardEngine, ShardEngineBuilder};
pub use executor::{DrainReport, MigrationExecutor, PlannedMoves, QueuedMoves};
pub use health::{HealthMonitor, HealthSweep, ProbeResult, ShardProber, StoreRoundTripProber};
pub use metrics::init_metrics;
pub use planner::{RebalanceOutcome, RebalanceReport, RebalancingPlanner};
pub use registry::ShardRegistry;
pub use router::{free_fraction, select_shard, shard_weight, ConsistentRouter};
pub use scheduler::{
    refresh_stats, run_cleanup, CleanupReport, MaintenanceContext, MaintenanceIntervals,
    MaintenanceScheduler,
};
pub use timed::TimedStore;
