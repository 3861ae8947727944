//! CyxShard Daemon
//!
//! Runs the routing engine over a sled database (or in memory), bootstraps
//! the configured shards and keeps the maintenance tasks running until
//! interrupted.

use anyhow::Context;
use clap::Parser;
use cyxshard_core::Shard;
use cyxshard_engine::{init_metrics, EngineConfig, ShardEngine};
use cyxshard_storage::{MemoryStore, ShardStore, SledStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cyxshard")]
#[command(about = "CyxShard routing and rebalancing daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// sled database directory
    #[arg(short, long, default_value = "./data/cyxshard", env = "SHARD_DATA_DIR")]
    data_dir: PathBuf,

    /// Keep all state in memory (nothing survives a restart)
    #[arg(long)]
    memory: bool,

    /// Prometheus metrics port
    #[arg(short, long, env = "SHARD_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Shards to register on startup, as id:region:capacity
    #[arg(long, value_delimiter = ',', value_parser = parse_shard_spec)]
    bootstrap_shards: Vec<Shard>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

/// Parse `id:region:capacity`
fn parse_shard_spec(raw: &str) -> Result<Shard, String> {
    let parts: Vec<&str> = raw.trim().split(':').collect();
    let [id, region, capacity] = parts.as_slice() else {
        return Err(format!("expected id:region:capacity, got '{}'", raw));
    };
    if id.is_empty() || region.is_empty() {
        return Err(format!("empty id or region in '{}'", raw));
    }
    let capacity: u64 = capacity
        .parse()
        .map_err(|e| format!("invalid capacity in '{}': {}", raw, e))?;
    if capacity == 0 {
        return Err(format!("capacity must be positive in '{}'", raw));
    }
    Ok(Shard::with_id(*id, *region, capacity))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("CyxShard starting...");

    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!(
        store_timeout_ms = config.store_timeout_ms,
        rebalance_threshold = config.planner.threshold,
        max_migrations_per_pass = config.planner.max_migrations_per_pass,
        "Configuration loaded"
    );

    if let Some(port) = cli.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        init_metrics(addr).context("starting metrics exporter")?;
        info!(%addr, "Metrics exporter listening");
    }

    let (store, sled): (Arc<dyn ShardStore>, Option<Arc<SledStore>>) = if cli.memory {
        warn!("Using in-memory store; state is lost on exit");
        (Arc::new(MemoryStore::new()), None)
    } else {
        let sled = Arc::new(
            SledStore::open(&cli.data_dir)
                .with_context(|| format!("opening sled database at {:?}", cli.data_dir))?,
        );
        info!(
            data_dir = ?cli.data_dir,
            size_on_disk = sled.size_on_disk(),
            "Opened sled store"
        );
        (sled.clone(), Some(sled))
    };

    let engine = ShardEngine::builder(store).config(config).build();

    if !cli.bootstrap_shards.is_empty() {
        let added = engine.bootstrap_shards(cli.bootstrap_shards).await?;
        info!(added, "Bootstrapped shards");
    }

    engine.start().await?;
    info!("CyxShard running. Press Ctrl+C to stop.");

    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutting down...");
    engine.shutdown().await;

    if let Some(sled) = sled {
        if let Err(e) = sled.flush().await {
            error!(error = %e, "Failed to flush sled store");
        }
    }

    info!("CyxShard stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shard_spec() {
        let shard = parse_shard_spec("s1:eu-west:1000").unwrap();
        assert_eq!(shard.id, "s1");
        assert_eq!(shard.region, "eu-west");
        assert_eq!(shard.capacity_units, 1000);

        assert!(parse_shard_spec("s1:eu-west").is_err());
        assert!(parse_shard_spec("s1:eu-west:lots").is_err());
        assert!(parse_shard_spec("s1:eu-west:0").is_err());
        assert!(parse_shard_spec(":eu-west:10").is_err());
    }

    #[test]
    fn test_cli_bootstrap_list() {
        let cli = Cli::parse_from([
            "cyxshard",
            "--memory",
            "--bootstrap-shards",
            "a:r1:10,b:r2:20",
        ]);
        assert!(cli.memory);
        let ids: Vec<&str> = cli.bootstrap_shards.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
