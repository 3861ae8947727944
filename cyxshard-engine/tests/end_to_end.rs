//! End-to-end tests for the shard engine
//!
//! Drives the public `ShardEngine` API over in-memory and sled stores:
//! routing → health → rebalance → drain → cleanup → removal
//!
//! Run with: cargo test -p cyxshard-engine --test end_to_end

use chrono::{Duration as ChronoDuration, Utc};
use cyxshard_core::{
    EventBus, KeyHash, LocalEventBus, MigrationStatus, Shard, ShardError, ShardEvent,
    ShardMapping, ShardStatus, Topic,
};
use cyxshard_engine::{
    select_shard, EngineConfig, ProbeResult, RebalanceOutcome, RebalanceReport, RouterConfig,
    ShardEngine, ShardProber,
};
use cyxshard_storage::{MemoryStore, ShardStore, SledStore, StoreOp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Store with shards pre-loaded by `loads` mappings each
async fn seeded_store(loads: &[(&str, u64)], capacity: u64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for (id, load) in loads {
        store
            .put_shard(&Shard::with_id(*id, "test", capacity))
            .await
            .unwrap();
        for i in 0..*load {
            let key = format!("{}-seed-{}", id, i);
            store
                .create_mapping(ShardMapping::new(KeyHash::compute(&key), *id, key))
                .await
                .unwrap();
        }
    }
    store
}

fn completed(outcome: RebalanceOutcome) -> RebalanceReport {
    match outcome {
        RebalanceOutcome::Completed(report) => report,
        RebalanceOutcome::AlreadyRunning => panic!("rebalance pass skipped"),
    }
}

async fn loads(engine: &ShardEngine) -> HashMap<String, u64> {
    engine
        .get_shard_stats()
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.shard_id, s.load_units))
        .collect()
}

/// Prober that reports one shard as failing while a flag is set
struct ToggleProber {
    failing_shard: String,
    failing: AtomicBool,
}

#[async_trait::async_trait]
impl ShardProber for ToggleProber {
    async fn probe(&self, shard: &Shard) -> ProbeResult {
        let fail = shard.id == self.failing_shard && self.failing.load(Ordering::SeqCst);
        ProbeResult {
            latency_ms: 1,
            error_rate: if fail { 1.0 } else { 0.0 },
        }
    }
}

#[tokio::test]
async fn test_routing_is_deterministic_across_engines() {
    let fleet = [("a", 0), ("b", 0), ("c", 0)];
    let first = ShardEngine::new(seeded_store(&fleet, 1000).await);
    let second = ShardEngine::new(seeded_store(&fleet, 1000).await);
    first.refresh().await.unwrap();
    second.refresh().await.unwrap();

    for i in 0..300 {
        let key = format!("order:{}", i);
        assert_eq!(
            first.resolve(&key).await.unwrap(),
            second.resolve(&key).await.unwrap(),
            "diverged on {}",
            key
        );
    }
}

#[tokio::test]
async fn test_load_is_conserved() {
    let engine = ShardEngine::new(seeded_store(&[("a", 0), ("b", 0), ("c", 0)], 500).await);
    engine.refresh().await.unwrap();

    for i in 0..200 {
        engine.resolve(&format!("key-{}", i)).await.unwrap();
    }
    // Repeat access adds load by default
    for i in 0..50 {
        engine.resolve(&format!("key-{}", i)).await.unwrap();
    }
    for i in 100..130 {
        engine.release(&format!("key-{}", i)).await.unwrap();
    }
    // Unknown keys and exhausted mappings change nothing
    engine.release("never-resolved").await.unwrap();

    let stats = engine.get_shard_stats().await.unwrap();
    let load: u64 = stats.iter().map(|s| s.load_units).sum();
    let items: u64 = stats.iter().map(|s| s.item_count).sum();
    assert_eq!(load, 250 - 30);
    assert_eq!(items, 200);
}

#[test]
fn test_selection_tracks_capacity() {
    let shards = vec![
        Shard::with_id("large", "test", 2000),
        Shard::with_id("small", "test", 1000),
    ];

    let mut large = 0u64;
    let mut small = 0u64;
    for i in 0..100_000 {
        let hash = KeyHash::compute(&format!("key-{}", i));
        match select_shard(&shards, &hash).unwrap().id.as_str() {
            "large" => large += 1,
            _ => small += 1,
        }
    }

    let ratio = large as f64 / small as f64;
    assert!((1.8..=2.2).contains(&ratio), "ratio {}", ratio);
}

#[tokio::test]
async fn test_routing_fairness_through_engine() {
    let config = EngineConfig {
        router: RouterConfig {
            count_repeat_access: false,
        },
        ..Default::default()
    };
    let store = seeded_store(&[], 0).await;
    store
        .put_shard(&Shard::with_id("large", "test", 2000))
        .await
        .unwrap();
    store
        .put_shard(&Shard::with_id("small", "test", 1000))
        .await
        .unwrap();
    let engine = ShardEngine::builder(store).config(config).build();
    engine.refresh().await.unwrap();

    // Far past capacity: both shards sit on the weight floor, so the split
    // stays proportional to capacity
    for i in 0..100_000 {
        engine.resolve(&format!("key-{}", i)).await.unwrap();
    }

    let loads = loads(&engine).await;
    assert_eq!(loads["large"] + loads["small"], 100_000);
    let ratio = loads["large"] as f64 / loads["small"] as f64;
    assert!((1.9..=2.1).contains(&ratio), "ratio {}", ratio);
}

#[tokio::test]
async fn test_shard_retired_by_another_engine_takes_no_keys() {
    let store = seeded_store(&[("a", 0), ("b", 0)], 1000).await;
    let first = ShardEngine::new(store.clone());
    let second = ShardEngine::new(store.clone());
    first.refresh().await.unwrap();
    second.refresh().await.unwrap();

    second.remove_shard("b").await.unwrap();
    // The first engine still believes "b" is active
    assert!(first.registry().get("b").is_some());

    for i in 0..50 {
        assert_eq!(first.resolve(&format!("key-{}", i)).await.unwrap(), "a");
    }

    let b = store.get_shard("b").await.unwrap().unwrap();
    assert_eq!(b.status, ShardStatus::Inactive);
    assert!(b.is_empty());
    assert!(first.registry().get("b").is_none());
    assert_eq!(loads(&first).await["a"], 50);
}

#[tokio::test]
async fn test_rebalance_finds_load_behind_idle_keys() {
    let engine = ShardEngine::new(Arc::new(MemoryStore::new()));
    let hot = engine.add_shard("r", 10_000).await.unwrap();

    for i in 0..300 {
        let key = format!("idle-{}", i);
        engine.resolve(&key).await.unwrap();
        engine.release(&key).await.unwrap();
    }
    for i in 0..300 {
        engine.resolve(&format!("hot-{}", i)).await.unwrap();
    }
    engine.add_shard("r", 10_000).await.unwrap();
    engine.add_shard("r", 10_000).await.unwrap();

    let report = completed(engine.rebalance_now().await.unwrap());
    assert_eq!(report.overloaded, vec![hot.id.clone()]);
    assert!(report.planned > 0);
    assert_eq!(report.planned_load, report.planned as u64);

    let drained = engine.drain_migrations_now().await.unwrap();
    assert!(drained.completed > 0);
    assert_eq!(drained.failed, 0);
    let loads = loads(&engine).await;
    assert_eq!(loads.values().sum::<u64>(), 300);
    assert!(loads[&hot.id] < 300);
}

#[tokio::test]
async fn test_rebalance_drains_hot_shard() {
    let mut config = EngineConfig::default();
    config.planner.max_migrations_per_pass = 1000;
    config.executor.batch_size = 1000;

    let store = seeded_store(&[("s1", 1000), ("s2", 100), ("s3", 100), ("s4", 100)], 10_000).await;
    let engine = ShardEngine::builder(store.clone()).config(config).build();
    engine.refresh().await.unwrap();

    let report = completed(engine.rebalance_now().await.unwrap());
    assert_eq!(report.overloaded, vec!["s1".to_string()]);
    assert_eq!(report.underloaded.len(), 3);
    assert_eq!(report.planned, 675);

    let pending = store
        .list_migrations(Some(MigrationStatus::Pending), usize::MAX)
        .await
        .unwrap();
    assert_eq!(pending.len(), 675);
    assert!(pending.iter().all(|m| m.source_shard_id == "s1"));

    let drained = engine.drain_migrations_now().await.unwrap();
    assert_eq!(drained.completed, 675);
    assert_eq!(drained.failed, 0);

    let after = loads(&engine).await;
    for id in ["s1", "s2", "s3", "s4"] {
        assert_eq!(after[id], 325, "{}", id);
    }
    assert!(completed(engine.rebalance_now().await.unwrap()).is_noop());

    let stats = engine.get_migration_stats().await.unwrap();
    let done: u64 = stats
        .iter()
        .filter(|s| s.status == MigrationStatus::Completed)
        .map(|s| s.count)
        .sum();
    assert_eq!(done, 675);
}

#[tokio::test]
async fn test_migration_moves_exactly_one_unit() {
    let store = seeded_store(&[("a", 3), ("b", 0)], 100).await;
    let engine = ShardEngine::new(store.clone());
    engine.refresh().await.unwrap();

    let hash = KeyHash::compute("a-seed-0");
    let migration = cyxshard_core::Migration::new("a", "b", hash);
    store.put_migration(&migration).await.unwrap();

    let report = engine.drain_migrations_now().await.unwrap();
    assert_eq!(report.completed, 1);

    let after = loads(&engine).await;
    assert_eq!((after["a"], after["b"]), (2, 1));
    assert_eq!(engine.lookup("a-seed-0").await.unwrap(), Some("b".to_string()));

    // Routing follows the moved mapping
    assert_eq!(engine.resolve("a-seed-0").await.unwrap(), "b");
}

#[tokio::test]
async fn test_retry_exhaustion_marks_failed() {
    let bus = Arc::new(LocalEventBus::new());
    let mut failures = bus.subscribe(Topic::MigrationFailed, "test");

    let store = seeded_store(&[("a", 1), ("b", 0)], 100).await;
    let engine = ShardEngine::builder(store.clone())
        .bus(bus.clone())
        .build();
    engine.refresh().await.unwrap();

    let migration = cyxshard_core::Migration::new("a", "b", KeyHash::compute("a-seed-0"));
    store.put_migration(&migration).await.unwrap();
    store.fail_next(StoreOp::ReassignMapping, 3);

    assert_eq!(engine.drain_migrations_now().await.unwrap().retried, 1);
    assert_eq!(engine.drain_migrations_now().await.unwrap().retried, 1);
    assert_eq!(engine.drain_migrations_now().await.unwrap().failed, 1);

    // No fourth attempt
    assert_eq!(engine.drain_migrations_now().await.unwrap().processed, 0);

    let failed = engine.failed_migrations(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retry_count, 3);
    assert!(failed[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("3 attempts"));

    match failures.try_recv().unwrap() {
        ShardEvent::MigrationFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected event {:?}", other),
    }

    // Mapping never moved
    assert_eq!(engine.lookup("a-seed-0").await.unwrap(), Some("a".to_string()));

    // Operator retry succeeds once the store recovers
    engine.retry_failed_migration(migration.id).await.unwrap();
    assert_eq!(engine.drain_migrations_now().await.unwrap().completed, 1);
    assert_eq!(engine.lookup("a-seed-0").await.unwrap(), Some("b".to_string()));
}

#[tokio::test]
async fn test_unhealthy_shard_excluded_then_restored() {
    let prober = Arc::new(ToggleProber {
        failing_shard: "a".to_string(),
        failing: AtomicBool::new(true),
    });
    let store = seeded_store(&[("a", 0), ("b", 0)], 1000).await;
    let engine = ShardEngine::builder(store).prober(prober.clone()).build();
    engine.refresh().await.unwrap();

    let sweep = engine.check_health_now().await.unwrap();
    assert_eq!(sweep.demoted, vec!["a".to_string()]);

    for i in 0..100 {
        assert_eq!(engine.resolve(&format!("down-{}", i)).await.unwrap(), "b");
    }
    let stats = engine.get_shard_stats().await.unwrap();
    let a = stats.iter().find(|s| s.shard_id == "a").unwrap();
    assert_eq!(a.status, ShardStatus::Unhealthy);
    assert!(!a.healthy);

    prober.failing.store(false, Ordering::SeqCst);
    let sweep = engine.check_health_now().await.unwrap();
    assert_eq!(sweep.restored, vec!["a".to_string()]);

    let mut on_a = 0;
    for i in 0..200 {
        if engine.resolve(&format!("up-{}", i)).await.unwrap() == "a" {
            on_a += 1;
        }
    }
    assert!(on_a > 0);

    let history = engine.get_shard_health("a").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].healthy);
    assert!(!history[1].healthy);
}

#[tokio::test]
async fn test_remove_requires_empty_shard() {
    let store = seeded_store(&[("a", 0), ("b", 0)], 1000).await;
    let engine = ShardEngine::new(store.clone());
    engine.refresh().await.unwrap();

    let owner = engine.resolve("session:1").await.unwrap();
    engine.release("session:1").await.unwrap();

    assert!(matches!(
        engine.remove_shard(&owner).await,
        Err(ShardError::ShardNotEmpty { .. })
    ));

    // Age the mapping past retention so cleanup deletes it
    let hash = KeyHash::compute("session:1");
    store
        .touch_mapping(&hash, Utc::now() - ChronoDuration::days(31), false)
        .await
        .unwrap();
    let cleanup = engine.cleanup_now().await.unwrap();
    assert_eq!(cleanup.mappings_deleted, 1);

    let removed = engine.remove_shard(&owner).await.unwrap();
    assert_eq!(removed.status, ShardStatus::Inactive);

    // New keys only land on the remaining shard
    let other = if owner == "a" { "b" } else { "a" };
    for i in 0..20 {
        assert_eq!(engine.resolve(&format!("after-{}", i)).await.unwrap(), other);
    }
}

#[tokio::test]
async fn test_unknown_shard_removal() {
    let engine = ShardEngine::new(Arc::new(MemoryStore::new()));
    assert!(matches!(
        engine.remove_shard("ghost").await,
        Err(ShardError::ShardNotFound(_))
    ));
}

#[tokio::test]
async fn test_sled_engine_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let owner = {
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let engine = ShardEngine::new(store.clone());
        engine
            .bootstrap_shards(vec![
                Shard::with_id("a", "test", 100),
                Shard::with_id("b", "test", 100),
            ])
            .await
            .unwrap();
        engine.refresh().await.unwrap();
        let owner = engine.resolve("persistent").await.unwrap();
        store.flush().await.unwrap();
        owner
    };

    let store = Arc::new(SledStore::open(dir.path()).unwrap());
    let engine = ShardEngine::new(store);
    engine.refresh().await.unwrap();
    assert_eq!(engine.lookup("persistent").await.unwrap(), Some(owner.clone()));
    assert_eq!(engine.resolve("persistent").await.unwrap(), owner);

    let loads = loads(&engine).await;
    assert_eq!(loads[&owner], 2);
}
