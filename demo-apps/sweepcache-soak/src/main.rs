use anyhow::{ensure, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sweepcache_core::{
    CacheConfig, CacheItemPolicy, CachePriority, Clock, ManualClock, MemoryCache, RemovedArguments,
    RemovedReason,
};
use tokio::sync::Semaphore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sweepcache_soak=info,sweepcache_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CacheConfig::from_env();
    tracing::info!("🧪 Sweepcache soak scenarios");
    tracing::info!("   Polling interval: {:?}", config.polling_interval);
    tracing::info!("   Max entries: {}", config.max_entries);
    println!();

    test_basic_operations(config).await?;
    test_parallel_set_get().await?;
    test_expiration_sweep().await?;
    test_lru_trim_under_pressure().await?;
    test_sliding_renewal().await?;
    test_pinned_entries_survive_trim().await?;

    println!();
    tracing::info!("✅ All scenarios passed!");

    Ok(())
}

/// SET/GET/REMOVE against a cache built from the environment
async fn test_basic_operations(config: CacheConfig) -> Result<()> {
    tracing::info!("Scenario: Basic Operations");

    let cache: MemoryCache<String> = MemoryCache::with_config(config)?;
    let key = format!("basic-{}", uuid::Uuid::new_v4());

    cache.set(key.clone(), "hello world".to_string(), CacheItemPolicy::new())?;
    ensure!(
        cache.get(&key).as_deref().map(String::as_str) == Some("hello world"),
        "Value should match"
    );

    ensure!(cache.remove(&key).is_some(), "Key should be removed");
    ensure!(cache.get(&key).is_none(), "Key should not be found after remove");

    let conflicting = CacheItemPolicy::new()
        .with_absolute_expiration(chrono::Utc::now() + chrono::Duration::seconds(60))
        .with_sliding_expiration(Duration::from_secs(60));
    match cache.set(key.clone(), "rejected".to_string(), conflicting) {
        Err(e) if e.is_policy_error() => tracing::info!("   Rejected policy: {}", e),
        other => anyhow::bail!("Conflicting expirations should be rejected, got {:?}", other),
    }
    ensure!(!cache.contains_key(&key), "A rejected policy should store nothing");

    tracing::info!("   ✓ Basic operations work correctly");
    Ok(())
}

/// Parallel SET and GET from many tasks - verify no data mixing
async fn test_parallel_set_get() -> Result<()> {
    tracing::info!("Scenario: Parallel SET/GET (2000 concurrent operations)");

    let num_operations = 2000;
    let cache: MemoryCache<String> = MemoryCache::new()?;
    let semaphore = Arc::new(Semaphore::new(64));

    let test_data: HashMap<String, String> = (0..num_operations)
        .map(|i| {
            (
                format!("parallel-{}-{}", i, uuid::Uuid::new_v4()),
                format!("value-{}-{}", i, uuid::Uuid::new_v4()),
            )
        })
        .collect();

    let start = Instant::now();
    let set_tasks: Vec<_> = test_data
        .iter()
        .map(|(key, value)| {
            let cache = cache.clone();
            let semaphore = Arc::clone(&semaphore);
            let (key, value) = (key.clone(), value.clone());
            tokio::spawn(async move {
                let _permit = semaphore.acquire().await?;
                cache.set(key, value, CacheItemPolicy::new())?;
                Ok::<_, anyhow::Error>(())
            })
        })
        .collect();

    for result in join_all(set_tasks).await {
        result??;
    }
    let set_elapsed = start.elapsed();

    let errors = Arc::new(AtomicUsize::new(0));
    let get_start = Instant::now();
    let get_tasks: Vec<_> = test_data
        .iter()
        .map(|(key, expected)| {
            let cache = cache.clone();
            let errors = Arc::clone(&errors);
            let (key, expected) = (key.clone(), expected.clone());
            tokio::spawn(async move {
                match cache.get(&key) {
                    Some(value) if *value == expected => {}
                    other => {
                        tracing::error!("Mismatch for key {}: expected '{}', got {:?}", key, expected, other);
                        errors.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    for result in join_all(get_tasks).await {
        result?;
    }
    let get_elapsed = get_start.elapsed();

    tracing::info!("   SET {} keys in {:?}", num_operations, set_elapsed);
    tracing::info!("   GET {} keys in {:?}", num_operations, get_elapsed);

    ensure!(errors.load(Ordering::SeqCst) == 0, "No errors should occur");
    ensure!(cache.len() == num_operations, "Every key should be present");
    ensure!(cache.usage().len() == num_operations, "Every key should be in the usage index");

    tracing::info!("   ✓ All {} values verified correctly", num_operations);
    Ok(())
}

/// The background timer removes expired entries on its own
async fn test_expiration_sweep() -> Result<()> {
    tracing::info!("Scenario: Timer-driven expiration sweep");

    let config = CacheConfig::default().with_polling_interval(Duration::from_millis(100));
    let cache: MemoryCache<String> = MemoryCache::with_config(config)?;
    let removals = Removals::default();
    ensure!(
        cache.expires().interval() == Duration::from_millis(100),
        "The timer should use the configured polling interval"
    );

    let expires_at = chrono::Utc::now() + chrono::Duration::milliseconds(250);
    for i in 0..500 {
        let sink = removals.clone();
        let policy = CacheItemPolicy::new()
            .with_absolute_expiration(expires_at)
            .on_removed(move |args: &RemovedArguments<String>| sink.record(args));
        cache.set(format!("short-{}", i), "temporary".to_string(), policy)?;
    }
    cache.set("long-lived", "stays".to_string(), CacheItemPolicy::new())?;

    ensure!(cache.len() == 501, "All entries should exist immediately");

    tracing::info!("   Waiting for the sweep...");
    tokio::time::sleep(Duration::from_millis(600)).await;

    ensure!(cache.len() == 1, "Only the long-lived entry should remain, found {}", cache.len());
    ensure!(
        removals.count(RemovedReason::Expired) == 500,
        "Every short entry should be reported as expired"
    );
    ensure!(cache.expires().sweep_count() >= 1, "The timer should have run");

    tracing::info!("   ✓ {} sweeps removed 500 entries", cache.expires().sweep_count());
    Ok(())
}

/// Inserting past the entry limit evicts the least recently used entries
async fn test_lru_trim_under_pressure() -> Result<()> {
    tracing::info!("Scenario: LRU trim at the entry limit");

    let config = CacheConfig::default().with_max_entries(100);
    let cache: MemoryCache<String> = MemoryCache::with_config(config)?;
    let removals = Removals::default();

    for i in 0..150 {
        let sink = removals.clone();
        let policy = CacheItemPolicy::new().on_removed(move |args: &RemovedArguments<String>| sink.record(args));
        cache.set(format!("item-{}", i), i.to_string(), policy)?;

        // Keep the first item hot so it survives the trims
        if i > 0 {
            ensure!(cache.get("item-0").is_some(), "item-0 should stay cached");
        }
    }

    ensure!(cache.len() == 100, "Cache should be held at its limit");
    ensure!(removals.count(RemovedReason::Evicted) == 50, "50 entries should be evicted");
    ensure!(cache.contains_key("item-0"), "The hot entry should survive");
    ensure!(!cache.contains_key("item-1"), "The coldest entry should be evicted");
    ensure!(cache.contains_key("item-149"), "The newest entry should survive");

    let trimmed = cache.trim(10);
    ensure!(trimmed == 10, "Trimming 10% should evict 10 entries, evicted {}", trimmed);

    tracing::info!("   ✓ Limit enforced; {} evictions reported", removals.count(RemovedReason::Evicted));
    Ok(())
}

/// Sliding expiration renews on every read, driven by a manual clock
async fn test_sliding_renewal() -> Result<()> {
    tracing::info!("Scenario: Sliding expiration renewal");

    let clock = Arc::new(ManualClock::starting_now());
    let config = CacheConfig::default().with_expiration_timer(false);
    let cache: MemoryCache<String> = MemoryCache::with_clock(config, clock.clone())?;

    let created = clock.now();
    let policy = CacheItemPolicy::new().with_sliding_expiration(Duration::from_secs(30));
    cache.set("session", "alice".to_string(), policy)?;

    let entries = cache.expires().entries_in_order();
    let session = entries.first().ok_or_else(|| anyhow::anyhow!("Session should be filed"))?;
    ensure!(session.utc_created() == created, "Creation time should come from the cache clock");
    ensure!(
        session.sliding_expiration() == Some(Duration::from_secs(30)),
        "The sliding window should be kept on the entry"
    );

    for _ in 0..10 {
        clock.advance(chrono::Duration::seconds(20));
        ensure!(cache.get("session").is_some(), "Session should be renewed by reads");
    }

    clock.advance(chrono::Duration::seconds(31));
    ensure!(cache.flush_expired() == 1, "Idle session should expire");

    tracing::info!("   ✓ Session lived 200s on a 30s sliding window, then expired");
    Ok(())
}

/// Non-removable entries are skipped by trims but still expire
async fn test_pinned_entries_survive_trim() -> Result<()> {
    tracing::info!("Scenario: Non-removable entries");

    let clock = Arc::new(ManualClock::starting_now());
    let config = CacheConfig::default().with_expiration_timer(false);
    let cache: MemoryCache<String> = MemoryCache::with_clock(config, clock.clone())?;

    let pinned = CacheItemPolicy::new()
        .with_priority(CachePriority::NotRemovable)
        .with_absolute_expiration(clock.now() + chrono::Duration::seconds(10));
    cache.set("pinned", "config".to_string(), pinned)?;
    for i in 0..20 {
        cache.set(format!("filler-{}", i), "x".to_string(), CacheItemPolicy::new())?;
    }

    let filed = cache.expires().entries_in_order();
    ensure!(
        filed.iter().all(|entry| entry.priority() == CachePriority::NotRemovable),
        "Only the pinned entry expires"
    );

    let evicted = cache.trim(100);
    ensure!(evicted == 20, "Only removable entries should be trimmed, evicted {}", evicted);
    ensure!(cache.contains_key("pinned"), "Pinned entry should survive the trim");

    clock.advance(chrono::Duration::seconds(10));
    ensure!(cache.flush_expired() == 1, "Pinned entry should still expire");

    tracing::info!("   ✓ Pinned entry survived the trim and expired on schedule");
    Ok(())
}

/// Removal notifications gathered from callbacks
#[derive(Clone, Default)]
struct Removals(Arc<Mutex<Vec<(String, RemovedReason)>>>);

impl Removals {
    fn record(&self, args: &RemovedArguments<String>) {
        if let Ok(mut log) = self.0.lock() {
            log.push((args.key.clone(), args.reason));
        }
    }

    fn count(&self, reason: RemovedReason) -> usize {
        self.0
            .lock()
            .map(|log| log.iter().filter(|(_, r)| *r == reason).count())
            .unwrap_or(0)
    }
}
