mod common;

use common::{config_with, events, lock_manager, memory_backends};
use resilience_core::cache::{jitter_bounds, CacheLayer, CacheTier};
use resilience_core::config::ConfigHandle;
use resilience_core::kv::KvProvider;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn cache_over(providers: &[Arc<KvProvider>], config: ConfigHandle) -> CacheLayer {
    CacheLayer::from_config(
        config,
        providers,
        Some(lock_manager(providers.to_vec())),
        events(),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_fill_once() {
    let (_memories, providers) = memory_backends(3);
    let cache = Arc::new(cache_over(&providers, config_with(|_| {})));
    let fills = Arc::new(AtomicUsize::new(0));

    let callers: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            let fills = fills.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fill("holidays", "2025", || async move {
                        fills.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Some(json!(["2025-01-01", "2025-12-25"])))
                    })
                    .await
                    .unwrap()
            })
        })
        .collect();

    for caller in callers {
        assert_eq!(
            caller.await.unwrap(),
            Some(json!(["2025-01-01", "2025-12-25"]))
        );
    }
    assert_eq!(fills.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().fills, 1);
}

#[tokio::test]
async fn test_ttl_jitter_stays_within_bounds() {
    let (memories, providers) = memory_backends(1);
    let cache = cache_over(
        &providers,
        config_with(|c| {
            c.cache.memory.enabled = false;
            c.cache.ttl_jitter_factor = 0.2;
        }),
    );
    let ttl = Duration::from_secs(100);
    let (low, high) = jitter_bounds(ttl, 0.2);

    let mut ttls = Vec::with_capacity(1_000);
    for i in 0..1_000 {
        let key = format!("user-{i}");
        cache
            .set("profiles", &key, Some(json!(i)), Some(ttl))
            .await
            .unwrap();
        let stored = memories[0].ttl(&cache.full_key("profiles", &key)).unwrap();
        assert!(stored <= high, "{stored:?} above {high:?}");
        assert!(stored + Duration::from_secs(1) >= low, "{stored:?} below {low:?}");
        ttls.push(stored);
    }

    let (min, max) = (ttls.iter().min().unwrap(), ttls.iter().max().unwrap());
    assert!(*max - *min > Duration::from_secs(1));
}

#[tokio::test]
async fn test_tombstone_suppresses_fill_until_expiry() {
    let (_memories, providers) = memory_backends(3);
    let cache = cache_over(&providers, config_with(|_| {}));
    let fills = AtomicUsize::new(0);

    cache
        .set("users", "ghost", None, Some(Duration::from_millis(100)))
        .await
        .unwrap();

    let value = cache
        .get_or_fill("users", "ghost", || async {
            fills.fetch_add(1, Ordering::SeqCst);
            Ok(Some(json!("found")))
        })
        .await
        .unwrap();
    assert_eq!(value, None);
    assert_eq!(fills.load(Ordering::SeqCst), 0);
    assert_eq!(cache.stats().tombstone_hits, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let value = cache
        .get_or_fill("users", "ghost", || async {
            fills.fetch_add(1, Ordering::SeqCst);
            Ok(Some(json!("found")))
        })
        .await
        .unwrap();
    assert_eq!(value, Some(json!("found")));
    assert_eq!(fills.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_remote_hit_backfills_memory() {
    let (_memories, providers) = memory_backends(1);
    let config = config_with(|_| {});
    let writer = cache_over(&providers, config.clone());
    writer
        .set("settings", "theme", Some(json!("dark")), None)
        .await
        .unwrap();

    // A second process shares the remote tier but starts with a cold memory tier
    let reader = cache_over(&providers, config);
    let lookup = reader.lookup("settings", "theme").await.unwrap();
    assert_eq!(lookup.tier(), Some(CacheTier::Remote));

    let lookup = reader.lookup("settings", "theme").await.unwrap();
    assert_eq!(lookup.tier(), Some(CacheTier::Memory));
    assert_eq!(lookup.into_value(), Some(json!("dark")));
}

#[tokio::test]
async fn test_disk_tier_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (_memories, providers) = memory_backends(1);
    let config = config_with(|c| {
        c.cache.remote.enabled = false;
        c.cache.disk.enabled = true;
        c.cache.disk.directory = dir.path().to_path_buf();
    });

    let first = cache_over(&providers, config.clone());
    first
        .set("holidays", "2025", Some(json!(["2025-01-01"])), None)
        .await
        .unwrap();
    drop(first);

    let second = cache_over(&providers, config);
    let lookup = second.lookup("holidays", "2025").await.unwrap();
    assert_eq!(lookup.tier(), Some(CacheTier::Disk));
    assert_eq!(lookup.into_value(), Some(json!(["2025-01-01"])));
}
