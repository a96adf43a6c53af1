mod common;

use common::{lock_manager, memory_backends};
use resilience_core::kv::{KvProvider, KvStore, MemoryKvBackend};
use resilience_core::lock::{AcquireOptions, LockMode};
use resilience_core::ResilienceError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_holders_never_overlap() {
    let (_memories, providers) = memory_backends(3);
    let manager = lock_manager(providers);
    let inside = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let inside = inside.clone();
            let max_seen = max_seen.clone();
            let completed = completed.clone();
            tokio::spawn(async move {
                let opts = AcquireOptions::new()
                    .with_retry_count(500)
                    .with_retry_delay(Duration::from_millis(5))
                    .with_retry_jitter(Duration::from_millis(5));
                manager
                    .with_lock("counter", Duration::from_secs(2), opts, |_lock| async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        completed.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            })
        })
        .collect();

    for worker in workers {
        worker.await.unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 8);
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert!(!manager.is_locked("counter").await);
}

#[tokio::test]
async fn test_minority_outage_still_reaches_quorum() {
    let (memories, providers) = memory_backends(3);
    let manager = lock_manager(providers);
    memories[2].set_available(false);

    let lock = manager
        .acquire("digest", Duration::from_secs(1), AcquireOptions::new())
        .await
        .unwrap();
    assert_eq!(lock.mode(), LockMode::Quorum);
    assert_eq!(lock.held_instances().len(), 2);
    assert!(manager.release(&lock).await);
}

#[tokio::test]
async fn test_majority_outage_fails_with_quorum_error() {
    let (memories, providers) = memory_backends(3);
    let manager = lock_manager(providers);
    memories[0].set_available(false);
    memories[1].set_available(false);

    let err = manager
        .acquire(
            "digest",
            Duration::from_secs(1),
            AcquireOptions::new().with_retry_count(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::QuorumNotMet { .. }));
    // The partial acquisition on the healthy instance was rolled back
    assert!(memories[2].is_empty());
}

#[tokio::test]
async fn test_total_outage_falls_back_to_process_memory() {
    let (memories, providers) = memory_backends(3);
    let manager = lock_manager(providers);
    for memory in &memories {
        memory.set_available(false);
    }

    let lock = manager
        .acquire("digest", Duration::from_secs(1), AcquireOptions::new())
        .await
        .unwrap();
    assert_eq!(lock.mode(), LockMode::Memory);

    let contender = manager
        .acquire(
            "digest",
            Duration::from_secs(1),
            AcquireOptions::new().with_retry_count(0),
        )
        .await;
    assert!(contender.is_err());
    assert!(manager.release(&lock).await);
}

#[tokio::test]
async fn test_expired_lease_can_be_taken_over() {
    let (_memories, providers) = memory_backends(3);
    let manager = lock_manager(providers);

    let first = manager
        .acquire("digest", Duration::from_millis(100), AcquireOptions::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!first.is_valid());

    let second = manager
        .acquire("digest", Duration::from_secs(1), AcquireOptions::new())
        .await
        .unwrap();
    // The stale holder cannot delete the new owner's token
    assert!(!manager.release(&first).await);
    assert!(manager.is_locked("digest").await);
    assert!(manager.release(&second).await);
}

#[tokio::test]
async fn test_total_outage_does_not_grant_second_holder_in_process() {
    let (memories, providers) = memory_backends(3);
    let manager = lock_manager(providers);

    let held = manager
        .acquire("orders", Duration::from_secs(30), AcquireOptions::new())
        .await
        .unwrap();
    assert_eq!(held.mode(), LockMode::Quorum);

    for memory in &memories {
        memory.set_available(false);
    }
    let err = manager
        .acquire(
            "orders",
            Duration::from_secs(30),
            AcquireOptions::new().with_retry_count(0),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::QuorumNotMet { .. }));
    assert!(held.is_valid());

    // Instances are down, so the remote release cannot confirm ownership
    assert!(!manager.release(&held).await);
    let fallback = manager
        .acquire("orders", Duration::from_secs(30), AcquireOptions::new())
        .await
        .unwrap();
    assert_eq!(fallback.mode(), LockMode::Memory);
    assert!(manager.release(&fallback).await);
}

#[tokio::test]
async fn test_release_after_backend_swap_clears_removed_instance() {
    let (memories, providers) = memory_backends(3);
    let manager = lock_manager(providers.clone());

    let lock = manager
        .acquire("orders", Duration::from_secs(30), AcquireOptions::new())
        .await
        .unwrap();

    let replacement = MemoryKvBackend::new("kv-3");
    manager.set_backends(vec![
        providers[0].clone(),
        providers[1].clone(),
        Arc::new(KvProvider::from(replacement.clone())),
    ]);

    assert!(manager.release(&lock).await);
    for memory in &memories {
        assert_eq!(memory.get("lock:orders").await.unwrap(), None);
    }
    assert_eq!(replacement.get("lock:orders").await.unwrap(), None);
}

#[tokio::test]
async fn test_renewal_after_backend_swap_extends_original_instances() {
    let (memories, providers) = memory_backends(3);
    let manager = lock_manager(providers.clone());

    let lock = manager
        .acquire("orders", Duration::from_millis(600), AcquireOptions::new())
        .await
        .unwrap();
    manager.set_backends(vec![
        providers[0].clone(),
        Arc::new(KvProvider::from(MemoryKvBackend::new("kv-4"))),
    ]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    manager.renew(&lock).await.unwrap();
    assert_eq!(lock.held_instances().len(), 3);
    for memory in &memories {
        assert!(memory.ttl("lock:orders").unwrap() > Duration::from_millis(500));
    }
    assert!(manager.release(&lock).await);
}
