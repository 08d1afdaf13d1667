//! Concurrent lock sets over overlapping paths

use bulkport_common::ResourcePath;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulkport_worker::config::LockConfig;
use bulkport_worker::lock::{LockError, LockManager, MemoryLockStore};

fn paths(raw: &[&str]) -> Vec<ResourcePath> {
    raw.iter().map(|p| ResourcePath::parse(p).unwrap()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_sets_never_run_together() {
    let config = LockConfig {
        acquire_timeout_ms: 20_000,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..LockConfig::default()
    };
    let locks = LockManager::new(Arc::new(MemoryLockStore::new(128)), config);
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    // Same set in both input orders, plus the common ancestor alone
    let sets = [
        vec!["/shop/a", "/shop/b"],
        vec!["/shop/b", "/shop/a"],
        vec!["/shop"],
        vec!["/shop/b/c", "/shop/a", "/shop/b"],
    ];

    let mut tasks = Vec::new();
    for (n, set) in sets.iter().cycle().take(8).enumerate() {
        let locks = locks.clone();
        let inside = inside.clone();
        let peak = peak.clone();
        let set = paths(set);

        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                let options = locks.default_options();
                locks
                    .with_locks("catalog", set.clone(), &options, || async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2 + n as u64 % 3)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, LockError>(())
                    })
                    .await
                    .unwrap();
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(inside.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disjoint_branches_run_concurrently() {
    let config = LockConfig {
        acquire_timeout_ms: 100,
        ..LockConfig::default()
    };
    let locks = LockManager::new(Arc::new(MemoryLockStore::new(16)), config);
    let options = locks.default_options();

    let left = locks
        .acquire_many("catalog", paths(&["/shop/a"]), &options)
        .await
        .unwrap();
    let right = locks
        .acquire_many("catalog", paths(&["/shop/b/c"]), &options)
        .await
        .unwrap();

    let blocked = locks.acquire_many("catalog", paths(&["/shop"]), &options).await;
    assert!(matches!(blocked, Err(ref e) if e.is_busy()));

    left.release().await;
    right.release().await;
    locks
        .acquire_many("catalog", paths(&["/shop"]), &options)
        .await
        .unwrap()
        .release()
        .await;
}
