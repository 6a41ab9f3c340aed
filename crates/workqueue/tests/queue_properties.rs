//! Property and concurrency tests for the work queue.
//!
//! Properties verified:
//! - Repeated adds of a key before it is dequeued yield one entry
//! - No key is held by two workers at once
//! - Backoff never shrinks without a forget, and resets after one
//! - Shutdown unblocks concurrent getters promptly and refuses new work

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use converge_core::ObjectKey;
use converge_workqueue::{ItemExponentialLimiter, RateLimiter, WorkQueue};
use proptest::prelude::*;

/// Test helper: Unwrap a Result or panic with context
fn unwrap_result<T, E: std::fmt::Display>(result: std::result::Result<T, E>, context: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{}: {}", context, e),
    }
}

fn key(i: u8) -> ObjectKey {
    ObjectKey::namespaced("default", format!("res-{i}"))
}

fn limited_queue() -> WorkQueue<ObjectKey> {
    WorkQueue::with_rate_limiter(
        "props",
        ItemExponentialLimiter::new(Duration::from_millis(5), Duration::from_secs(10)),
    )
}

// ==========================================================================
// PROPERTY: Dedupe
// ==========================================================================

proptest! {
    /// Property: the queue holds exactly one entry per distinct pending key.
    #[test]
    fn prop_adds_dedupe_to_distinct_keys(ids in proptest::collection::vec(0u8..16, 0..200)) {
        let queue = limited_queue();
        for id in &ids {
            queue.add(key(*id));
        }

        let distinct: HashSet<u8> = ids.iter().copied().collect();
        prop_assert_eq!(queue.len(), distinct.len());

        let stats = queue.stats();
        prop_assert_eq!(stats.adds as usize, distinct.len());
        prop_assert_eq!(stats.deduplicated as usize, ids.len().saturating_sub(distinct.len()));
    }

    /// Property: draining the queue returns every distinct key exactly once.
    #[test]
    fn prop_drain_yields_each_key_once(ids in proptest::collection::vec(0u8..16, 1..100)) {
        let rt = unwrap_result(
            tokio::runtime::Builder::new_current_thread().enable_all().build(),
            "runtime creation should succeed",
        );
        let queue = limited_queue();
        for id in &ids {
            queue.add(key(*id));
        }

        let expected: HashSet<ObjectKey> = ids.iter().map(|id| key(*id)).collect();
        let mut seen = HashSet::new();
        rt.block_on(async {
            while !queue.is_empty() {
                if let Some(item) = queue.get().await {
                    seen.insert(item);
                }
            }
        });

        prop_assert_eq!(seen, expected);
        prop_assert_eq!(queue.in_flight(), ids.iter().collect::<HashSet<_>>().len());
    }
}

// ==========================================================================
// PROPERTY: Backoff monotonicity
// ==========================================================================

proptest! {
    /// Property: consecutive delays without forget never decrease and never
    /// exceed the cap; after forget the next delay is the base.
    #[test]
    fn prop_backoff_monotonic_and_resets(
        base_ms in 1u64..50,
        cap_ms in 50u64..5_000,
        failures in 1usize..40,
    ) {
        let base = Duration::from_millis(base_ms);
        let cap = Duration::from_millis(cap_ms);
        let limiter = ItemExponentialLimiter::new(base, cap);
        let item = key(1);

        let delays: Vec<Duration> = (0..failures).map(|_| limiter.when(&item)).collect();
        for pair in delays.windows(2) {
            if let [earlier, later] = pair {
                prop_assert!(later >= earlier);
                prop_assert!(later > earlier || *later == cap);
            }
        }
        prop_assert!(delays.iter().all(|d| *d <= cap));
        prop_assert_eq!(limiter.num_requeues(&item) as usize, failures);

        limiter.forget(&item);
        prop_assert_eq!(limiter.when(&item), base);
    }
}

// ==========================================================================
// CONCURRENCY
// ==========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_key_is_processed_by_two_workers_at_once() {
    let queue = limited_queue();
    let active: Arc<Mutex<HashSet<ObjectKey>>> = Arc::new(Mutex::new(HashSet::new()));
    let violations = Arc::new(Mutex::new(0usize));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let queue = queue.clone();
            let active = Arc::clone(&active);
            let violations = Arc::clone(&violations);
            tokio::spawn(async move {
                while let Some(item) = queue.get().await {
                    let fresh = active
                        .lock()
                        .map(|mut set| set.insert(item.clone()))
                        .unwrap_or(false);
                    if !fresh {
                        if let Ok(mut v) = violations.lock() {
                            *v = v.saturating_add(1);
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    if let Ok(mut set) = active.lock() {
                        set.remove(&item);
                    }
                    queue.done(&item);
                }
            })
        })
        .collect();

    for round in 0..50u8 {
        for id in 0..4 {
            queue.add(key(id));
        }
        if round % 10 == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.shutdown();
    for worker in workers {
        let joined = tokio::time::timeout(Duration::from_secs(2), worker).await;
        assert!(joined.is_ok(), "worker should exit after shutdown");
    }

    assert_eq!(violations.lock().map(|v| *v).unwrap_or(usize::MAX), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_unblocks_concurrent_getters_promptly() {
    let queue = limited_queue();
    let getters: Vec<_> = (0..16)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.shutdown();
    queue.add(key(9));

    for getter in getters {
        let result = tokio::time::timeout(Duration::from_millis(500), getter).await;
        assert!(matches!(result, Ok(Ok(None))), "getter must see shutdown");
    }
    assert!(queue.is_empty(), "add after shutdown must not insert");
}

#[tokio::test(start_paused = true)]
async fn pending_backoff_timers_are_cancelled_by_shutdown() {
    let queue = limited_queue();
    queue.add_rate_limited(key(3));
    assert_eq!(queue.stats().waiting, 1);

    queue.shutdown();
    assert_eq!(queue.stats().waiting, 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(queue.is_empty());
}
