//! Fleet-wide rate limiter behavior across many concurrent waiters.


use std::time::Duration;

use replay_commander::ratelimit::{Admission, FailOpenReason, LockManager, RateLimiter};
use replay_commander::scheduler::job::now_ms;
use replay_commander::store::{keys, SharedStore};
use test_harness::{fast_rate_limit, memory_store, FlakyStore};

fn limiter_on(store: &SharedStore, interval: Duration) -> RateLimiter {
    RateLimiter::new(store.clone(), fast_rate_limit(interval))
}

#[tokio::test]
async fn test_concurrent_grants_respect_min_interval() {
    let store = memory_store();
    let interval = Duration::from_millis(100);

    let mut handles = Vec::new();
    for i in 0..4 {
        // A separate limiter per task stands in for separate agent processes.
        let limiter = limiter_on(&store, interval);
        handles.push(tokio::spawn(async move {
            limiter.wait_for_next_slot(Some(&format!("job-{}", i))).await
        }));
    }

    let mut grants = Vec::new();
    for handle in handles {
        let ticket = handle.await.unwrap();
        assert_eq!(ticket.admission, Admission::Granted);
        grants.push(ticket.granted_at.unwrap());
    }
    grants.sort();

    for pair in grants.windows(2) {
        assert!(
            pair[1] - pair[0] >= 100,
            "grants {} and {} are closer than the interval",
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test]
async fn test_waiters_are_granted_in_reservation_order() {
    let store = memory_store();
    let limiter = limiter_on(&store, Duration::from_millis(50));

    for id in ["first", "second", "third"] {
        limiter.reserve(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Start the waits in reverse; queue order must still win.
    let mut handles = Vec::new();
    for id in ["third", "second", "first"] {
        let limiter = limiter_on(&store, Duration::from_millis(50));
        handles.push(tokio::spawn(async move {
            let ticket = limiter.wait_for_next_slot(Some(id)).await;
            (id, ticket.granted_at.unwrap())
        }));
    }

    let mut grants = Vec::new();
    for handle in handles {
        grants.push(handle.await.unwrap());
    }
    grants.sort_by_key(|(_, at)| *at);
    let order: Vec<&str> = grants.iter().map(|(id, _)| *id).collect();
    assert_eq!(order, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_slot_position_reflects_queue() {
    let store = memory_store();
    let limiter = limiter_on(&store, Duration::from_secs(10));

    limiter.reserve("a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    limiter.reserve("b").await.unwrap();

    assert_eq!(limiter.position("a").await.unwrap(), Some(0));
    assert_eq!(limiter.position("b").await.unwrap(), Some(1));

    assert!(limiter.cancel_reservation("a").await.unwrap());
    assert_eq!(limiter.position("b").await.unwrap(), Some(0));
    assert_eq!(limiter.position("a").await.unwrap(), None);
}

#[tokio::test]
async fn test_abandoned_reservation_does_not_block_the_queue() {
    let store = memory_store();
    let limiter = limiter_on(&store, Duration::ZERO);

    // Left behind by a crashed waiter long ago.
    let stale = (now_ms() - 60_000) as f64;
    store
        .zadd(keys::RESERVATIONS, stale, "crashed-holder")
        .await
        .unwrap();

    let ticket = limiter.wait_for_next_slot(Some("live")).await;
    assert_eq!(ticket.admission, Admission::Granted);
    assert_eq!(limiter.position("crashed-holder").await.unwrap(), None);
}

#[tokio::test]
async fn test_time_until_next_slot_counts_down() {
    let store = memory_store();
    let limiter = limiter_on(&store, Duration::from_secs(10));

    assert_eq!(limiter.time_until_next_slot().await.unwrap(), Duration::ZERO);
    let ticket = limiter.wait_for_next_slot(None).await;
    assert!(ticket.admission.is_granted());
    assert!(ticket.request_id.starts_with("req_"));

    let remaining = limiter.time_until_next_slot().await.unwrap();
    assert!(remaining > Duration::from_secs(9));
    assert!(!limiter.interval_elapsed().await.unwrap());
}

#[tokio::test]
async fn test_request_token_ignores_foreign_release() {
    let store = memory_store();
    let limiter = limiter_on(&store, Duration::ZERO);

    assert_eq!(
        limiter.acquire_request_token("worker_a").await,
        Admission::Granted
    );
    assert!(!limiter.release_request_token("worker_b").await.unwrap());
    assert_eq!(
        limiter.request_token_holder().await.unwrap().as_deref(),
        Some("worker_a")
    );

    assert!(limiter.release_request_token("worker_a").await.unwrap());
    assert!(limiter.request_token_holder().await.unwrap().is_none());
}

#[tokio::test]
async fn test_request_token_waiter_times_out_open() {
    let store = memory_store();
    let limiter = limiter_on(&store, Duration::ZERO);

    assert!(limiter.acquire_request_token("holder").await.is_granted());
    let admission = limiter.acquire_request_token("waiter").await;
    assert_eq!(admission, Admission::FailOpen(FailOpenReason::TimedOut));
}

#[tokio::test]
async fn test_request_token_handed_over_after_release() {
    let store = memory_store();
    let limiter = limiter_on(&store, Duration::ZERO);
    assert!(limiter.acquire_request_token("first").await.is_granted());

    let waiter = {
        let limiter = limiter_on(&store, Duration::ZERO);
        tokio::spawn(async move { limiter.acquire_request_token("second").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(limiter.release_request_token("first").await.unwrap());

    assert_eq!(waiter.await.unwrap(), Admission::Granted);
    assert_eq!(
        limiter.request_token_holder().await.unwrap().as_deref(),
        Some("second")
    );
}

#[tokio::test]
async fn test_exactly_one_concurrent_lock_acquirer_wins() {
    let store = memory_store();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let locks = LockManager::new(store.clone());
        handles.push(tokio::spawn(async move {
            locks
                .acquire("contended", Duration::from_secs(5))
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_request_gate_allows_one_per_interval() {
    let store = memory_store();
    let a = limiter_on(&store, Duration::from_millis(200));
    let b = limiter_on(&store, Duration::from_millis(200));

    assert!(a.can_make_request().await);
    assert!(!b.can_make_request().await);
    tokio::time::sleep(Duration::from_millis(220)).await;
    assert!(b.can_make_request().await);
}

#[tokio::test]
async fn test_request_gate_and_slot_queue_share_the_interval() {
    let store = memory_store();
    let gate = limiter_on(&store, Duration::from_millis(200));
    let queue = limiter_on(&store, Duration::from_millis(200));

    let ticket = queue.wait_for_next_slot(Some("job-1")).await;
    assert_eq!(ticket.admission, Admission::Granted);
    assert!(!gate.can_make_request().await);

    tokio::time::sleep(Duration::from_millis(220)).await;
    assert!(gate.can_make_request().await);
    let started = tokio::time::Instant::now();
    let ticket = queue.wait_for_next_slot(Some("job-2")).await;
    assert_eq!(ticket.admission, Admission::Granted);
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn test_login_retry_waits_for_its_interval() {
    let store = memory_store();
    let limiter = limiter_on(&store, Duration::ZERO);

    assert!(limiter.can_retry_login().await);
    assert!(!limiter.can_retry_login().await);

    let started = tokio::time::Instant::now();
    assert_eq!(limiter.wait_for_login_retry_slot().await, Admission::Granted);
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_store_outage_fails_open() {
    let flaky = FlakyStore::new(memory_store());
    let store: SharedStore = flaky.clone();
    let limiter = limiter_on(&store, Duration::from_secs(10));
    flaky.set_down(true);

    let ticket = limiter.wait_for_next_slot(Some("job-1")).await;
    assert_eq!(
        ticket.admission,
        Admission::FailOpen(FailOpenReason::StoreUnavailable)
    );
    assert!(ticket.granted_at.is_none());

    assert_eq!(
        limiter.acquire_request_token("worker_job-1").await,
        Admission::FailOpen(FailOpenReason::StoreUnavailable)
    );
    assert!(limiter.can_make_request().await);
    assert!(limiter.can_retry_login().await);
    assert_eq!(
        limiter.wait_for_login_retry_slot().await,
        Admission::FailOpen(FailOpenReason::StoreUnavailable)
    );
}

#[tokio::test]
async fn test_limiter_recovers_after_outage() {
    let flaky = FlakyStore::new(memory_store());
    let store: SharedStore = flaky.clone();
    let limiter = limiter_on(&store, Duration::ZERO);

    flaky.set_down(true);
    assert!(!limiter.wait_for_next_slot(Some("a")).await.admission.is_granted());

    flaky.set_down(false);
    let ticket = limiter.wait_for_next_slot(Some("b")).await;
    assert_eq!(ticket.admission, Admission::Granted);
}
