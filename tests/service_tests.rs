//! Submission deduplication, status lookup and queue statistics.


use std::time::Duration;

use serde_json::json;

use replay_commander::ratelimit::LockManager;
use replay_commander::scheduler::{Delivery, TickOutcome};
use replay_commander::service::ReplayService;
use replay_commander::store::SharedStore;
use replay_commander::worker::{ProcessOutcome, ScrapeError};
use test_harness::{memory_store, FlakyStore, MockFetcher, TestFleet};

fn service(fleet: &TestFleet) -> ReplayService {
    ReplayService::new(fleet.commander.clone(), LockManager::new(fleet.store.clone()))
}

#[tokio::test]
async fn test_duplicate_submission_returns_the_same_id() {
    let fleet = TestFleet::new();
    let service = service(&fleet);

    let first = service
        .add_replay_job("https://replay/1", Some("s"), 0)
        .await
        .unwrap();
    let second = service
        .add_replay_job("https://replay/1", Some("s"), 5)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(fleet.commander.pending_count().await.unwrap(), 1);
    assert!(fleet.commander.is_in_flight("https://replay/1").await.unwrap());
}

#[tokio::test]
async fn test_submission_of_assigned_url_returns_queue_job_id() {
    let fleet = TestFleet::new();
    let service = service(&fleet);
    fleet.register("agent_a").await;

    let id = service.add_replay_job("u", None, 0).await.unwrap();
    assert!(matches!(
        fleet.commander.assign_next().await.unwrap(),
        TickOutcome::Assigned { .. }
    ));

    assert_eq!(service.add_replay_job("u", None, 0).await.unwrap(), id);
}

#[tokio::test]
async fn test_url_awaiting_retry_is_not_submitted_again() {
    let fleet = TestFleet::new();
    let service = service(&fleet);
    let agent = fleet.agent(
        "agent_a",
        MockFetcher::scripted(vec![Err(ScrapeError::fatal("login wall"))]),
    );
    fleet.register("agent_a").await;

    service.add_replay_job("u", None, 0).await.unwrap();
    fleet.commander.assign_next().await.unwrap();
    assert!(matches!(
        agent.process_next().await.unwrap(),
        Some(ProcessOutcome::Failed { .. })
    ));
    assert!(fleet.commander.is_in_flight("u").await.unwrap());

    let requeued = fleet.commander.find_pending_by_url("u").await.unwrap().unwrap();
    assert_eq!(service.add_replay_job("u", None, 0).await.unwrap(), requeued.id);
    let pending = fleet.commander.pending_jobs().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].priority, 10);
}

#[tokio::test]
async fn test_marker_without_any_job_yields_placeholder_id() {
    let fleet = TestFleet::new();
    let service = service(&fleet);
    fleet.commander.mark_in_flight("u").await.unwrap();

    let id = service.add_replay_job("u", None, 0).await.unwrap();
    assert!(id.starts_with("existing_"));
    assert_eq!(fleet.commander.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_batch_submission_shares_session() {
    let fleet = TestFleet::new();
    let service = service(&fleet);
    let urls = vec!["a".to_string(), "b".to_string(), "c".to_string()];

    let ids = service
        .add_replay_jobs(&urls, Some("batch-1"), 0)
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);

    let pending = fleet.commander.pending_jobs().await.unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending
        .iter()
        .all(|job| job.session_id.as_deref() == Some("batch-1")));
}

#[tokio::test]
async fn test_status_of_pending_and_unknown_jobs() {
    let fleet = TestFleet::new();
    let service = service(&fleet);
    let id = service.add_replay_job("u", None, 0).await.unwrap();

    let pending = service.get_job_status(&id).await.unwrap();
    assert_eq!(pending.status, "pending");
    assert_eq!(pending.progress, 0);

    let missing = service.get_job_status("no-such-job").await.unwrap();
    assert_eq!(missing.status, "not_found");

    let reports = service
        .get_jobs_status(&[id.clone(), "no-such-job".to_string()])
        .await
        .unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].id, id);
    assert_eq!(reports[1].status, "not_found");
}

#[tokio::test]
async fn test_status_follows_queue_state() {
    let fleet = TestFleet::new();
    let service = service(&fleet);
    let agent = fleet.register("agent_a").await;
    let ok = service.add_replay_job("ok", None, 1).await.unwrap();
    let bad = service.add_replay_job("bad", None, 0).await.unwrap();

    fleet.commander.assign_next().await.unwrap();
    assert_eq!(service.get_job_status(&ok).await.unwrap().status, "waiting");

    assert!(matches!(
        fleet.queue().next_delivery(&agent).await.unwrap(),
        Some(Delivery::Owned(_))
    ));
    fleet.queue().update_progress(&ok, 20).await.unwrap();
    let active = service.get_job_status(&ok).await.unwrap();
    assert_eq!(active.status, "active");
    assert_eq!(active.progress, 20);

    fleet.queue().complete(&ok, json!({ "done": true })).await.unwrap();
    let done = service.get_job_status(&ok).await.unwrap();
    assert_eq!(done.status, "completed");
    assert_eq!(done.progress, 100);
    assert_eq!(done.result, Some(json!({ "done": true })));

    fleet.commander.registry().set_idle(&agent).await.unwrap();
    fleet.commander.assign_next().await.unwrap();
    fleet.queue().next_delivery(&agent).await.unwrap();
    fleet.queue().fail(&bad, "parser crashed", false).await.unwrap();
    let failed = service.get_job_status(&bad).await.unwrap();
    assert_eq!(failed.status, "failed");
    assert_eq!(failed.error.as_deref(), Some("parser crashed"));
    assert!(failed.result.is_none());
}

#[tokio::test]
async fn test_stats_count_every_state() {
    let fleet = TestFleet::new();
    let service = service(&fleet);
    fleet.register("agent_a").await;
    service.add_replay_job("a", None, 1).await.unwrap();
    service.add_replay_job("b", None, 0).await.unwrap();
    fleet.commander.assign_next().await.unwrap();

    let stats = service.get_queue_stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.total, 2);
}

#[tokio::test]
async fn test_submission_proceeds_when_lock_is_held_elsewhere() {
    let fleet = TestFleet::new();
    let service = service(&fleet);
    let other = LockManager::new(fleet.store.clone());
    assert!(other
        .acquire("submit:u", Duration::from_secs(30))
        .await
        .unwrap());

    let id = service.add_replay_job("u", None, 0).await.unwrap();
    assert!(fleet.commander.find_pending_by_id(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_submission_surfaces_store_outage() {
    let flaky = FlakyStore::new(memory_store());
    let store: SharedStore = flaky.clone();
    let fleet = TestFleet::on_store(store, Duration::ZERO);
    let service = service(&fleet);

    flaky.set_down(true);
    let err = service.add_replay_job("u", None, 0).await.unwrap_err();
    assert!(err.is_store_unavailable());
}
