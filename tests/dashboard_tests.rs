
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use replay_commander::dashboard::{router, ApiState};
use replay_commander::ratelimit::LockManager;
use replay_commander::service::ReplayService;
use replay_commander::store::SharedStore;
use test_harness::{memory_store, FlakyStore, TestFleet};

/// Helper to create a test app over a fresh fleet
fn create_test_app(fleet: &TestFleet) -> Router {
    let service = ReplayService::new(fleet.commander.clone(), LockManager::new(fleet.store.clone()));
    router(ApiState::new(service))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let fleet = TestFleet::new();
    let (status, json) = send(create_test_app(&fleet), get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_submit_job_returns_id() {
    let fleet = TestFleet::new();
    let (status, json) = send(
        create_test_app(&fleet),
        post_json(
            "/api/jobs",
            json!({ "url": "https://replay/1", "sessionId": "s1", "priority": 3 }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = json["jobId"].as_str().unwrap();
    let pending = fleet.commander.find_pending_by_id(job_id).await.unwrap().unwrap();
    assert_eq!(pending.url, "https://replay/1");
    assert_eq!(pending.session_id.as_deref(), Some("s1"));
    assert_eq!(pending.priority, 3);
}

#[tokio::test]
async fn test_submit_empty_url_is_rejected() {
    let fleet = TestFleet::new();
    let (status, json) = send(
        create_test_app(&fleet),
        post_json("/api/jobs", json!({ "url": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("url"));
    assert_eq!(fleet.commander.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_batch_submit_and_status() {
    let fleet = TestFleet::new();
    let (status, json) = send(
        create_test_app(&fleet),
        post_json(
            "/api/jobs/batch",
            json!({ "urls": ["a", "b", ""], "sessionId": "batch" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["sessionId"], "batch");
    let ids: Vec<String> = json["jobIds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids.len(), 2);

    let (status, json) = send(
        create_test_app(&fleet),
        post_json("/api/jobs/status", json!({ "ids": [ids[0], "missing"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let reports = json.as_array().unwrap();
    assert_eq!(reports[0]["status"], "pending");
    assert_eq!(reports[1]["status"], "not_found");
}

#[tokio::test]
async fn test_job_status_endpoint() {
    let fleet = TestFleet::new();
    let id = fleet.commander.add_pending_job("u", None, 0).await.unwrap();

    let (status, json) = send(create_test_app(&fleet), get(&format!("/api/jobs/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], id);
    assert_eq!(json["status"], "pending");
    assert_eq!(json["progress"], 0);

    let (status, json) = send(create_test_app(&fleet), get("/api/jobs/unknown")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["status"], "not_found");
}

#[tokio::test]
async fn test_stats_endpoint() {
    let fleet = TestFleet::new();
    fleet.commander.add_pending_job("a", None, 0).await.unwrap();
    fleet.commander.add_pending_job("b", None, 0).await.unwrap();

    let (status, json) = send(create_test_app(&fleet), get("/api/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["pending"], 2);
    assert_eq!(json["waiting"], 0);
    assert_eq!(json["total"], 2);
}

#[tokio::test]
async fn test_agents_endpoint_reports_liveness() {
    let fleet = TestFleet::new();
    fleet.register("agent_fresh").await;
    let stale = fleet.register("agent_stale").await;
    fleet.age_heartbeat(&stale).await;

    let (status, json) = send(create_test_app(&fleet), get("/api/agents")).await;
    assert_eq!(status, StatusCode::OK);

    let agents = json.as_array().unwrap();
    assert_eq!(agents.len(), 2);
    let by_id = |id: &str| {
        agents
            .iter()
            .find(|a| a["agentId"] == id)
            .cloned()
            .unwrap()
    };
    assert_eq!(by_id("agent_fresh")["alive"], true);
    assert_eq!(by_id("agent_fresh")["status"], "idle");
    assert_eq!(by_id("agent_stale")["alive"], false);
    assert!(by_id("agent_stale")["heartbeatAgeMs"].as_u64().unwrap() >= 60_000);
}

#[tokio::test]
async fn test_store_outage_maps_to_service_unavailable() {
    let flaky = FlakyStore::new(memory_store());
    let store: SharedStore = flaky.clone();
    let fleet = TestFleet::on_store(store, Duration::ZERO);
    flaky.set_down(true);

    let (status, json) = send(create_test_app(&fleet), get("/api/stats")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json["error"].as_str().unwrap().contains("unavailable"));
}
