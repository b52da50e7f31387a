use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::CommanderError;
use crate::scheduler::job::now_ms;
use crate::scheduler::registry::{AgentRecord, AgentRegistry, AgentStatus};
use crate::service::ReplayService;

#[derive(Clone)]
pub struct ApiState {
    pub service: ReplayService,
    pub registry: AgentRegistry,
}

impl ApiState {
    pub fn new(service: ReplayService) -> Self {
        let registry = service.commander().registry().clone();
        Self { service, registry }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobRequest {
    url: String,
    session_id: Option<String>,
    #[serde(default)]
    priority: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobsRequest {
    urls: Vec<String>,
    session_id: Option<String>,
    #[serde(default)]
    priority: i64,
}

#[derive(Deserialize)]
struct JobsStatusRequest {
    ids: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobResponse {
    job_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitJobsResponse {
    job_ids: Vec<String>,
    session_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentResponse {
    agent_id: String,
    status: AgentStatus,
    job_id: Option<String>,
    last_heartbeat: i64,
    heartbeat_age_ms: u64,
    alive: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Maps crate errors onto HTTP status codes.
struct ApiError(CommanderError);

impl From<CommanderError> for ApiError {
    fn from(e: CommanderError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_store_unavailable() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        tracing::error!(error = %self.0, "API request failed");
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/jobs", post(submit_job_handler))
        .route("/api/jobs/batch", post(submit_jobs_handler))
        .route("/api/jobs/status", post(jobs_status_handler))
        .route("/api/jobs/:id", get(job_status_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/agents", get(agents_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_api(addr: SocketAddr, state: ApiState, cancel: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting API server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "API server failed");
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn submit_job_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitJobRequest>,
) -> Result<Response, ApiError> {
    if payload.url.trim().is_empty() {
        return Ok(bad_request("url must not be empty"));
    }
    let job_id = state
        .service
        .add_replay_job(
            payload.url.trim(),
            payload.session_id.as_deref(),
            payload.priority,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })).into_response())
}

async fn submit_jobs_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitJobsRequest>,
) -> Result<Response, ApiError> {
    let urls: Vec<String> = payload
        .urls
        .iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect();
    if urls.is_empty() {
        return Ok(bad_request("urls must contain at least one url"));
    }
    let job_ids = state
        .service
        .add_replay_jobs(&urls, payload.session_id.as_deref(), payload.priority)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobsResponse {
            job_ids,
            session_id: payload.session_id,
        }),
    )
        .into_response())
}

async fn job_status_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let report = state.service.get_job_status(&id).await?;
    let status = if report.status == "not_found" {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)).into_response())
}

async fn jobs_status_handler(
    State(state): State<ApiState>,
    Json(payload): Json<JobsStatusRequest>,
) -> Result<Response, ApiError> {
    let reports = state.service.get_jobs_status(&payload.ids).await?;
    Ok(Json(reports).into_response())
}

async fn stats_handler(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let stats = state.service.get_queue_stats().await?;
    Ok(Json(stats).into_response())
}

async fn agents_handler(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let now = now_ms();
    let timeout = state.registry.heartbeat_timeout();
    let agents: Vec<AgentResponse> = state
        .registry
        .list()
        .await?
        .into_iter()
        .map(|record: AgentRecord| AgentResponse {
            alive: record.is_alive(timeout, now),
            heartbeat_age_ms: record.heartbeat_age(now).as_millis() as u64,
            agent_id: record.agent_id.to_string(),
            status: record.status,
            job_id: record.job_id,
            last_heartbeat: record.last_heartbeat,
        })
        .collect();
    Ok(Json(agents).into_response())
}
