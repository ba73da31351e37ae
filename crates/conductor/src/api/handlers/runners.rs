//! Runner-facing handlers: registration, heartbeat, long-poll, transition
//! reports, plus the operator listing.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use chrono::{DateTime, Utc};
use conductor_protocol::{
    ClaimedRun, CompleteRunRequest, FailRunRequest, HeartbeatRequest, RegisterRunnerRequest,
    RegisterRunnerResponse, RunnerReport, RunnerStatus,
};

use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::error::ERR_RUNNER_DISCONNECTED;
use crate::run::Run;

/// Register (or re-register) a runner.
#[instrument(skip(state, request), fields(hostname = %request.hostname, agents = request.agents.len()))]
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRunnerRequest>,
) -> ApiResult<(StatusCode, Json<RegisterRunnerResponse>)> {
    let response = state.registry.register(request).await?;
    info!(runner_id = %response.runner_id, "Runner registered");
    Ok((StatusCode::CREATED, Json(response)))
}

/// Liveness report.
#[instrument(skip(state, request), fields(runner_id = %request.runner_id))]
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<StatusCode> {
    state.registry.heartbeat(&request.runner_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Graceful unregister: same semantics as a heartbeat removal.
#[instrument(skip(state))]
pub async fn unregister(
    State(state): State<AppState>,
    Path(runner_id): Path<String>,
) -> ApiResult<StatusCode> {
    let removed = state.registry.remove(&runner_id).await?;
    for run in &removed.orphaned_runs {
        state
            .sessions
            .finalize_orphaned_run(run, ERR_RUNNER_DISCONNECTED)
            .await?;
    }
    info!(runner_id = %runner_id, orphaned = removed.orphaned_runs.len(), "Runner unregistered");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub runner_id: String,
}

/// Long-poll for the next claimable run. 204 when the window closes empty.
#[instrument(skip(state))]
pub async fn poll_runs(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> ApiResult<axum::response::Response> {
    use axum::response::IntoResponse;

    match state.dispatcher.long_poll(&query.runner_id).await? {
        Some(claimed) => Ok(Json::<ClaimedRun>(claimed).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// Runner confirms execution started.
#[instrument(skip(state, report))]
pub async fn run_running(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(report): Json<RunnerReport>,
) -> ApiResult<Json<Run>> {
    let run = state
        .sessions
        .mark_running(&run_id, &report.runner_id)
        .await?;
    Ok(Json(run))
}

/// Terminal success report.
#[instrument(skip(state, report))]
pub async fn run_completed(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(report): Json<CompleteRunRequest>,
) -> ApiResult<Json<Run>> {
    let run = state.sessions.complete_run(&run_id, report).await?;
    info!(run_id = %run.id, status = %run.status, "Run completed");
    Ok(Json(run))
}

/// Terminal failure report.
#[instrument(skip(state, report))]
pub async fn run_failed(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(report): Json<FailRunRequest>,
) -> ApiResult<Json<Run>> {
    let run = state
        .sessions
        .fail_run(&run_id, &report.runner_id, &report.error)
        .await?;
    info!(run_id = %run.id, status = %run.status, "Run failed");
    Ok(Json(run))
}

/// Operator listing shape for `GET /runners`.
#[derive(Debug, Serialize)]
pub struct RunnerSummary {
    pub id: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_dir: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_profile: Option<String>,
    pub status: RunnerStatus,
    pub agents: Vec<String>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// List registered runners for operators.
#[instrument(skip(state))]
pub async fn list_runners(State(state): State<AppState>) -> ApiResult<Json<Vec<RunnerSummary>>> {
    let runners = state
        .registry
        .list()
        .into_iter()
        .map(|info| {
            let mut agents: Vec<String> = info.agent_names.into_iter().collect();
            agents.sort();
            RunnerSummary {
                id: info.runner.id,
                hostname: info.runner.hostname,
                project_dir: info.runner.project_dir,
                tags: info.runner.tags,
                executor_profile: info.runner.executor_profile,
                status: info.runner.status,
                agents,
                last_heartbeat_at: info.runner.last_heartbeat_at,
            }
        })
        .collect();
    Ok(Json(runners))
}
