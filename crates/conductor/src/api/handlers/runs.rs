//! Run CRUD handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, instrument};

use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::run::{Run, RunStatus, RunType};
use crate::session::{CreateRunParams, ExecutionMode};

/// Wire body for `POST /runs`.
#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    #[serde(rename = "type")]
    pub run_type: RunType,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub scope: Option<HashMap<String, String>>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub execution_mode: Option<ExecutionMode>,
    /// Display name for a newly created session.
    #[serde(default)]
    pub name: Option<String>,
}

fn default_parameters() -> Value {
    Value::Object(Default::default())
}

/// Create a run.
#[instrument(skip(state, request), fields(agent_name = ?request.agent_name))]
pub async fn create_run(
    State(state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> ApiResult<(StatusCode, Json<Run>)> {
    let run = state
        .sessions
        .create_run(CreateRunParams {
            run_type: request.run_type,
            agent_name: request.agent_name,
            parameters: request.parameters,
            session_id: request.session_id,
            scope: request.scope,
            context: request.context,
            execution_mode: request.execution_mode,
            session_name: request.name,
        })
        .await?;

    info!(run_id = %run.id, session_id = %run.session_id, "Created run");
    Ok((StatusCode::CREATED, Json(run)))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// List runs with optional filters.
#[instrument(skip(state))]
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    let runs = state
        .sessions
        .list_runs(query.status, query.session_id.as_deref())
        .await?;
    Ok(Json(runs))
}

/// Read one run.
#[instrument(skip(state))]
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Run>> {
    Ok(Json(state.sessions.get_run(&run_id).await?))
}

/// Request cancellation.
#[instrument(skip(state))]
pub async fn stop_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Run>> {
    let run = state.sessions.stop_run(&run_id).await?;
    info!(run_id = %run.id, status = %run.status, "Stop requested");
    Ok(Json(run))
}
