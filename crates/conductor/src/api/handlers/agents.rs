//! Blueprint admin handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, instrument};

use conductor_protocol::{AgentBlueprint, AgentType};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::error::CoordinatorError;

/// Listing shape for `GET /agents`.
#[derive(Debug, Serialize)]
pub struct AgentSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters_schema: Option<Value>,
    /// Declaring runner for runner-declared blueprints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<String>,
}

/// List agents (effective view: admin-owned wins over runner-declared).
#[instrument(skip(state))]
pub async fn list_agents(State(state): State<AppState>) -> ApiResult<Json<Vec<AgentSummary>>> {
    let agents = state
        .agents
        .list_effective()
        .await?
        .into_iter()
        .map(|stored| AgentSummary {
            name: stored.blueprint.name.clone(),
            agent_type: stored.blueprint.agent_type,
            description: stored.blueprint.description.clone(),
            parameters_schema: stored.blueprint.effective_parameters_schema(),
            runner_id: stored.runner_id,
        })
        .collect();
    Ok(Json(agents))
}

/// Full blueprint for one agent.
#[instrument(skip(state))]
pub async fn get_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<AgentBlueprint>> {
    let stored = state.agents.get_effective(&name).await?;
    Ok(Json(stored.blueprint))
}

/// Create an admin-owned blueprint.
#[instrument(skip(state, blueprint), fields(name = %blueprint.name))]
pub async fn create_agent(
    State(state): State<AppState>,
    Json(blueprint): Json<AgentBlueprint>,
) -> ApiResult<(StatusCode, Json<AgentBlueprint>)> {
    if state.agents.get_admin(&blueprint.name).await?.is_some() {
        return Err(ApiError::Coordinator(CoordinatorError::InvalidRequest(
            format!("agent '{}' already exists; use PUT to update", blueprint.name),
        )));
    }

    let stored = state.agents.upsert_admin(blueprint).await?;
    info!(name = %stored.blueprint.name, "Created agent blueprint");
    Ok((StatusCode::CREATED, Json(stored.blueprint)))
}

/// Create or update an admin-owned blueprint.
#[instrument(skip(state, blueprint))]
pub async fn put_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut blueprint): Json<AgentBlueprint>,
) -> ApiResult<Json<AgentBlueprint>> {
    if blueprint.name.is_empty() {
        blueprint.name = name.clone();
    } else if blueprint.name != name {
        return Err(ApiError::Coordinator(CoordinatorError::InvalidRequest(
            format!("body name '{}' does not match path '{}'", blueprint.name, name),
        )));
    }

    let stored = state.agents.upsert_admin(blueprint).await?;
    info!(name = %name, "Updated agent blueprint");
    Ok(Json(stored.blueprint))
}

/// Delete an admin-owned blueprint.
#[instrument(skip(state))]
pub async fn delete_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.agents.delete_admin(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// List MCP server definitions.
#[instrument(skip(state))]
pub async fn list_mcp_servers(
    State(state): State<AppState>,
) -> ApiResult<Json<HashMap<String, Value>>> {
    Ok(Json(state.agents.list_mcp_servers()))
}

/// Create or update an MCP server definition.
#[instrument(skip(state, definition))]
pub async fn put_mcp_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(definition): Json<Value>,
) -> ApiResult<Json<Value>> {
    state.agents.upsert_mcp_server(&id, definition.clone())?;
    info!(id = %id, "Updated MCP server definition");
    Ok(Json(definition))
}

/// Delete an MCP server definition.
#[instrument(skip(state))]
pub async fn delete_mcp_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.agents.delete_mcp_server(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
