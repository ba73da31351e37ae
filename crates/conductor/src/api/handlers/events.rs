//! Runner-gateway event ingress.

use axum::{Json, extract::State, http::StatusCode};
use serde_json::json;
use tracing::instrument;

use conductor_protocol::IngestEventsRequest;

use crate::api::error::ApiResult;
use crate::api::state::AppState;

/// Append a batch of events to one session's log.
#[instrument(skip(state, request), fields(session_id = %request.session_id, events = request.events.len()))]
pub async fn ingest_events(
    State(state): State<AppState>,
    Json(request): Json<IngestEventsRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let sequences = state.sessions.ingest_events(request).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "sequences": sequences }))))
}
