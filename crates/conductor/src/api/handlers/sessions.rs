//! Session read handlers: summary, result, event replay, and the SSE
//! stream.

use axum::{
    Json,
    extract::{Path, Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tracing::instrument;

use conductor_protocol::{EventEnvelope, EventPayload};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::error::CoordinatorError;
use crate::run::Run;
use crate::session::Session;

/// List sessions.
#[instrument(skip(state))]
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<Session>>> {
    Ok(Json(state.sessions.list_sessions().await?))
}

/// Session summary.
#[instrument(skip(state))]
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.sessions.get_session(&session_id).await?))
}

/// Runs of a session, in run-number order.
#[instrument(skip(state))]
pub async fn session_runs(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Vec<Run>>> {
    Ok(Json(state.sessions.session_runs(&session_id).await?))
}

/// The session's terminal result. 404 until one exists.
#[instrument(skip(state))]
pub async fn session_result(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    match state.sessions.session_result(&session_id).await? {
        Some(result) => Ok(Json(json!({
            "result_text": result.result_text,
            "result_data": result.result_data,
        }))),
        None => Err(ApiError::Coordinator(CoordinatorError::RunNotFound(format!(
            "session {} has no terminal result",
            session_id
        )))),
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: i64,
}

/// Replay persisted events from a sequence number.
#[instrument(skip(state))]
pub async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<EventEnvelope>>> {
    Ok(Json(
        state
            .sessions
            .session_events(&session_id, query.since)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Replay persisted events after this sequence before going live.
    #[serde(default)]
    pub since: Option<i64>,
}

/// Server-pushed event stream (SSE). Subscribes first, then replays the
/// persisted backlog, deduplicating on sequence so the consumer sees a
/// strict append-order prefix extension.
#[instrument(skip(state))]
pub async fn stream_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    state.sessions.get_session(&session_id).await?;

    // Subscribe before reading the backlog so nothing falls in between.
    let rx = state.sessions.events().subscribe(Some(session_id.clone()));

    let replay = match query.since {
        Some(since) => state.sessions.session_events(&session_id, since).await?,
        None => Vec::new(),
    };
    let replayed_up_to = replay.last().map(|e| e.sequence).unwrap_or(i64::MIN);

    let live = ReceiverStream::new(rx).filter(move |envelope: &EventEnvelope| {
        let keep = matches!(envelope.payload, EventPayload::Gap { .. })
            || envelope.sequence > replayed_up_to;
        futures::future::ready(keep)
    });

    let stream = futures::stream::iter(replay).chain(live).map(|envelope| {
        let event = SseEvent::default().event(envelope.payload.event_type());
        Ok::<_, Infallible>(match event.json_data(&envelope) {
            Ok(event) => event,
            // Serialization of our own envelope cannot fail in practice;
            // degrade to an empty payload rather than killing the stream.
            Err(_) => SseEvent::default().data("{}"),
        })
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
