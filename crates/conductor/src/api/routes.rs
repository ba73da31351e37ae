//! API route definitions.

use axum::{
    Router, middleware,
    routing::{delete, get, post, put},
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::auth::auth_middleware;

use super::handlers;
use super::handlers::{agents, events, runners, runs, sessions};
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    let auth_state = state.auth.clone();

    let protected = Router::new()
        // Run CRUD
        .route("/runs", post(runs::create_run).get(runs::list_runs))
        .route("/runs/{run_id}", get(runs::get_run))
        .route("/runs/{run_id}/stop", post(runs::stop_run))
        // Sessions
        .route("/sessions", get(sessions::list_sessions))
        .route("/sessions/{session_id}", get(sessions::get_session))
        .route("/sessions/{session_id}/runs", get(sessions::session_runs))
        .route("/sessions/{session_id}/result", get(sessions::session_result))
        .route("/sessions/{session_id}/events", get(sessions::session_events))
        .route("/sessions/{session_id}/stream", get(sessions::stream_session))
        // Blueprint admin
        .route("/agents", get(agents::list_agents).post(agents::create_agent))
        .route(
            "/agents/{name}",
            get(agents::get_agent)
                .put(agents::put_agent)
                .delete(agents::delete_agent),
        )
        .route("/mcp-servers", get(agents::list_mcp_servers))
        .route(
            "/mcp-servers/{id}",
            put(agents::put_mcp_server).delete(agents::delete_mcp_server),
        )
        // Runner endpoints
        .route("/runner/register", post(runners::register))
        .route("/runner/heartbeat", post(runners::heartbeat))
        .route("/runner/{runner_id}", delete(runners::unregister))
        .route("/runner/runs", get(runners::poll_runs))
        .route("/runner/runs/{run_id}/running", post(runners::run_running))
        .route("/runner/runs/{run_id}/completed", post(runners::run_completed))
        .route("/runner/runs/{run_id}/failed", post(runners::run_failed))
        // Event ingress
        .route("/events", post(events::ingest_events))
        // Operator surface
        .route("/runners", get(runners::list_runners))
        .layer(middleware::from_fn_with_state(auth_state, auth_middleware));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .merge(protected)
        .layer(trace_layer)
        .with_state(state)
}
