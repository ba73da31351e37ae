//! HTTP handlers, grouped by surface.

pub mod agents;
pub mod events;
pub mod runners;
pub mod runs;
pub mod sessions;

use axum::Json;
use serde_json::{Value, json};

/// Liveness endpoint.
pub async fn healthz() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
