use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Aggregate readiness/liveness probe, backing `/health`, `/live`, and
/// `/ready` (spec §6). `/live` only answers "is the process alive"; `/ready`
/// and `/health` additionally report whether the gateway is draining.
fn status_response(healthy: bool, checks: Value) -> (StatusCode, Json<Value>) {
    let status = if healthy { "healthy" } else { "unhealthy" };
    let code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(json!({ "status": status, "checks": checks })))
}

pub async fn live() -> (StatusCode, Json<Value>) {
    status_response(true, json!({ "process": "up" }))
}

pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let healthy = !state.is_shutting_down();
    status_response(
        healthy,
        json!({
            "accepting_upgrades": healthy,
            "connections": state.manager.len().await,
        }),
    )
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let healthy = !state.is_shutting_down();
    status_response(
        healthy,
        json!({
            "connections": state.manager.len().await,
            "online_users": state.hub.online_users().await.len(),
        }),
    )
}
