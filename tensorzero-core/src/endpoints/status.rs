use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::gateway_util::AppStateData;

pub const TENSORZERO_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Plain liveness check — no downstream calls.
pub async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// Liveness plus ClickHouse reachability, for an operator/orchestrator to poll.
pub async fn status_handler(State(app_state): State<AppStateData>) -> (StatusCode, Json<Value>) {
    match app_state.clickhouse.health().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "version": TENSORZERO_VERSION})),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "error", "message": err.to_string()})),
        ),
    }
}
