use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// Liveness check. Never touches a store, so a dead tunnel does not fail it.
#[tracing::instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "defaultTarget": state.config.server.default_target,
            "queues": state.config.queues.names,
        })),
    )
}
