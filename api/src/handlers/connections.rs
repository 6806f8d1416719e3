use axum::extract::State;

use crate::handlers::SuccessResponse;
use crate::state::AppState;
use common::connection::ConnectionStatus;

/// Lifecycle state of the connection to every target
#[tracing::instrument(skip(state))]
pub async fn list_connections(State(state): State<AppState>) -> SuccessResponse<Vec<ConnectionStatus>> {
    SuccessResponse::new(state.connections.status().await)
}
