use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::handlers::{ErrorResponse, SuccessResponse};
use crate::state::AppState;
use common::errors::ValidationError;

#[derive(Debug, Deserialize)]
pub struct InspectQuery {
    /// Glob pattern of keys to read
    pub key: Option<String>,
    pub target: Option<String>,
}

/// Read every string key matching `key` on the target store
#[tracing::instrument(skip(state))]
pub async fn inspect_keys(
    State(state): State<AppState>,
    Query(query): Query<InspectQuery>,
) -> Result<SuccessResponse<BTreeMap<String, Value>>, ErrorResponse> {
    let target = state.target(query.target.as_deref())?;
    let pattern = match query.key.as_deref().map(str::trim) {
        Some(pattern) if !pattern.is_empty() => pattern.to_string(),
        _ => return Err(ValidationError::MissingField("key".to_string()).into()),
    };

    let data = state.inspector.inspect(target, &pattern).await?;
    Ok(SuccessResponse::new(data))
}
