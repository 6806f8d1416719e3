use axum::{
    extract::{Query, State},
    Json,
};
use serde::Serialize;

use crate::handlers::{ErrorResponse, SuccessResponse, TargetQuery};
use crate::state::AppState;
use common::models::{JobSubmission, RemoveSubmission, ScheduleListing};

/// Acknowledgement returned by mutating schedule routes
#[derive(Debug, Serialize)]
pub struct ScheduleAck {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Add a job: upsert a scheduler for `repeat`/`delay`, enqueue for `now`
#[tracing::instrument(skip(state, body))]
pub async fn add_job(
    State(state): State<AppState>,
    Query(query): Query<TargetQuery>,
    Json(body): Json<JobSubmission>,
) -> Result<SuccessResponse<ScheduleAck>, ErrorResponse> {
    let target = state.target(query.target.as_deref())?;
    let request = body.into_request()?;

    let identity = state.scheduler.add(target, request).await?;

    Ok(SuccessResponse::new(ScheduleAck {
        message: "Job added successfully".to_string(),
        key: Some(identity.to_string()),
    }))
}

/// Replace the scheduler at `key` with a new trigger
#[tracing::instrument(skip(state, body))]
pub async fn update_job(
    State(state): State<AppState>,
    Query(query): Query<TargetQuery>,
    Json(body): Json<JobSubmission>,
) -> Result<SuccessResponse<ScheduleAck>, ErrorResponse> {
    let target = state.target(query.target.as_deref())?;
    let (key, request) = body.into_update()?;

    let identity = state.scheduler.update(target, &key, request).await?;

    Ok(SuccessResponse::new(ScheduleAck {
        message: "Job updated successfully".to_string(),
        key: Some(identity.to_string()),
    }))
}

#[tracing::instrument(skip(state, body))]
pub async fn remove_job(
    State(state): State<AppState>,
    Query(query): Query<TargetQuery>,
    Json(body): Json<RemoveSubmission>,
) -> Result<SuccessResponse<ScheduleAck>, ErrorResponse> {
    let target = state.target(query.target.as_deref())?;
    let (queue_name, key) = body.validate()?;

    state.scheduler.remove(target, &queue_name, &key).await?;

    Ok(SuccessResponse::new(ScheduleAck {
        message: "Job removed successfully".to_string(),
        key: None,
    }))
}

/// Jobs and live schedulers of every queue; stale schedulers are reaped
#[tracing::instrument(skip(state))]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<TargetQuery>,
) -> Result<SuccessResponse<ScheduleListing>, ErrorResponse> {
    let target = state.target(query.target.as_deref())?;
    let listing = state.scheduler.list(target).await?;
    Ok(SuccessResponse::new(listing))
}
