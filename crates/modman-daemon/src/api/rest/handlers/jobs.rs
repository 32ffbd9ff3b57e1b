//! Job handlers

use super::parse_job_id;
use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use modman_types::{Job, JobFilter};

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(filter): Query<JobFilter>,
) -> Json<Vec<Job>> {
    Json(state.manager.list_jobs(&filter))
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Job>> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.manager.get_job(&id)?))
}

/// Request cancellation; the job stops at its next cancellation point
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    let id = parse_job_id(&id)?;
    state.manager.cancel_job(&id)?;
    Ok(Json(state.manager.get_job(&id)?))
}
