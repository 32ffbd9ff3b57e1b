//! Batch deployment handlers

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{extract::State, http::StatusCode, Json};
use modman_deployment::BatchSubmission;
use modman_types::DepFilter;
use serde::Deserialize;

/// Batch request: a deployment selection plus options
#[derive(Debug, Default, Deserialize)]
pub struct BatchRequest {
    #[serde(flatten)]
    pub filter: DepFilter,
    #[serde(default)]
    pub force: bool,
}

pub async fn start_deployments(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> ApiResult<(StatusCode, Json<BatchSubmission>)> {
    let submission = state.manager.start_deployments(&request.filter).await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

pub async fn stop_deployments(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> ApiResult<(StatusCode, Json<BatchSubmission>)> {
    let submission = state
        .manager
        .stop_deployments(&request.filter, request.force)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

pub async fn delete_deployments(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> ApiResult<(StatusCode, Json<BatchSubmission>)> {
    let submission = state
        .manager
        .delete_deployments(&request.filter, request.force)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(submission)))
}
