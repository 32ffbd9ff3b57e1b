//! Deployment handlers
//!
//! Mutations answer `202 Accepted` with the id of the job doing the work.

use super::{parse_deployment_id, JobAccepted};
use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use modman_deployment::CreateSubmission;
use modman_types::{DepFilter, DepInput, Deployment, ModuleId};
use serde::Deserialize;

/// Create deployment request
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub module_id: String,
    #[serde(flatten)]
    pub input: DepInput,
}

/// Deployment list query
#[derive(Debug, Default, Deserialize)]
pub struct DeploymentQuery {
    pub name: Option<String>,
    pub module_id: Option<String>,
    pub enabled: Option<bool>,
    pub indirect: Option<bool>,
}

impl From<DeploymentQuery> for DepFilter {
    fn from(query: DeploymentQuery) -> Self {
        DepFilter {
            name: query.name,
            module_id: query.module_id.map(ModuleId::new),
            enabled: query.enabled,
            indirect: query.indirect,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub dependencies: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopQuery {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub dependencies: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
    /// Also delete indirect deployments nothing requires anymore
    #[serde(default)]
    pub orphans: bool,
}

pub async fn list_deployments(
    State(state): State<AppState>,
    Query(query): Query<DeploymentQuery>,
) -> ApiResult<Json<Vec<Deployment>>> {
    let deployments = state.manager.list_deployments(&query.into()).await?;
    Ok(Json(deployments))
}

pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Deployment>> {
    let id = parse_deployment_id(&id)?;
    Ok(Json(state.manager.get_deployment(&id).await?))
}

pub async fn create_deployment(
    State(state): State<AppState>,
    Json(request): Json<CreateDeploymentRequest>,
) -> ApiResult<(StatusCode, Json<CreateSubmission>)> {
    let module_id = ModuleId::new(request.module_id);
    let submission = state
        .manager
        .create_deployment(&module_id, request.input)
        .await?;

    tracing::info!(
        deployment_id = %submission.deployment_id,
        job_id = %submission.job_id,
        module_id = %module_id,
        "Create deployment accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(submission)))
}

pub async fn update_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<DepInput>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let id = parse_deployment_id(&id)?;
    let job_id = state.manager.update_deployment(&id, input).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

pub async fn delete_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let id = parse_deployment_id(&id)?;
    let job_id = state
        .manager
        .delete_deployment(&id, query.force, query.orphans)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

pub async fn start_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StartQuery>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let id = parse_deployment_id(&id)?;
    let job_id = state
        .manager
        .start_deployment(&id, query.dependencies)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

pub async fn stop_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let id = parse_deployment_id(&id)?;
    let job_id = state
        .manager
        .stop_deployment(&id, query.force, query.dependencies)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}
