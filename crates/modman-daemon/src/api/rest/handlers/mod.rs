//! API request handlers

mod batch;
mod deployments;
mod health;
mod jobs;

pub use batch::*;
pub use deployments::*;
pub use health::*;
pub use jobs::*;

use crate::error::ApiError;
use modman_types::{DeploymentId, JobId};
use serde::Serialize;

/// Response to an accepted mutation
#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: JobId,
}

pub(crate) fn parse_deployment_id(id: &str) -> Result<DeploymentId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid deployment id '{}': {}", id, e)))
}

pub(crate) fn parse_job_id(id: &str) -> Result<JobId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid job id '{}': {}", id, e)))
}
