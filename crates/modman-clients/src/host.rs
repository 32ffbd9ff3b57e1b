//! Host resource contract

use crate::error::ClientResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A device or other host path a container may mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub resource_type: Option<String>,
    pub path: String,
}

#[async_trait]
pub trait HostResources: Send + Sync {
    async fn get_host_resource(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> ClientResult<HostResource>;
}
