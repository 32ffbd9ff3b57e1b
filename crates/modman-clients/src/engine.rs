//! Container engine contract

use crate::error::ClientResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use modman_types::{Protocol, RunConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Container to create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    /// Names other containers on the network can use
    #[serde(default)]
    pub network_aliases: Vec<String>,
    #[serde(default)]
    pub run_config: RunConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Mount {
    Volume {
        source: String,
        target: String,
        read_only: bool,
    },
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
    Tmpfs {
        target: String,
        size: u64,
        mode: Option<u32>,
    },
}

impl Mount {
    pub fn target(&self) -> &str {
        match self {
            Mount::Volume { target, .. } | Mount::Bind { target, .. } | Mount::Tmpfs { target, .. } => {
                target
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub number: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub host_ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Volume selection; every label must match
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VolumeFilter {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl VolumeFilter {
    pub fn matches(&self, volume: &VolumeInfo) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| volume.labels.get(k) == Some(v))
    }
}

/// Asynchronous operation tracked by the container engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineJob {
    pub id: String,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub canceled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Remote container engine
///
/// Every call receives a cancellation token. Calls backed by asynchronous
/// remote jobs keep polling until the job finishes or the token fires; in
/// the latter case they ask the engine to cancel the job before returning.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a container and return its id
    async fn create_container(
        &self,
        spec: &ContainerSpec,
        cancel: &CancellationToken,
    ) -> ClientResult<String>;

    async fn start_container(&self, id: &str, cancel: &CancellationToken) -> ClientResult<()>;

    async fn stop_container(&self, id: &str, cancel: &CancellationToken) -> ClientResult<()>;

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> ClientResult<()>;

    async fn get_container(&self, id: &str, cancel: &CancellationToken)
        -> ClientResult<ContainerInfo>;

    /// Create a named volume; an existing volume with the same name is reused
    async fn create_volume(
        &self,
        spec: &VolumeSpec,
        cancel: &CancellationToken,
    ) -> ClientResult<String>;

    async fn list_volumes(
        &self,
        filter: &VolumeFilter,
        cancel: &CancellationToken,
    ) -> ClientResult<Vec<VolumeInfo>>;

    async fn remove_volume(
        &self,
        name: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> ClientResult<()>;
}
