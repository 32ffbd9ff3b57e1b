//! Storage trait definitions

use crate::error::StorageResult;
use async_trait::async_trait;
use modman_types::{DepAssets, DepFilter, DepInstance, Deployment, DeploymentId};
use std::collections::BTreeSet;

/// Handle for an open transaction
///
/// Not `Clone`: commit and rollback consume it, so a transaction can be
/// finished only once.
#[derive(Debug, PartialEq, Eq)]
pub struct Tx {
    id: u64,
}

impl Tx {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Combined storage trait
pub trait Storage:
    Transactional + DeploymentStorage + RequirementStorage + AssetStorage + InstanceStorage + Send + Sync
{
}

#[async_trait]
pub trait Transactional: Send + Sync {
    async fn begin_transaction(&self) -> StorageResult<Tx>;

    /// Apply every write made under `tx` atomically
    async fn commit(&self, tx: Tx) -> StorageResult<()>;

    /// Discard every write made under `tx`
    async fn rollback(&self, tx: Tx) -> StorageResult<()>;
}

/// Storage for deployment rows
///
/// Rows carry the base fields only; edges are always attached on read,
/// assets and the live instance on request.
#[async_trait]
pub trait DeploymentStorage: Send + Sync {
    /// List deployments matching `filter`, without assets or containers
    async fn list_deps(&self, filter: &DepFilter) -> StorageResult<Vec<Deployment>>;

    async fn read_dep(
        &self,
        tx: Option<&Tx>,
        id: &DeploymentId,
        assets: bool,
        containers: bool,
    ) -> StorageResult<Deployment>;

    async fn create_dep(&self, tx: Option<&Tx>, dep: &Deployment) -> StorageResult<()>;

    async fn update_dep(&self, tx: Option<&Tx>, dep: &Deployment) -> StorageResult<()>;

    /// Delete the row together with its edges, assets and instance
    async fn delete_dep(&self, tx: Option<&Tx>, id: &DeploymentId) -> StorageResult<()>;
}

/// Storage for dependency edges
#[async_trait]
pub trait RequirementStorage: Send + Sync {
    async fn create_dep_requirements(
        &self,
        tx: Option<&Tx>,
        id: &DeploymentId,
        required: &BTreeSet<DeploymentId>,
    ) -> StorageResult<()>;

    async fn delete_dep_requirements(&self, tx: Option<&Tx>, id: &DeploymentId)
        -> StorageResult<()>;
}

/// Storage for resolved assets
#[async_trait]
pub trait AssetStorage: Send + Sync {
    async fn create_dep_assets(
        &self,
        tx: Option<&Tx>,
        id: &DeploymentId,
        assets: &DepAssets,
    ) -> StorageResult<()>;

    async fn delete_dep_assets(&self, tx: Option<&Tx>, id: &DeploymentId) -> StorageResult<()>;
}

/// Storage for the live instance and its containers
#[async_trait]
pub trait InstanceStorage: Send + Sync {
    async fn create_dep_instance(
        &self,
        tx: Option<&Tx>,
        id: &DeploymentId,
        instance: &DepInstance,
    ) -> StorageResult<()>;

    async fn delete_dep_instance(&self, tx: Option<&Tx>, id: &DeploymentId)
        -> StorageResult<()>;
}
