//! Deployment Manager - Entry point for deployment operations
//!
//! The Manager validates requests synchronously and runs the actual work as
//! background jobs. Mutations hold the exclusive orchestration lease until
//! their job finishes, reads hold it shared for the duration of the call.

use crate::handler::LifecycleHandler;
use modman_clients::ModuleSource;
use modman_jobs::{JobEngine, OrchestrationLease};
use modman_store::Storage;
use modman_types::{
    DepFilter, DepInput, Deployment, DeploymentId, Error, Job, JobFilter, JobId, ModuleId, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

/// Accepted create request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSubmission {
    pub job_id: JobId,
    /// Id the deployment will have once the job completes
    pub deployment_id: DeploymentId,
}

/// Accepted batch request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSubmission {
    pub job_id: JobId,
    /// Selected deployments, in the order they will be processed
    pub deployment_ids: Vec<DeploymentId>,
}

pub struct Manager {
    handler: Arc<LifecycleHandler>,
    storage: Arc<dyn Storage>,
    modules: Arc<dyn ModuleSource>,
    jobs: Arc<JobEngine>,
    lease: OrchestrationLease,
}

impl Manager {
    pub fn new(
        handler: Arc<LifecycleHandler>,
        storage: Arc<dyn Storage>,
        modules: Arc<dyn ModuleSource>,
        jobs: Arc<JobEngine>,
        lease: OrchestrationLease,
    ) -> Self {
        Self {
            handler,
            storage,
            modules,
            jobs,
            lease,
        }
    }

    pub fn jobs(&self) -> &Arc<JobEngine> {
        &self.jobs
    }

    // ========== Reads ==========

    pub async fn list_deployments(&self, filter: &DepFilter) -> Result<Vec<Deployment>> {
        let _guard = self
            .lease
            .try_acquire_shared()
            .map_err(|e| e.context("list deployments"))?;
        self.storage
            .list_deps(filter)
            .await
            .map_err(|e| Error::from(e).context("list deployments"))
    }

    pub async fn get_deployment(&self, id: &DeploymentId) -> Result<Deployment> {
        let op = format!("get deployment ({})", id);
        let _guard = self
            .lease
            .try_acquire_shared()
            .map_err(|e| e.context(&op))?;
        self.storage
            .read_dep(None, id, true, true)
            .await
            .map_err(|e| Error::from(e).context(&op))
    }

    // ========== Mutations ==========

    #[instrument(skip(self, input), fields(module_id = %module_id))]
    pub async fn create_deployment(
        &self,
        module_id: &ModuleId,
        input: DepInput,
    ) -> Result<CreateSubmission> {
        let op = format!("create deployment (module {})", module_id);
        let guard = self
            .lease
            .try_acquire_exclusive(&op)
            .map_err(|e| e.context(&op))?;

        self.validate_module(module_id)
            .await
            .map_err(|e| e.context(&op))?;

        let deployment_id = DeploymentId::generate();
        let handler = self.handler.clone();
        let id = deployment_id.clone();
        let module_id = module_id.clone();
        let job_id = self
            .jobs
            .create(op.clone(), move |token| async move {
                let res = handler.create(&token, id, &module_id, &input, false).await;
                guard.release();
                res.map(|_| ())
            })
            .map_err(|e| e.context(&op))?;

        info!(job_id = %job_id, deployment_id = %deployment_id, "Create submitted");
        Ok(CreateSubmission {
            job_id,
            deployment_id,
        })
    }

    #[instrument(skip(self, input), fields(deployment_id = %id))]
    pub async fn update_deployment(&self, id: &DeploymentId, input: DepInput) -> Result<JobId> {
        let op = format!("update deployment ({})", id);
        let guard = self
            .lease
            .try_acquire_exclusive(&op)
            .map_err(|e| e.context(&op))?;
        let dep = self.ensure_exists(id).await.map_err(|e| e.context(&op))?;
        self.validate_module(&dep.module.id)
            .await
            .map_err(|e| e.context(&op))?;

        let handler = self.handler.clone();
        let id = id.clone();
        self.jobs
            .create(op.clone(), move |token| async move {
                let res = handler.update(&token, &id, &input).await;
                guard.release();
                res
            })
            .map_err(|e| e.context(&op))
    }

    #[instrument(skip(self), fields(deployment_id = %id))]
    pub async fn start_deployment(
        &self,
        id: &DeploymentId,
        with_dependencies: bool,
    ) -> Result<JobId> {
        let op = format!("start deployment ({})", id);
        let guard = self
            .lease
            .try_acquire_exclusive(&op)
            .map_err(|e| e.context(&op))?;
        self.ensure_exists(id).await.map_err(|e| e.context(&op))?;

        let handler = self.handler.clone();
        let id = id.clone();
        self.jobs
            .create(op.clone(), move |token| async move {
                let res = handler.start(&token, &id, with_dependencies).await;
                guard.release();
                res
            })
            .map_err(|e| e.context(&op))
    }

    #[instrument(skip(self), fields(deployment_id = %id))]
    pub async fn stop_deployment(
        &self,
        id: &DeploymentId,
        force: bool,
        with_dependencies: bool,
    ) -> Result<JobId> {
        let op = format!("stop deployment ({})", id);
        let guard = self
            .lease
            .try_acquire_exclusive(&op)
            .map_err(|e| e.context(&op))?;
        self.ensure_exists(id).await.map_err(|e| e.context(&op))?;

        let handler = self.handler.clone();
        let id = id.clone();
        self.jobs
            .create(op.clone(), move |token| async move {
                let res = handler.stop(&token, &id, force, with_dependencies).await;
                guard.release();
                res
            })
            .map_err(|e| e.context(&op))
    }

    #[instrument(skip(self), fields(deployment_id = %id))]
    pub async fn delete_deployment(
        &self,
        id: &DeploymentId,
        force: bool,
        orphans: bool,
    ) -> Result<JobId> {
        let op = format!("delete deployment ({})", id);
        let guard = self
            .lease
            .try_acquire_exclusive(&op)
            .map_err(|e| e.context(&op))?;
        self.ensure_exists(id).await.map_err(|e| e.context(&op))?;

        let handler = self.handler.clone();
        let id = id.clone();
        self.jobs
            .create(op.clone(), move |token| async move {
                let res = handler.delete(&token, &id, force, orphans).await;
                guard.release();
                res
            })
            .map_err(|e| e.context(&op))
    }

    // ========== Batch ==========

    #[instrument(skip(self, filter))]
    pub async fn start_deployments(&self, filter: &DepFilter) -> Result<BatchSubmission> {
        let op = "start deployments".to_string();
        let guard = self
            .lease
            .try_acquire_exclusive(&op)
            .map_err(|e| e.context(&op))?;
        let ids = self
            .ordered_selection(filter, false)
            .await
            .map_err(|e| e.context(&op))?;

        let handler = self.handler.clone();
        let batch = ids.clone();
        let job_id = self
            .jobs
            .create(op.clone(), move |token| async move {
                let res = handler.start_all(&token, &batch).await;
                guard.release();
                res
            })
            .map_err(|e| e.context(&op))?;
        Ok(BatchSubmission {
            job_id,
            deployment_ids: ids,
        })
    }

    #[instrument(skip(self, filter))]
    pub async fn stop_deployments(&self, filter: &DepFilter, force: bool) -> Result<BatchSubmission> {
        let op = "stop deployments".to_string();
        let guard = self
            .lease
            .try_acquire_exclusive(&op)
            .map_err(|e| e.context(&op))?;
        let ids = self
            .ordered_selection(filter, true)
            .await
            .map_err(|e| e.context(&op))?;

        let handler = self.handler.clone();
        let batch = ids.clone();
        let job_id = self
            .jobs
            .create(op.clone(), move |token| async move {
                let res = handler.stop_all(&token, &batch, force).await;
                guard.release();
                res
            })
            .map_err(|e| e.context(&op))?;
        Ok(BatchSubmission {
            job_id,
            deployment_ids: ids,
        })
    }

    #[instrument(skip(self, filter))]
    pub async fn delete_deployments(
        &self,
        filter: &DepFilter,
        force: bool,
    ) -> Result<BatchSubmission> {
        let op = "delete deployments".to_string();
        let guard = self
            .lease
            .try_acquire_exclusive(&op)
            .map_err(|e| e.context(&op))?;
        let ids = self
            .ordered_selection(filter, true)
            .await
            .map_err(|e| e.context(&op))?;

        let handler = self.handler.clone();
        let batch = ids.clone();
        let job_id = self
            .jobs
            .create(op.clone(), move |token| async move {
                let res = handler.delete_all(&token, &batch, force).await;
                guard.release();
                res
            })
            .map_err(|e| e.context(&op))?;
        Ok(BatchSubmission {
            job_id,
            deployment_ids: ids,
        })
    }

    // ========== Jobs ==========

    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        self.jobs.list(filter)
    }

    pub fn get_job(&self, id: &JobId) -> Result<Job> {
        self.jobs
            .get(id)
            .map_err(|e| e.context(format!("get job ({})", id)))
    }

    pub fn cancel_job(&self, id: &JobId) -> Result<()> {
        self.jobs
            .cancel(id)
            .map_err(|e| e.context(format!("cancel job ({})", id)))
    }

    /// Remove terminal jobs older than `max_age`
    pub fn purge_jobs(&self, max_age: Duration) -> usize {
        self.jobs.purge(max_age)
    }

    // ========== Validation ==========

    async fn ensure_exists(&self, id: &DeploymentId) -> Result<Deployment> {
        Ok(self.storage.read_dep(None, id, false, false).await?)
    }

    /// The module exists and its dependency graph can be ordered
    async fn validate_module(&self, module_id: &ModuleId) -> Result<()> {
        let module = self.modules.get_module(module_id).await?;
        let tree = self.modules.dependency_tree(module_id).await?;

        let mut graph: BTreeMap<ModuleId, BTreeSet<ModuleId>> = tree
            .iter()
            .map(|(id, m)| (id.clone(), m.dependencies.keys().cloned().collect()))
            .collect();
        graph.insert(module.id.clone(), module.dependencies.keys().cloned().collect());

        modman_graph::sort(&graph)
            .map(|_| ())
            .map_err(|e| Error::internal(format!("module dependencies: {}", e)))
    }

    /// Deployments matching `filter`, requirements first unless `reverse`
    async fn ordered_selection(
        &self,
        filter: &DepFilter,
        reverse: bool,
    ) -> Result<Vec<DeploymentId>> {
        let selected = self.storage.list_deps(filter).await?;
        let ids: BTreeSet<DeploymentId> = selected.iter().map(|d| d.id.clone()).collect();
        let graph: BTreeMap<DeploymentId, BTreeSet<DeploymentId>> = selected
            .into_iter()
            .map(|d| {
                let required = d.required_dep.intersection(&ids).cloned().collect();
                (d.id, required)
            })
            .collect();

        let ordered = if reverse {
            modman_graph::sort_reverse(&graph)
        } else {
            modman_graph::sort(&graph)
        };
        ordered.map_err(|e| Error::internal(format!("deployment dependencies: {}", e)))
    }
}
