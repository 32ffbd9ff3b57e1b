//! Deployment lifecycle handler
//!
//! Implements the lifecycle operations on deployments. Every operation runs
//! inside its own [`CallScope`]. Storage writes that belong together go
//! through one transaction, and remote side effects are undone through a
//! [`CompensationStack`] when a later step fails.
//!
//! The handler does not serialize callers; [`crate::Manager`] does that
//! through the orchestration lease.

use crate::assets::{AssetResolver, ResolvedAssets};
use crate::compensation::CompensationStack;
use crate::materializer::{InstancePlan, Materializer};
use crate::scope::{CallScope, Timeouts};
use crate::volumes::{VolumeNaming, VolumeNamingScheme};
use chrono::Utc;
use modman_clients::{ContainerEngine, HostResources, ModuleSource, SecretStore};
use modman_store::{Storage, Tx};
use modman_types::{
    DepFilter, DepInput, DepInstance, DepModule, Deployment, DeploymentId, Error, InstanceId,
    Module, ModuleId, Result,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// External services the handler drives
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub modules: Arc<dyn ModuleSource>,
    pub engine: Arc<dyn ContainerEngine>,
    pub secrets: Arc<dyn SecretStore>,
    pub host: Arc<dyn HostResources>,
}

#[derive(Debug, Clone, Default)]
pub struct HandlerConfig {
    pub timeouts: Timeouts,
    /// Recognized volume naming schemes, the first one is used for new volumes
    pub volume_schemes: Vec<VolumeNamingScheme>,
}

/// What a deployment is being (re)built into
struct Target<'a> {
    module: &'a Module,
    name: String,
    assets: ResolvedAssets,
    required: BTreeSet<DeploymentId>,
    /// Required module -> service -> container alias
    ext_aliases: BTreeMap<ModuleId, BTreeMap<String, String>>,
}

type ModuleDeployments = BTreeMap<ModuleId, DeploymentId>;

pub struct LifecycleHandler {
    storage: Arc<dyn Storage>,
    modules: Arc<dyn ModuleSource>,
    secrets: Arc<dyn SecretStore>,
    assets: AssetResolver,
    materializer: Materializer,
    timeouts: Timeouts,
}

fn join(ids: &[DeploymentId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn has_secret_files(dep: &Deployment) -> bool {
    dep.assets
        .secrets
        .values()
        .any(|s| !s.mounted_items.is_empty())
}

impl LifecycleHandler {
    pub fn new(collaborators: Collaborators, config: HandlerConfig) -> Self {
        Self {
            assets: AssetResolver::new(collaborators.host, collaborators.secrets.clone()),
            materializer: Materializer::new(
                collaborators.engine,
                VolumeNaming::new(config.volume_schemes),
            ),
            storage: collaborators.storage,
            modules: collaborators.modules,
            secrets: collaborators.secrets,
            timeouts: config.timeouts,
        }
    }

    fn scope(&self, cancel: &CancellationToken) -> CallScope {
        CallScope::new(cancel, self.timeouts)
    }

    fn compensation(&self) -> CompensationStack {
        CompensationStack::new(self.timeouts.http)
    }

    // ========== Create ==========

    /// Create a deployment of `module_id` under `id`, creating deployments
    /// for any module dependency that has none yet
    #[instrument(skip(self, cancel, input), fields(deployment_id = %id, module_id = %module_id))]
    pub async fn create(
        &self,
        cancel: &CancellationToken,
        id: DeploymentId,
        module_id: &ModuleId,
        input: &DepInput,
        indirect: bool,
    ) -> Result<DeploymentId> {
        let scope = self.scope(cancel);
        let module = self.get_module(&scope, module_id).await?;
        let tree = scope
            .http("resolve module dependencies", |_| {
                self.modules.dependency_tree(module_id)
            })
            .await?;

        let mut created = Vec::new();
        let result = async {
            let deps = self.ensure_dependencies(&scope, &tree, &mut created).await?;
            let name = input.name.clone().unwrap_or_else(|| module.name.clone());
            let target = self.target(&scope, &id, &module, name, input, &deps).await?;
            self.create_single(&scope, &id, &target, indirect).await
        }
        .await;

        match result {
            Ok(()) => {
                info!(dependencies = created.len(), "Deployment created");
                Ok(id)
            }
            Err(e) => {
                self.discard(&created).await;
                Err(e)
            }
        }
    }

    /// Deployment satisfying every module of `tree`, in dependency order.
    /// Newly created deployments are appended to `created`.
    async fn ensure_dependencies(
        &self,
        scope: &CallScope,
        tree: &BTreeMap<ModuleId, Module>,
        created: &mut Vec<DeploymentId>,
    ) -> Result<ModuleDeployments> {
        let graph: BTreeMap<ModuleId, BTreeSet<ModuleId>> = tree
            .iter()
            .map(|(id, m)| (id.clone(), m.dependencies.keys().cloned().collect()))
            .collect();
        let order = modman_graph::sort(&graph)
            .map_err(|e| Error::internal(format!("module dependencies: {}", e)))?;

        let mut resolved = ModuleDeployments::new();
        for module_id in order {
            let module = tree
                .get(&module_id)
                .ok_or_else(|| Error::internal(format!("module '{}' not resolved", module_id)))?;
            let filter = DepFilter {
                module_id: Some(module_id.clone()),
                ..Default::default()
            };
            let existing = scope
                .db("list deployments", self.storage.list_deps(&filter))
                .await?;

            let dep_id = match existing.into_iter().next() {
                Some(dep) => {
                    debug!(module_id = %module_id, deployment_id = %dep.id, "Reusing deployment");
                    dep.id
                }
                None => {
                    let id = DeploymentId::generate();
                    let input = DepInput::default();
                    let target = self
                        .target(scope, &id, module, module.name.clone(), &input, &resolved)
                        .await?;
                    self.create_single(scope, &id, &target, true).await?;
                    info!(module_id = %module_id, deployment_id = %id, "Created indirect deployment");
                    created.push(id.clone());
                    id
                }
            };
            resolved.insert(module_id, dep_id);
        }
        Ok(resolved)
    }

    async fn target<'a>(
        &self,
        scope: &CallScope,
        id: &DeploymentId,
        module: &'a Module,
        name: String,
        input: &DepInput,
        deps: &ModuleDeployments,
    ) -> Result<Target<'a>> {
        let required = module
            .dependencies
            .keys()
            .map(|m| {
                deps.get(m).cloned().ok_or_else(|| {
                    Error::internal(format!("no deployment satisfies module '{}'", m))
                })
            })
            .collect::<Result<BTreeSet<_>>>()?;

        let mut ext_aliases = BTreeMap::new();
        for dep_id in &required {
            let dep = self.read(scope, dep_id, true).await?;
            let aliases = dep
                .instance
                .map(|i| {
                    i.containers
                        .into_values()
                        .map(|c| (c.srv_ref, c.alias))
                        .collect()
                })
                .unwrap_or_default();
            ext_aliases.insert(dep.module.id, aliases);
        }

        let assets = self.assets.resolve(scope, id, module, input).await?;
        Ok(Target {
            module,
            name,
            assets,
            required,
            ext_aliases,
        })
    }

    async fn create_single(
        &self,
        scope: &CallScope,
        id: &DeploymentId,
        target: &Target<'_>,
        indirect: bool,
    ) -> Result<()> {
        let mut comp = self.compensation();
        match self.create_steps(scope, id, target, indirect, &mut comp).await {
            Ok(()) => {
                comp.disarm();
                Ok(())
            }
            Err(e) => {
                warn!(deployment_id = %id, error = %e, "Create failed, rolling back");
                comp.unwind().await;
                Err(e)
            }
        }
    }

    async fn create_steps(
        &self,
        scope: &CallScope,
        id: &DeploymentId,
        target: &Target<'_>,
        indirect: bool,
        comp: &mut CompensationStack,
    ) -> Result<()> {
        let dir = scope
            .http("prepare include directory", |_| {
                self.modules.prepare_include_dir(target.module, id)
            })
            .await?;
        let modules = self.modules.clone();
        let undo_dir = dir.clone();
        comp.push(format!("remove include directory {}", dir), move |_| async move {
            modules.remove_include_dir(&undo_dir).await.map_err(Error::from)
        });
        scope.check()?;

        let now = Utc::now();
        let dep = Deployment {
            id: id.clone(),
            module: DepModule {
                id: target.module.id.clone(),
                version: target.module.version.clone(),
            },
            name: target.name.clone(),
            dir,
            enabled: false,
            indirect,
            created: now,
            updated: now,
            assets: Default::default(),
            instance: None,
            required_dep: BTreeSet::new(),
            dep_requiring: BTreeSet::new(),
        };

        let tx = self.begin(scope).await?;
        match self.persist_new(scope, &tx, &dep, target, comp).await {
            Ok(()) => self.commit(scope, tx).await,
            Err(e) => {
                self.rollback(tx).await;
                Err(e)
            }
        }
    }

    async fn persist_new(
        &self,
        scope: &CallScope,
        tx: &Tx,
        dep: &Deployment,
        target: &Target<'_>,
        comp: &mut CompensationStack,
    ) -> Result<()> {
        scope
            .db("create deployment", self.storage.create_dep(Some(tx), dep))
            .await?;
        if !target.required.is_empty() {
            scope
                .db(
                    "create requirements",
                    self.storage
                        .create_dep_requirements(Some(tx), &dep.id, &target.required),
                )
                .await?;
        }
        scope
            .db(
                "create assets",
                self.storage
                    .create_dep_assets(Some(tx), &dep.id, &target.assets.to_dep_assets()),
            )
            .await?;

        let volumes = self
            .materializer
            .create_volumes(scope, &dep.id, &target.module.volumes, comp)
            .await?;
        let instance = self
            .build_instance(scope, dep, target, &volumes, comp)
            .await?;
        scope
            .db(
                "create instance",
                self.storage.create_dep_instance(Some(tx), &dep.id, &instance),
            )
            .await
    }

    async fn build_instance(
        &self,
        scope: &CallScope,
        dep: &Deployment,
        target: &Target<'_>,
        volumes: &BTreeMap<String, String>,
        comp: &mut CompensationStack,
    ) -> Result<DepInstance> {
        let instance_id = InstanceId::generate();
        let plan = InstancePlan {
            dep_id: &dep.id,
            instance_id: &instance_id,
            module: target.module,
            dir: &dep.dir,
            assets: &target.assets,
            volumes,
            ext_aliases: &target.ext_aliases,
        };
        self.materializer.create_containers(scope, &plan, comp).await
    }

    /// Best-effort removal of deployments created by a failed operation
    async fn discard(&self, created: &[DeploymentId]) {
        // The failed operation's scope may be canceled already
        let scope = CallScope::new(&CancellationToken::new(), self.timeouts);
        for id in created.iter().rev() {
            match self.delete_single(&scope, id).await {
                Ok(()) => info!(deployment_id = %id, "Discarded dependency deployment"),
                Err(e) => warn!(deployment_id = %id, error = %e, "Failed to discard deployment"),
            }
        }
    }

    // ========== Start / stop ==========

    #[instrument(skip(self, cancel), fields(deployment_id = %id))]
    pub async fn start(
        &self,
        cancel: &CancellationToken,
        id: &DeploymentId,
        with_dependencies: bool,
    ) -> Result<()> {
        let scope = self.scope(cancel);
        let dep = self.read(&scope, id, false).await?;

        if with_dependencies {
            return self.start_with_dependencies(&scope, &dep).await;
        }

        let mut stopped = Vec::new();
        for required in &dep.required_dep {
            if !self.read(&scope, required, false).await?.enabled {
                stopped.push(required.clone());
            }
        }
        if !stopped.is_empty() {
            return Err(Error::internal(format!(
                "required deployments are not running: {}",
                join(&stopped)
            )));
        }

        self.start_single(&scope, id).await
    }

    /// Start everything `dep` transitively requires, then `dep` itself
    async fn start_with_dependencies(&self, scope: &CallScope, dep: &Deployment) -> Result<()> {
        for required in self.required_closure(scope, dep).await? {
            self.start_single(scope, &required).await?;
        }
        self.start_single(scope, &dep.id).await
    }

    async fn start_single(&self, scope: &CallScope, id: &DeploymentId) -> Result<()> {
        let dep = self.read(scope, id, true).await?;
        if dep.enabled {
            debug!(deployment_id = %id, "Deployment already running");
            return Ok(());
        }

        let mut comp = self.compensation();
        match self.start_steps(scope, &dep, &mut comp).await {
            Ok(()) => {
                comp.disarm();
                info!(deployment_id = %id, "Deployment started");
                Ok(())
            }
            Err(e) => {
                warn!(deployment_id = %id, error = %e, "Start failed, stopping started containers");
                comp.unwind().await;
                Err(e)
            }
        }
    }

    async fn start_steps(
        &self,
        scope: &CallScope,
        dep: &Deployment,
        comp: &mut CompensationStack,
    ) -> Result<()> {
        if has_secret_files(dep) {
            self.load_secrets(scope, &dep.id).await?;
            let secrets = self.secrets.clone();
            let reference = dep.id.to_string();
            comp.push("unload secret variants", move |token| async move {
                secrets
                    .clean_path_variants(&reference, &token)
                    .await
                    .map_err(Error::from)
            });
        }

        self.materializer
            .start_containers(scope, &dep.containers_in_order(), comp)
            .await?;

        scope.check()?;
        let mut row = dep.clone();
        row.enabled = true;
        row.updated = Utc::now();
        scope
            .db("update deployment", self.storage.update_dep(None, &row))
            .await
    }

    #[instrument(skip(self, cancel), fields(deployment_id = %id))]
    pub async fn stop(
        &self,
        cancel: &CancellationToken,
        id: &DeploymentId,
        force: bool,
        with_dependencies: bool,
    ) -> Result<()> {
        let scope = self.scope(cancel);
        let dep = self.read(&scope, id, false).await?;

        let running = self.running_requirers(&scope, &dep).await?;
        if !running.is_empty() {
            if !force {
                return Err(Error::internal(format!(
                    "deployment is required by running deployments: {}",
                    join(&running)
                )));
            }
            warn!(requirers = %join(&running), "Forcing stop of a required deployment");
        }

        self.stop_single(&scope, id).await?;

        if with_dependencies {
            let mut closure = self.required_closure(&scope, &dep).await?;
            closure.reverse();
            for dep_id in closure {
                let required = self.read(&scope, &dep_id, false).await?;
                if !required.indirect || !required.enabled {
                    continue;
                }
                if self.running_requirers(&scope, &required).await?.is_empty() {
                    self.stop_single(&scope, &dep_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn stop_single(&self, scope: &CallScope, id: &DeploymentId) -> Result<()> {
        let dep = self.read(scope, id, true).await?;
        if !dep.enabled {
            debug!(deployment_id = %id, "Deployment already stopped");
            return Ok(());
        }

        self.materializer
            .stop_containers(scope, &dep.containers_in_order())
            .await?;

        let mut row = dep.clone();
        row.enabled = false;
        row.updated = Utc::now();
        scope
            .db("update deployment", self.storage.update_dep(None, &row))
            .await?;

        if has_secret_files(&dep) {
            if let Err(e) = self.unload_secrets(scope, id).await {
                warn!(deployment_id = %id, error = %e, "Failed to unload secret variants");
            }
        }
        info!(deployment_id = %id, "Deployment stopped");
        Ok(())
    }

    // ========== Update ==========

    /// Rebuild a deployment against the current version of its module
    #[instrument(skip(self, cancel, input), fields(deployment_id = %id))]
    pub async fn update(
        &self,
        cancel: &CancellationToken,
        id: &DeploymentId,
        input: &DepInput,
    ) -> Result<()> {
        let scope = self.scope(cancel);
        let old = self.read(&scope, id, true).await?;
        let module = self.get_module(&scope, &old.module.id).await?;
        let tree = scope
            .http("resolve module dependencies", |_| {
                self.modules.dependency_tree(&old.module.id)
            })
            .await?;

        let mut created = Vec::new();
        let replaced = async {
            let deps = self.ensure_dependencies(&scope, &tree, &mut created).await?;
            let name = input.name.clone().unwrap_or_else(|| old.name.clone());
            let target = self.target(&scope, id, &module, name, input, &deps).await?;
            self.replace(&scope, &old, &target).await
        }
        .await;
        let orphans = match replaced {
            Ok(orphans) => orphans,
            Err(e) => {
                // Asset resolution cleans the variants of a failed attempt
                if old.enabled && has_secret_files(&old) {
                    if let Err(reload) = self.load_secrets(&scope, id).await {
                        warn!(error = %reload, "Failed to reload secret variants");
                    }
                }
                self.discard(&created).await;
                return Err(e);
            }
        };

        // Committed: the new instance is the deployment of record. Requirements
        // added by the new version are started along with it.
        let started = if old.enabled {
            match self.read(&scope, id, false).await {
                Ok(current) => self.start_with_dependencies(&scope, &current).await,
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };

        if let Err(e) = self
            .materializer
            .remove_containers(&scope, &old.containers_in_order())
            .await
        {
            warn!(deployment_id = %id, error = %e, "Failed to remove previous containers");
        }
        if let Err(e) = self.materializer.remove_volumes(&scope, &orphans).await {
            warn!(deployment_id = %id, error = %e, "Failed to remove orphaned volumes");
        }

        started.map_err(|e| e.context("start updated deployment"))?;
        info!(version = %module.version, "Deployment updated");
        Ok(())
    }

    /// Swap the old instance for a new one and commit; returns the engine
    /// volumes that are no longer declared
    async fn replace(
        &self,
        scope: &CallScope,
        old: &Deployment,
        target: &Target<'_>,
    ) -> Result<Vec<String>> {
        let mut restore = self.compensation();
        let mut comp = self.compensation();
        match self.replace_steps(scope, old, target, &mut restore, &mut comp).await {
            Ok(orphans) => {
                comp.disarm();
                restore.disarm();
                Ok(orphans)
            }
            Err(e) => {
                warn!(deployment_id = %old.id, error = %e, "Update failed, restoring previous deployment");
                comp.unwind().await;
                restore.unwind().await;
                Err(e)
            }
        }
    }

    async fn replace_steps(
        &self,
        scope: &CallScope,
        old: &Deployment,
        target: &Target<'_>,
        restore: &mut CompensationStack,
        comp: &mut CompensationStack,
    ) -> Result<Vec<String>> {
        if old.enabled {
            let engine = self.materializer.engine();
            let ids: Vec<String> = old
                .containers_in_order()
                .iter()
                .map(|c| c.id.clone())
                .collect();
            restore.push("restart previous containers", move |token| async move {
                for id in &ids {
                    engine.start_container(id, &token).await?;
                }
                Ok::<_, Error>(())
            });
            if has_secret_files(old) {
                let secrets = self.secrets.clone();
                let reference = old.id.to_string();
                restore.push("reload secret variants", move |token| async move {
                    secrets
                        .load_path_variants(&reference, &token)
                        .await
                        .map_err(Error::from)
                });
            }

            self.materializer
                .stop_containers(scope, &old.containers_in_order())
                .await?;
            if has_secret_files(old) {
                if let Err(e) = self.unload_secrets(scope, &old.id).await {
                    warn!(deployment_id = %old.id, error = %e, "Failed to unload secret variants");
                }
            }
            scope.check()?;
        }

        let remote = self.materializer.list_volumes(scope).await?;
        let diff = self
            .materializer
            .naming()
            .diff(&old.id, &target.module.volumes, &remote);
        let mut volumes = diff.reuse.clone();
        volumes.extend(
            self.materializer
                .create_volumes(scope, &old.id, &diff.create, comp)
                .await?,
        );

        let instance = self
            .build_instance(scope, old, target, &volumes, comp)
            .await?;
        scope.check()?;

        let mut row = old.clone();
        row.module = DepModule {
            id: target.module.id.clone(),
            version: target.module.version.clone(),
        };
        row.name = target.name.clone();
        // Marked running again once the new instance has started
        row.enabled = false;
        row.updated = Utc::now();

        let tx = self.begin(scope).await?;
        match self.persist_replacement(scope, &tx, &row, target, &instance).await {
            Ok(()) => self.commit(scope, tx).await?,
            Err(e) => {
                self.rollback(tx).await;
                return Err(e);
            }
        }
        Ok(diff.orphans)
    }

    async fn persist_replacement(
        &self,
        scope: &CallScope,
        tx: &Tx,
        row: &Deployment,
        target: &Target<'_>,
        instance: &DepInstance,
    ) -> Result<()> {
        let id = &row.id;
        scope
            .db("delete requirements", self.storage.delete_dep_requirements(Some(tx), id))
            .await?;
        if !target.required.is_empty() {
            scope
                .db(
                    "create requirements",
                    self.storage
                        .create_dep_requirements(Some(tx), id, &target.required),
                )
                .await?;
        }
        scope
            .db("delete assets", self.storage.delete_dep_assets(Some(tx), id))
            .await?;
        scope
            .db(
                "create assets",
                self.storage
                    .create_dep_assets(Some(tx), id, &target.assets.to_dep_assets()),
            )
            .await?;
        scope
            .db("delete instance", self.storage.delete_dep_instance(Some(tx), id))
            .await?;
        scope
            .db("create instance", self.storage.create_dep_instance(Some(tx), id, instance))
            .await?;
        scope
            .db("update deployment", self.storage.update_dep(Some(tx), row))
            .await
    }

    // ========== Delete ==========

    #[instrument(skip(self, cancel), fields(deployment_id = %id))]
    pub async fn delete(
        &self,
        cancel: &CancellationToken,
        id: &DeploymentId,
        force: bool,
        orphans: bool,
    ) -> Result<()> {
        let scope = self.scope(cancel);
        let dep = self.read(&scope, id, false).await?;

        let running = self.running_requirers(&scope, &dep).await?;
        if !running.is_empty() {
            return Err(Error::internal(format!(
                "deployment is required by running deployments: {}",
                join(&running)
            )));
        }

        if dep.enabled {
            debug!(force, "Stopping deployment before delete");
            self.stop_single(&scope, id).await?;
        }
        self.delete_single(&scope, id).await?;

        if orphans {
            self.delete_orphans(&scope).await?;
        }
        Ok(())
    }

    async fn delete_single(&self, scope: &CallScope, id: &DeploymentId) -> Result<()> {
        let dep = self.read(scope, id, true).await?;

        self.materializer
            .remove_containers(scope, &dep.containers_in_order())
            .await?;

        let declared = match self.get_module(scope, &dep.module.id).await {
            Ok(module) => module.volumes,
            Err(_) => BTreeSet::new(),
        };
        let remote = self.materializer.list_volumes(scope).await?;
        let owned: Vec<String> = self
            .materializer
            .naming()
            .owned(id, &declared, &remote)
            .into_iter()
            .map(|v| v.name.clone())
            .collect();
        self.materializer.remove_volumes(scope, &owned).await?;

        if !dep.dir.is_empty() {
            scope
                .http("remove include directory", |_| {
                    self.modules.remove_include_dir(&dep.dir)
                })
                .await?;
        }

        let tx = self.begin(scope).await?;
        match self.purge_rows(scope, &tx, id).await {
            Ok(()) => self.commit(scope, tx).await?,
            Err(e) => {
                self.rollback(tx).await;
                return Err(e);
            }
        }
        info!(deployment_id = %id, "Deployment deleted");
        Ok(())
    }

    async fn purge_rows(&self, scope: &CallScope, tx: &Tx, id: &DeploymentId) -> Result<()> {
        scope
            .db("delete instance", self.storage.delete_dep_instance(Some(tx), id))
            .await?;
        scope
            .db("delete assets", self.storage.delete_dep_assets(Some(tx), id))
            .await?;
        scope
            .db("delete requirements", self.storage.delete_dep_requirements(Some(tx), id))
            .await?;
        scope
            .db("delete deployment", self.storage.delete_dep(Some(tx), id))
            .await
    }

    /// Delete indirect deployments nothing requires, until none are left
    async fn delete_orphans(&self, scope: &CallScope) -> Result<()> {
        let filter = DepFilter {
            indirect: Some(true),
            ..Default::default()
        };
        loop {
            let orphans: Vec<Deployment> = scope
                .db("list deployments", self.storage.list_deps(&filter))
                .await?
                .into_iter()
                .filter(|d| d.dep_requiring.is_empty())
                .collect();
            if orphans.is_empty() {
                return Ok(());
            }
            for orphan in orphans {
                if orphan.enabled {
                    self.stop_single(scope, &orphan.id).await?;
                }
                self.delete_single(scope, &orphan.id).await?;
                info!(deployment_id = %orphan.id, "Orphaned deployment deleted");
            }
        }
    }

    // ========== Batch ==========

    /// Start deployments in the given order, with their dependencies
    pub async fn start_all(&self, cancel: &CancellationToken, ids: &[DeploymentId]) -> Result<()> {
        for id in ids {
            self.start(cancel, id, true)
                .await
                .map_err(|e| e.context(format!("deployment {}", id)))?;
        }
        Ok(())
    }

    pub async fn stop_all(
        &self,
        cancel: &CancellationToken,
        ids: &[DeploymentId],
        force: bool,
    ) -> Result<()> {
        for id in ids {
            self.stop(cancel, id, force, false)
                .await
                .map_err(|e| e.context(format!("deployment {}", id)))?;
        }
        Ok(())
    }

    pub async fn delete_all(
        &self,
        cancel: &CancellationToken,
        ids: &[DeploymentId],
        force: bool,
    ) -> Result<()> {
        for id in ids {
            self.delete(cancel, id, force, false)
                .await
                .map_err(|e| e.context(format!("deployment {}", id)))?;
        }
        Ok(())
    }

    // ========== Helpers ==========

    async fn read(&self, scope: &CallScope, id: &DeploymentId, full: bool) -> Result<Deployment> {
        scope
            .db("read deployment", self.storage.read_dep(None, id, full, full))
            .await
    }

    async fn get_module(&self, scope: &CallScope, id: &ModuleId) -> Result<Module> {
        scope
            .http("get module", |_| self.modules.get_module(id))
            .await
    }

    /// Every deployment `dep` transitively requires, least dependent first
    async fn required_closure(
        &self,
        scope: &CallScope,
        dep: &Deployment,
    ) -> Result<Vec<DeploymentId>> {
        let mut graph: BTreeMap<DeploymentId, BTreeSet<DeploymentId>> = BTreeMap::new();
        let mut queue: VecDeque<DeploymentId> = dep.required_dep.iter().cloned().collect();
        while let Some(next) = queue.pop_front() {
            if next == dep.id || graph.contains_key(&next) {
                continue;
            }
            let required = self.read(scope, &next, false).await?;
            queue.extend(required.required_dep.iter().cloned());
            graph.insert(next, required.required_dep);
        }
        modman_graph::sort(&graph)
            .map_err(|e| Error::internal(format!("deployment dependencies: {}", e)))
    }

    async fn running_requirers(
        &self,
        scope: &CallScope,
        dep: &Deployment,
    ) -> Result<Vec<DeploymentId>> {
        let mut running = Vec::new();
        for requirer in &dep.dep_requiring {
            if self.read(scope, requirer, false).await?.enabled {
                running.push(requirer.clone());
            }
        }
        Ok(running)
    }

    async fn load_secrets(&self, scope: &CallScope, id: &DeploymentId) -> Result<()> {
        let reference = id.to_string();
        scope
            .http("load secret variants", |token| async move {
                self.secrets.load_path_variants(&reference, &token).await
            })
            .await
    }

    async fn unload_secrets(&self, scope: &CallScope, id: &DeploymentId) -> Result<()> {
        let reference = id.to_string();
        scope
            .http("unload secret variants", |token| async move {
                self.secrets.clean_path_variants(&reference, &token).await
            })
            .await
    }

    async fn begin(&self, scope: &CallScope) -> Result<Tx> {
        scope
            .db("begin transaction", self.storage.begin_transaction())
            .await
    }

    /// A started commit is never abandoned; a canceled scope rolls back instead
    async fn commit(&self, scope: &CallScope, tx: Tx) -> Result<()> {
        if let Err(e) = scope.check() {
            self.rollback(tx).await;
            return Err(e);
        }
        self.storage
            .commit(tx)
            .await
            .map_err(|e| Error::from(e).context("commit transaction"))
    }

    async fn rollback(&self, tx: Tx) {
        let tx_id = tx.id();
        if let Err(e) = self.storage.rollback(tx).await {
            warn!(tx = tx_id, error = %e, "Failed to roll back transaction");
        }
    }
}
