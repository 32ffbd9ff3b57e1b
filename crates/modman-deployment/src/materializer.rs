//! Container materializer
//!
//! Builds container specs from a module and its resolved assets, and drives
//! the container engine for containers and named volumes. Creation steps
//! register their undo on the caller's [`CompensationStack`].

use crate::assets::ResolvedAssets;
use crate::compensation::CompensationStack;
use crate::scope::CallScope;
use crate::volumes::VolumeNaming;
use chrono::Utc;
use modman_clients::{
    ContainerEngine, ContainerSpec, Mount, PortBinding, VolumeFilter, VolumeInfo,
};
use modman_types::{
    DepContainer, DepInstance, DeploymentId, Error, InstanceId, Module, ModuleId, Result, Service,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const ENV_DEPLOYMENT_ID: &str = "MODMAN_DEPLOYMENT_ID";
pub const ENV_INSTANCE_ID: &str = "MODMAN_INSTANCE_ID";

pub const LABEL_DEPLOYMENT: &str = "modman.deployment";
pub const LABEL_INSTANCE: &str = "modman.instance";
pub const LABEL_SERVICE: &str = "modman.service";
pub const LABEL_MODULE: &str = "modman.module";

const REF_PLACEHOLDER: &str = "{ref}";

/// Deterministic container name, also used as its network alias
pub fn container_name(instance: &InstanceId, service: &str) -> String {
    format!("mm-{}-{}", instance.short(), service)
}

/// Services in start order
pub fn service_order(module: &Module) -> Result<Vec<String>> {
    modman_graph::sort(&module.service_requirements()).map_err(|e| {
        Error::internal(format!("module '{}' services: {}", module.id, e))
    })
}

/// Everything needed to build the container set of one instance
pub struct InstancePlan<'a> {
    pub dep_id: &'a DeploymentId,
    pub instance_id: &'a InstanceId,
    pub module: &'a Module,
    /// Include directory of the deployment
    pub dir: &'a str,
    pub assets: &'a ResolvedAssets,
    /// Declared volume -> engine volume
    pub volumes: &'a BTreeMap<String, String>,
    /// Required module -> service -> container alias of the deployment
    /// satisfying it
    pub ext_aliases: &'a BTreeMap<ModuleId, BTreeMap<String, String>>,
}

impl InstancePlan<'_> {
    pub fn container_spec(&self, srv_ref: &str, service: &Service) -> Result<ContainerSpec> {
        let name = container_name(self.instance_id, srv_ref);
        Ok(ContainerSpec {
            env: self.env(srv_ref, service)?,
            labels: BTreeMap::from([
                (LABEL_DEPLOYMENT.to_string(), self.dep_id.to_string()),
                (LABEL_INSTANCE.to_string(), self.instance_id.to_string()),
                (LABEL_SERVICE.to_string(), srv_ref.to_string()),
                (LABEL_MODULE.to_string(), self.module.id.to_string()),
            ]),
            mounts: self.mounts(srv_ref, service)?,
            ports: service
                .ports
                .iter()
                .map(|p| PortBinding {
                    number: p.number,
                    protocol: p.protocol,
                    host_ports: p.bindings.clone(),
                })
                .collect(),
            network_aliases: vec![name.clone()],
            image: service.image.clone(),
            run_config: service.run_config.clone(),
            name,
        })
    }

    fn env(&self, srv_ref: &str, service: &Service) -> Result<BTreeMap<String, String>> {
        let mut env = service.env_vars.clone();

        for (var, cfg_ref) in &service.configs {
            let Some(value) = self.assets.configs.get(cfg_ref) else {
                continue;
            };
            let delimiter = self
                .module
                .configs
                .get(cfg_ref)
                .map(|f| f.delimiter())
                .unwrap_or(",");
            env.insert(var.clone(), value.to_env_string(delimiter));
        }

        env.insert(ENV_DEPLOYMENT_ID.to_string(), self.dep_id.to_string());
        env.insert(ENV_INSTANCE_ID.to_string(), self.instance_id.to_string());

        for (var, target) in &service.srv_references {
            if !self.module.services.contains_key(&target.service) {
                return Err(Error::internal(format!(
                    "service '{}' references unknown service '{}'",
                    srv_ref, target.service
                )));
            }
            let alias = container_name(self.instance_id, &target.service);
            env.insert(var.clone(), render(target.template.as_deref(), &alias));
        }

        for (var, target) in &service.ext_dependencies {
            let alias = self
                .ext_aliases
                .get(&target.module)
                .ok_or_else(|| {
                    Error::internal(format!("no deployment satisfies module '{}'", target.module))
                })?
                .get(&target.service)
                .ok_or_else(|| {
                    Error::internal(format!(
                        "deployment of module '{}' has no service '{}'",
                        target.module, target.service
                    ))
                })?;
            env.insert(var.clone(), render(target.template.as_deref(), alias));
        }

        for (var, target) in &service.secret_vars {
            let Some(secret) = self.assets.secrets.get(&target.reference) else {
                continue;
            };
            let value = self
                .assets
                .secret_values
                .get(&(secret.id.clone(), target.item.clone()))
                .ok_or_else(|| {
                    Error::internal(format!("secret '{}' was not materialized", target.reference))
                })?;
            env.insert(var.clone(), value.clone());
        }

        Ok(env)
    }

    fn mounts(&self, srv_ref: &str, service: &Service) -> Result<Vec<Mount>> {
        let mut mounts = Vec::new();

        for (target, declared) in &service.volumes {
            let source = self.volumes.get(declared).ok_or_else(|| {
                Error::internal(format!("volume '{}' of service '{}' was not created", declared, srv_ref))
            })?;
            mounts.push(Mount::Volume {
                source: source.clone(),
                target: target.clone(),
                read_only: false,
            });
        }

        for (target, bind) in &service.bind_mounts {
            mounts.push(Mount::Bind {
                source: include_path(self.dir, &bind.source)?,
                target: target.clone(),
                read_only: bind.read_only,
            });
        }

        for (target, tmpfs) in &service.tmpfs_mounts {
            mounts.push(Mount::Tmpfs {
                target: target.clone(),
                size: tmpfs.size,
                mode: tmpfs.mode,
            });
        }

        for (target, res) in &service.host_resources {
            if let Some(resource) = self.assets.host_resources.get(&res.reference) {
                mounts.push(Mount::Bind {
                    source: resource.path.clone(),
                    target: target.clone(),
                    read_only: res.read_only,
                });
            }
        }

        for (target, secret_target) in &service.secret_mounts {
            let Some(secret) = self.assets.secrets.get(&secret_target.reference) else {
                continue;
            };
            let path = self
                .assets
                .secret_paths
                .get(&(secret.id.clone(), secret_target.item.clone()))
                .ok_or_else(|| {
                    Error::internal(format!(
                        "secret '{}' was not materialized",
                        secret_target.reference
                    ))
                })?;
            mounts.push(Mount::Bind {
                source: path.clone(),
                target: target.clone(),
                read_only: true,
            });
        }

        Ok(mounts)
    }
}

fn render(template: Option<&str>, alias: &str) -> String {
    match template {
        Some(t) => t.replace(REF_PLACEHOLDER, alias),
        None => alias.to_string(),
    }
}

fn include_path(dir: &str, source: &str) -> Result<String> {
    let relative = Path::new(source.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::internal(format!(
            "bind mount source '{}' leaves the include directory",
            source
        )));
    }
    Ok(Path::new(dir).join(relative).to_string_lossy().into_owned())
}

/// Drives the container engine
pub struct Materializer {
    engine: Arc<dyn ContainerEngine>,
    naming: VolumeNaming,
}

impl Materializer {
    pub fn new(engine: Arc<dyn ContainerEngine>, naming: VolumeNaming) -> Self {
        Self { engine, naming }
    }

    pub fn naming(&self) -> &VolumeNaming {
        &self.naming
    }

    pub fn engine(&self) -> Arc<dyn ContainerEngine> {
        self.engine.clone()
    }

    pub async fn list_volumes(&self, scope: &CallScope) -> Result<Vec<VolumeInfo>> {
        scope
            .http("list volumes", |token| async move {
                self.engine.list_volumes(&VolumeFilter::default(), &token).await
            })
            .await
    }

    /// Create the given declared volumes for `dep_id`, returning
    /// declared -> engine volume name
    #[instrument(skip_all, fields(deployment_id = %dep_id))]
    pub async fn create_volumes(
        &self,
        scope: &CallScope,
        dep_id: &DeploymentId,
        declared: &BTreeSet<String>,
        comp: &mut CompensationStack,
    ) -> Result<BTreeMap<String, String>> {
        let mut created = BTreeMap::new();
        if declared.is_empty() {
            return Ok(created);
        }

        let existing: BTreeSet<String> = self
            .list_volumes(scope)
            .await?
            .into_iter()
            .map(|v| v.name)
            .collect();

        for volume in declared {
            scope.check()?;
            let spec = self.naming.spec(dep_id, volume);
            if existing.contains(&spec.name) {
                debug!(volume = %spec.name, "Reusing existing volume");
                created.insert(volume.clone(), spec.name);
                continue;
            }

            let name = scope
                .http("create volume", |token| async move {
                    self.engine.create_volume(&spec, &token).await
                })
                .await?;
            let engine = self.engine.clone();
            let undo_name = name.clone();
            comp.push(format!("remove volume {}", name), move |token| async move {
                engine
                    .remove_volume(&undo_name, true, &token)
                    .await
                    .map_err(Error::from)
            });
            created.insert(volume.clone(), name);
        }
        Ok(created)
    }

    /// Create every container of the plan in start order
    #[instrument(skip_all, fields(deployment_id = %plan.dep_id, instance_id = %plan.instance_id))]
    pub async fn create_containers(
        &self,
        scope: &CallScope,
        plan: &InstancePlan<'_>,
        comp: &mut CompensationStack,
    ) -> Result<DepInstance> {
        let mut containers = BTreeMap::new();

        for (order, srv_ref) in service_order(plan.module)?.into_iter().enumerate() {
            scope.check()?;
            let service = plan.module.services.get(&srv_ref).ok_or_else(|| {
                Error::internal(format!("unknown service '{}'", srv_ref))
            })?;
            let spec = plan.container_spec(&srv_ref, service)?;
            let alias = spec.name.clone();

            let id = scope
                .http("create container", |token| async move {
                    self.engine.create_container(&spec, &token).await
                })
                .await?;
            let engine = self.engine.clone();
            let undo_id = id.clone();
            comp.push(format!("remove container {}", alias), move |token| async move {
                engine
                    .remove_container(&undo_id, true, &token)
                    .await
                    .map_err(Error::from)
            });

            debug!(service = %srv_ref, container_id = %id, "Container created");
            containers.insert(
                srv_ref.clone(),
                DepContainer {
                    id,
                    srv_ref,
                    alias,
                    order: order as u32,
                },
            );
        }

        info!(containers = containers.len(), "Containers created");
        Ok(DepInstance {
            id: plan.instance_id.clone(),
            created: Utc::now(),
            containers,
        })
    }

    /// Start containers in order, registering a stop for each one started
    pub async fn start_containers(
        &self,
        scope: &CallScope,
        containers: &[&DepContainer],
        comp: &mut CompensationStack,
    ) -> Result<()> {
        for container in containers {
            scope.check()?;
            scope
                .http("start container", |token| async move {
                    self.engine.start_container(&container.id, &token).await
                })
                .await
                .map_err(|e| e.context(format!("service '{}'", container.srv_ref)))?;

            let engine = self.engine.clone();
            let id = container.id.clone();
            comp.push(format!("stop container {}", container.alias), move |token| async move {
                engine.stop_container(&id, &token).await.map_err(Error::from)
            });
        }
        Ok(())
    }

    /// Stop containers in the exact reverse of `containers`
    pub async fn stop_containers(
        &self,
        scope: &CallScope,
        containers: &[&DepContainer],
    ) -> Result<()> {
        for container in containers.iter().rev() {
            scope
                .http("stop container", |token| async move {
                    self.engine.stop_container(&container.id, &token).await
                })
                .await
                .map_err(|e| e.context(format!("service '{}'", container.srv_ref)))?;
        }
        Ok(())
    }

    /// Remove containers in reverse order; containers already gone are skipped
    pub async fn remove_containers(
        &self,
        scope: &CallScope,
        containers: &[&DepContainer],
    ) -> Result<()> {
        for container in containers.iter().rev() {
            let res = scope
                .http("remove container", |token| async move {
                    self.engine.remove_container(&container.id, true, &token).await
                })
                .await;
            match res {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!(container_id = %container.id, "Container already removed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn remove_volumes(&self, scope: &CallScope, names: &[String]) -> Result<()> {
        for name in names {
            let res = scope
                .http("remove volume", |token| async move {
                    self.engine.remove_volume(name, true, &token).await
                })
                .await;
            match res {
                Ok(()) => debug!(volume = %name, "Volume removed"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Timeouts;
    use modman_clients::{EngineOp, HostResource, InMemoryContainerEngine};
    use modman_types::{ConfigValue, DepSecret};
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn module() -> Module {
        serde_json::from_value(json!({
            "id": "github.com/acme/broker",
            "name": "broker",
            "version": "1.0.0",
            "volumes": ["data"],
            "dependencies": { "github.com/acme/db": "" },
            "configs": {
                "topics": { "data_type": "string", "is_slice": true, "delimiter": ";" }
            },
            "host_resources": { "serial": {} },
            "secrets": { "creds": {} },
            "services": {
                "api": {
                    "image": "acme/api:1",
                    "env_vars": { "MODE": "edge" },
                    "configs": { "TOPICS": "topics" },
                    "srv_references": {
                        "BROKER_URL": { "service": "broker", "template": "tcp://{ref}:1883" }
                    },
                    "ext_dependencies": {
                        "DB_HOST": { "module": "github.com/acme/db", "service": "db" }
                    },
                    "secret_vars": { "PASS": { "ref": "creds", "item": "pass" } },
                    "ports": [{ "number": 8080, "bindings": [80] }]
                },
                "broker": {
                    "image": "acme/broker:1",
                    "volumes": { "/data": "data" },
                    "bind_mounts": { "/etc/broker": { "source": "/conf", "read_only": true } },
                    "tmpfs_mounts": { "/tmp": { "size": 1048576 } },
                    "host_resources": { "/dev/ttyS0": { "ref": "serial" } },
                    "secret_mounts": { "/run/creds": { "ref": "creds", "item": "pass" } }
                }
            }
        }))
        .unwrap()
    }

    fn assets() -> ResolvedAssets {
        let mut assets = ResolvedAssets::default();
        assets.configs.insert(
            "topics".into(),
            ConfigValue::StringSlice(vec!["a".into(), "b".into()]),
        );
        assets.host_resources.insert(
            "serial".into(),
            HostResource {
                id: "tty0".into(),
                name: "serial".into(),
                resource_type: None,
                path: "/dev/ttyUSB0".into(),
            },
        );
        assets.secrets.insert(
            "creds".into(),
            DepSecret {
                id: "s1".into(),
                mounted_items: [Some("pass".to_string())].into(),
                env_items: [Some("pass".to_string())].into(),
            },
        );
        let key = ("s1".to_string(), Some("pass".to_string()));
        assets.secret_paths.insert(key.clone(), "/run/secrets/s1/pass".into());
        assets.secret_values.insert(key, "pw".into());
        assets
    }

    struct Plan {
        dep_id: DeploymentId,
        instance_id: InstanceId,
        module: Module,
        assets: ResolvedAssets,
        volumes: BTreeMap<String, String>,
        ext: BTreeMap<ModuleId, BTreeMap<String, String>>,
    }

    impl Plan {
        fn new() -> Self {
            Self {
                dep_id: DeploymentId::generate(),
                instance_id: InstanceId::generate(),
                module: module(),
                assets: assets(),
                volumes: [("data".to_string(), "vol-data".to_string())].into(),
                ext: [(
                    ModuleId::new("github.com/acme/db"),
                    [("db".to_string(), "mm-000000000000-db".to_string())].into(),
                )]
                .into(),
            }
        }

        fn plan(&self) -> InstancePlan<'_> {
            InstancePlan {
                dep_id: &self.dep_id,
                instance_id: &self.instance_id,
                module: &self.module,
                dir: "/var/lib/modman/include/d1",
                assets: &self.assets,
                volumes: &self.volumes,
                ext_aliases: &self.ext,
            }
        }
    }

    #[test]
    fn test_service_order_follows_references() {
        assert_eq!(service_order(&module()).unwrap(), vec!["broker", "api"]);
    }

    #[test]
    fn test_env_rendering() {
        let fixture = Plan::new();
        let plan = fixture.plan();
        let spec = plan
            .container_spec("api", &fixture.module.services["api"])
            .unwrap();

        let broker = container_name(&fixture.instance_id, "broker");
        assert_eq!(spec.env["MODE"], "edge");
        assert_eq!(spec.env["TOPICS"], "a;b");
        assert_eq!(spec.env["BROKER_URL"], format!("tcp://{}:1883", broker));
        assert_eq!(spec.env["DB_HOST"], "mm-000000000000-db");
        assert_eq!(spec.env["PASS"], "pw");
        assert_eq!(spec.env[ENV_DEPLOYMENT_ID], fixture.dep_id.to_string());
        assert_eq!(spec.ports[0].host_ports, vec![80]);
        assert_eq!(spec.network_aliases, vec![spec.name.clone()]);
    }

    #[test]
    fn test_mounts() {
        let fixture = Plan::new();
        let spec = fixture
            .plan()
            .container_spec("broker", &fixture.module.services["broker"])
            .unwrap();

        assert!(spec.mounts.contains(&Mount::Volume {
            source: "vol-data".into(),
            target: "/data".into(),
            read_only: false,
        }));
        assert!(spec.mounts.contains(&Mount::Bind {
            source: "/var/lib/modman/include/d1/conf".into(),
            target: "/etc/broker".into(),
            read_only: true,
        }));
        assert!(spec.mounts.contains(&Mount::Bind {
            source: "/dev/ttyUSB0".into(),
            target: "/dev/ttyS0".into(),
            read_only: false,
        }));
        assert!(spec.mounts.contains(&Mount::Bind {
            source: "/run/secrets/s1/pass".into(),
            target: "/run/creds".into(),
            read_only: true,
        }));
        assert!(spec.mounts.iter().any(|m| m.target() == "/tmp"));
    }

    #[test]
    fn test_missing_ext_deployment_is_internal() {
        let mut fixture = Plan::new();
        fixture.ext.clear();
        let err = fixture
            .plan()
            .container_spec("api", &fixture.module.services["api"])
            .unwrap_err();
        assert_eq!(err.kind(), modman_types::ErrorKind::Internal);
    }

    #[test]
    fn test_bind_source_cannot_escape() {
        assert!(include_path("/inc", "../etc/passwd").is_err());
        assert_eq!(include_path("/inc", "conf/a.toml").unwrap(), "/inc/conf/a.toml");
    }

    #[tokio::test]
    async fn test_create_failure_is_compensated() {
        let engine = Arc::new(InMemoryContainerEngine::new());
        let materializer = Materializer::new(engine.clone(), VolumeNaming::default());
        let scope = CallScope::new(&CancellationToken::new(), Timeouts::default());
        let fixture = Plan::new();
        let mut comp = CompensationStack::new(Duration::from_secs(1));

        let volumes = materializer
            .create_volumes(&scope, &fixture.dep_id, &fixture.module.volumes, &mut comp)
            .await
            .unwrap();
        assert_eq!(volumes.len(), 1);

        engine.fail(EngineOp::CreateContainer, 1);
        let result = materializer
            .create_containers(&scope, &fixture.plan(), &mut comp)
            .await;
        assert!(result.is_err());
        assert_eq!(engine.container_count(), 1);

        comp.unwind().await;
        assert_eq!(engine.container_count(), 0);
        assert!(engine.volume_names().is_empty());
    }
}
