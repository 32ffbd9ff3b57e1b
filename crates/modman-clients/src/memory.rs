//! In-memory implementations of the collaborator traits
//!
//! These back the daemon's dry-run mode and the test suites. Failures can be
//! injected per operation to exercise rollback paths.

use crate::engine::*;
use crate::error::{ClientError, ClientResult};
use crate::host::{HostResource, HostResources};
use crate::secrets::*;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Countdown of successful calls before an injected failure, per operation
struct Failures<Op> {
    pending: DashMap<Op, usize>,
}

impl<Op: Eq + Hash + Copy + std::fmt::Debug> Failures<Op> {
    fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    fn arm(&self, op: Op, after: usize) {
        self.pending.insert(op, after);
    }

    fn check(&self, op: Op) -> ClientResult<()> {
        let fire = match self.pending.get_mut(&op) {
            Some(remaining) if *remaining == 0 => true,
            Some(mut remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        };
        if fire {
            self.pending.remove(&op);
            return Err(ClientError::Unavailable(format!("injected failure: {:?}", op)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreateContainer,
    StartContainer,
    StopContainer,
    RemoveContainer,
    CreateVolume,
    RemoveVolume,
}

/// Token canceled once `remaining` more calls to `op` have succeeded
struct Trip {
    op: EngineOp,
    remaining: usize,
    token: CancellationToken,
}

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    state: ContainerState,
}

/// In-memory container engine
pub struct InMemoryContainerEngine {
    containers: DashMap<String, FakeContainer>,
    volumes: DashMap<String, VolumeInfo>,
    failures: Failures<EngineOp>,
    trips: Mutex<Vec<Trip>>,
    events: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl Default for InMemoryContainerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryContainerEngine {
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            volumes: DashMap::new(),
            failures: Failures::new(),
            trips: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fail the call to `op` made after `after` successful ones
    pub fn fail(&self, op: EngineOp, after: usize) {
        self.failures.arm(op, after);
    }

    /// Cancel `token` right after the `after`-th successful call to `op`
    pub fn cancel_after(&self, op: EngineOp, after: usize, token: CancellationToken) {
        self.trips.lock().push(Trip {
            op,
            remaining: after.max(1),
            token,
        });
    }

    fn succeeded(&self, op: EngineOp) {
        self.trips.lock().retain_mut(|trip| {
            if trip.op != op {
                return true;
            }
            trip.remaining -= 1;
            if trip.remaining == 0 {
                trip.token.cancel();
                return false;
            }
            true
        });
    }

    /// Log of `"<op> <container name>"` entries in call order
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    pub fn volume_names(&self) -> BTreeSet<String> {
        self.volumes.iter().map(|v| v.key().clone()).collect()
    }

    pub fn container_spec(&self, id: &str) -> Option<ContainerSpec> {
        self.containers.get(id).map(|c| c.spec.clone())
    }

    pub fn container_state(&self, id: &str) -> Option<ContainerState> {
        self.containers.get(id).map(|c| c.state)
    }

    /// Names of running containers
    pub fn running(&self) -> BTreeSet<String> {
        self.containers
            .iter()
            .filter(|c| c.state == ContainerState::Running)
            .map(|c| c.spec.name.clone())
            .collect()
    }

    /// Insert a volume as if created outside of modman
    pub fn seed_volume(&self, name: &str, labels: BTreeMap<String, String>) {
        self.volumes.insert(
            name.to_string(),
            VolumeInfo {
                name: name.to_string(),
                labels,
            },
        );
    }

    fn record(&self, op: &str, id: &str) {
        let name = self
            .containers
            .get(id)
            .map(|c| c.spec.name.clone())
            .unwrap_or_else(|| id.to_string());
        self.events.lock().push(format!("{} {}", op, name));
    }

    fn not_found(id: &str) -> ClientError {
        ClientError::NotFound(format!("container {}", id))
    }
}

#[async_trait]
impl ContainerEngine for InMemoryContainerEngine {
    async fn create_container(
        &self,
        spec: &ContainerSpec,
        _cancel: &CancellationToken,
    ) -> ClientResult<String> {
        self.failures.check(EngineOp::CreateContainer)?;
        if self.containers.iter().any(|c| c.spec.name == spec.name) {
            return Err(ClientError::Api {
                status: 409,
                message: format!("container name '{}' in use", spec.name),
            });
        }
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                state: ContainerState::Created,
            },
        );
        self.record("create", &id);
        self.succeeded(EngineOp::CreateContainer);
        Ok(id)
    }

    async fn start_container(&self, id: &str, _cancel: &CancellationToken) -> ClientResult<()> {
        self.failures.check(EngineOp::StartContainer)?;
        let mut container = self.containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.state = ContainerState::Running;
        drop(container);
        self.record("start", id);
        self.succeeded(EngineOp::StartContainer);
        Ok(())
    }

    async fn stop_container(&self, id: &str, _cancel: &CancellationToken) -> ClientResult<()> {
        self.failures.check(EngineOp::StopContainer)?;
        let mut container = self.containers.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        container.state = ContainerState::Stopped;
        drop(container);
        self.record("stop", id);
        self.succeeded(EngineOp::StopContainer);
        Ok(())
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        _cancel: &CancellationToken,
    ) -> ClientResult<()> {
        self.failures.check(EngineOp::RemoveContainer)?;
        let state = self.container_state(id).ok_or_else(|| Self::not_found(id))?;
        if state == ContainerState::Running && !force {
            return Err(ClientError::Api {
                status: 409,
                message: format!("container {} is running", id),
            });
        }
        self.record("remove", id);
        self.containers.remove(id);
        self.succeeded(EngineOp::RemoveContainer);
        Ok(())
    }

    async fn get_container(
        &self,
        id: &str,
        _cancel: &CancellationToken,
    ) -> ClientResult<ContainerInfo> {
        let container = self.containers.get(id).ok_or_else(|| Self::not_found(id))?;
        Ok(ContainerInfo {
            id: id.to_string(),
            name: container.spec.name.clone(),
            image: container.spec.image.clone(),
            state: container.state,
        })
    }

    async fn create_volume(
        &self,
        spec: &VolumeSpec,
        _cancel: &CancellationToken,
    ) -> ClientResult<String> {
        self.failures.check(EngineOp::CreateVolume)?;
        self.volumes
            .entry(spec.name.clone())
            .or_insert_with(|| VolumeInfo {
                name: spec.name.clone(),
                labels: spec.labels.clone(),
            });
        self.succeeded(EngineOp::CreateVolume);
        Ok(spec.name.clone())
    }

    async fn list_volumes(
        &self,
        filter: &VolumeFilter,
        _cancel: &CancellationToken,
    ) -> ClientResult<Vec<VolumeInfo>> {
        Ok(self
            .volumes
            .iter()
            .filter(|v| filter.matches(v.value()))
            .map(|v| v.value().clone())
            .collect())
    }

    async fn remove_volume(
        &self,
        name: &str,
        _force: bool,
        _cancel: &CancellationToken,
    ) -> ClientResult<()> {
        self.failures.check(EngineOp::RemoveVolume)?;
        self.volumes
            .remove(name)
            .ok_or_else(|| ClientError::NotFound(format!("volume {}", name)))?;
        self.succeeded(EngineOp::RemoveVolume);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretOp {
    InitPathVariant,
    InitValueVariant,
    Load,
    Clean,
}

#[derive(Debug, Clone)]
struct FakeSecret {
    secret: Secret,
    value: String,
    items: BTreeMap<String, String>,
}

/// In-memory secret manager
pub struct InMemorySecretStore {
    secrets: DashMap<String, FakeSecret>,
    /// Path variants per reference
    variants: DashMap<String, BTreeSet<(String, Option<String>)>>,
    loaded: DashMap<String, ()>,
    failures: Failures<SecretOp>,
}

impl Default for InMemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self {
            secrets: DashMap::new(),
            variants: DashMap::new(),
            loaded: DashMap::new(),
            failures: Failures::new(),
        }
    }

    pub fn insert(&self, id: &str, name: &str, value: &str, items: &[(&str, &str)]) {
        let items: BTreeMap<String, String> = items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.secrets.insert(
            id.to_string(),
            FakeSecret {
                secret: Secret {
                    id: id.to_string(),
                    name: name.to_string(),
                    secret_type: None,
                    items: items.keys().cloned().collect(),
                },
                value: value.to_string(),
                items,
            },
        );
    }

    pub fn fail(&self, op: SecretOp, after: usize) {
        self.failures.arm(op, after);
    }

    /// Number of path variants held for `reference`
    pub fn path_variants(&self, reference: &str) -> usize {
        self.variants.get(reference).map_or(0, |v| v.len())
    }

    pub fn is_loaded(&self, reference: &str) -> bool {
        self.loaded.contains_key(reference)
    }

    fn lookup(&self, request: &SecretVariantRequest) -> ClientResult<String> {
        let secret = self
            .secrets
            .get(&request.id)
            .ok_or_else(|| ClientError::NotFound(format!("secret {}", request.id)))?;
        match &request.item {
            None => Ok(secret.value.clone()),
            Some(item) => secret.items.get(item).cloned().ok_or_else(|| {
                ClientError::NotFound(format!("item '{}' of secret {}", item, request.id))
            }),
        }
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get_secret(&self, id: &str, _cancel: &CancellationToken) -> ClientResult<Secret> {
        self.secrets
            .get(id)
            .map(|s| s.secret.clone())
            .ok_or_else(|| ClientError::NotFound(format!("secret {}", id)))
    }

    async fn init_path_variant(
        &self,
        request: &SecretVariantRequest,
        _cancel: &CancellationToken,
    ) -> ClientResult<SecretPathVariant> {
        self.failures.check(SecretOp::InitPathVariant)?;
        self.lookup(request)?;
        self.variants
            .entry(request.reference.clone())
            .or_default()
            .insert((request.id.clone(), request.item.clone()));
        Ok(SecretPathVariant {
            id: request.id.clone(),
            item: request.item.clone(),
            path: format!(
                "/run/modman/secrets/{}/{}/{}",
                request.reference,
                request.id,
                request.item.as_deref().unwrap_or("secret")
            ),
        })
    }

    async fn init_value_variant(
        &self,
        request: &SecretVariantRequest,
        _cancel: &CancellationToken,
    ) -> ClientResult<SecretValueVariant> {
        self.failures.check(SecretOp::InitValueVariant)?;
        Ok(SecretValueVariant {
            id: request.id.clone(),
            item: request.item.clone(),
            value: self.lookup(request)?,
        })
    }

    async fn load_path_variants(
        &self,
        reference: &str,
        _cancel: &CancellationToken,
    ) -> ClientResult<()> {
        self.failures.check(SecretOp::Load)?;
        self.loaded.insert(reference.to_string(), ());
        Ok(())
    }

    async fn clean_path_variants(
        &self,
        reference: &str,
        _cancel: &CancellationToken,
    ) -> ClientResult<()> {
        self.failures.check(SecretOp::Clean)?;
        self.loaded.remove(reference);
        Ok(())
    }
}

/// In-memory host resource service
#[derive(Default)]
pub struct InMemoryHostResources {
    resources: DashMap<String, HostResource>,
}

impl InMemoryHostResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resource: HostResource) {
        self.resources.insert(resource.id.clone(), resource);
    }
}

#[async_trait]
impl HostResources for InMemoryHostResources {
    async fn get_host_resource(
        &self,
        id: &str,
        _cancel: &CancellationToken,
    ) -> ClientResult<HostResource> {
        self.resources
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| ClientError::NotFound(format!("host resource {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "acme/api:1".to_string(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            mounts: Vec::new(),
            ports: Vec::new(),
            network_aliases: Vec::new(),
            run_config: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let engine = InMemoryContainerEngine::new();
        let cancel = CancellationToken::new();

        let id = engine.create_container(&spec("api"), &cancel).await.unwrap();
        engine.start_container(&id, &cancel).await.unwrap();
        assert!(engine.running().contains("api"));

        // Running containers need force
        assert!(engine.remove_container(&id, false, &cancel).await.is_err());
        engine.stop_container(&id, &cancel).await.unwrap();
        engine.remove_container(&id, false, &cancel).await.unwrap();

        assert_eq!(
            engine.events(),
            vec!["create api", "start api", "stop api", "remove api"]
        );
        assert!(matches!(
            engine.get_container(&id, &cancel).await,
            Err(ClientError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_container_name_rejected() {
        let engine = InMemoryContainerEngine::new();
        let cancel = CancellationToken::new();
        engine.create_container(&spec("api"), &cancel).await.unwrap();
        assert!(matches!(
            engine.create_container(&spec("api"), &cancel).await,
            Err(ClientError::Api { status: 409, .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let engine = InMemoryContainerEngine::new();
        let cancel = CancellationToken::new();
        engine.fail(EngineOp::CreateContainer, 1);

        assert!(engine.create_container(&spec("a"), &cancel).await.is_ok());
        assert!(engine.create_container(&spec("b"), &cancel).await.is_err());
        assert!(engine.create_container(&spec("c"), &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_after_successful_calls() {
        let engine = InMemoryContainerEngine::new();
        let cancel = CancellationToken::new();
        let job = CancellationToken::new();
        engine.cancel_after(EngineOp::CreateContainer, 2, job.clone());

        engine.create_container(&spec("a"), &cancel).await.unwrap();
        assert!(!job.is_cancelled());
        engine.create_container(&spec("b"), &cancel).await.unwrap();
        assert!(job.is_cancelled());
    }

    #[tokio::test]
    async fn test_volume_create_is_idempotent() {
        let engine = InMemoryContainerEngine::new();
        let cancel = CancellationToken::new();
        let labels: BTreeMap<_, _> = [("owner".to_string(), "d1".to_string())].into();
        let volume = VolumeSpec {
            name: "data".into(),
            labels: labels.clone(),
        };
        engine.create_volume(&volume, &cancel).await.unwrap();
        engine.create_volume(&volume, &cancel).await.unwrap();
        engine.seed_volume("other", BTreeMap::new());

        let owned = engine
            .list_volumes(&VolumeFilter { labels }, &cancel)
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(engine.volume_names().len(), 2);
    }

    #[tokio::test]
    async fn test_secret_variants_per_reference() {
        let store = InMemorySecretStore::new();
        let cancel = CancellationToken::new();
        store.insert("s1", "mqtt", "whole", &[("user", "admin"), ("pass", "pw")]);

        let request = SecretVariantRequest {
            id: "s1".into(),
            item: Some("pass".into()),
            reference: "dep-1".into(),
        };
        let path = store.init_path_variant(&request, &cancel).await.unwrap();
        assert!(path.path.ends_with("/dep-1/s1/pass"));
        let value = store.init_value_variant(&request, &cancel).await.unwrap();
        assert_eq!(value.value, "pw");

        store.load_path_variants("dep-1", &cancel).await.unwrap();
        assert!(store.is_loaded("dep-1"));
        store.clean_path_variants("dep-1", &cancel).await.unwrap();
        assert!(!store.is_loaded("dep-1"));
        // Registrations survive so the variants can be loaded again
        assert_eq!(store.path_variants("dep-1"), 1);
    }
}
