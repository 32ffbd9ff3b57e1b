//! Asset resolution
//!
//! Binds a module's declared host resources, secrets and configs to concrete
//! values for one deployment, and materializes the secret variants its
//! services use.

use crate::configs::resolve_configs;
use crate::scope::CallScope;
use modman_clients::{HostResource, HostResources, SecretStore, SecretVariantRequest};
use modman_types::{
    ConfigValue, DepAssets, DepInput, DepSecret, DeploymentId, Error, Module, Result,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Secret id and item
pub type SecretKey = (String, Option<String>);

/// Assets bound to a deployment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedAssets {
    /// Host resource reference -> resource
    pub host_resources: BTreeMap<String, HostResource>,
    /// Secret reference -> bound secret
    pub secrets: BTreeMap<String, DepSecret>,
    /// Materialized files
    pub secret_paths: BTreeMap<SecretKey, String>,
    /// Materialized values
    pub secret_values: BTreeMap<SecretKey, String>,
    pub configs: BTreeMap<String, ConfigValue>,
}

impl ResolvedAssets {
    pub fn to_dep_assets(&self) -> DepAssets {
        DepAssets {
            host_resources: self
                .host_resources
                .iter()
                .map(|(reference, res)| (reference.clone(), res.id.clone()))
                .collect(),
            secrets: self.secrets.clone(),
            configs: self.configs.clone(),
        }
    }

    /// Whether any secret is mounted as a file
    pub fn has_secret_files(&self) -> bool {
        !self.secret_paths.is_empty()
    }
}

pub struct AssetResolver {
    host: Arc<dyn HostResources>,
    secrets: Arc<dyn SecretStore>,
}

impl AssetResolver {
    pub fn new(host: Arc<dyn HostResources>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { host, secrets }
    }

    /// Resolve every asset of `module` for `dep_id`
    ///
    /// Secret variants are all-or-nothing: if materialization fails part way
    /// the deployment's path variants are cleaned before returning.
    #[instrument(skip_all, fields(deployment_id = %dep_id, module_id = %module.id))]
    pub async fn resolve(
        &self,
        scope: &CallScope,
        dep_id: &DeploymentId,
        module: &Module,
        input: &DepInput,
    ) -> Result<ResolvedAssets> {
        let mut assets = ResolvedAssets {
            configs: resolve_configs(&module.configs, &input.configs)?,
            ..Default::default()
        };
        self.resolve_host_resources(scope, module, input, &mut assets)
            .await?;
        self.resolve_secrets(scope, module, input, &mut assets).await?;

        if let Err(e) = self.materialize(scope, dep_id, &mut assets).await {
            let reference = dep_id.to_string();
            if let Err(clean) = scope
                .http("clean secret variants", |token| async move {
                    self.secrets.clean_path_variants(&reference, &token).await
                })
                .await
            {
                warn!(deployment_id = %dep_id, error = %clean, "Failed to clean secret variants");
            }
            return Err(e);
        }

        debug!(
            host_resources = assets.host_resources.len(),
            secrets = assets.secrets.len(),
            configs = assets.configs.len(),
            "Assets resolved"
        );
        Ok(assets)
    }

    async fn resolve_host_resources(
        &self,
        scope: &CallScope,
        module: &Module,
        input: &DepInput,
        assets: &mut ResolvedAssets,
    ) -> Result<()> {
        if let Some(unknown) = input
            .host_resources
            .keys()
            .find(|k| !module.host_resources.contains_key(*k))
        {
            return Err(Error::invalid_input(format!("unknown host resource '{}'", unknown)));
        }

        for (reference, requirement) in &module.host_resources {
            let Some(id) = input.host_resources.get(reference) else {
                if !requirement.tags.is_empty() {
                    return Err(Error::internal(format!(
                        "host resource '{}': discovery not implemented",
                        reference
                    )));
                }
                if requirement.required {
                    return Err(Error::invalid_input(format!(
                        "host resource '{}' is required",
                        reference
                    )));
                }
                continue;
            };

            let resource = scope
                .http("get host resource", |token| async move {
                    self.host.get_host_resource(id, &token).await
                })
                .await
                .map_err(|e| {
                    if e.is_not_found() {
                        Error::invalid_input(format!(
                            "host resource '{}': '{}' does not exist",
                            reference, id
                        ))
                    } else {
                        e
                    }
                })?;
            assets.host_resources.insert(reference.clone(), resource);
        }
        Ok(())
    }

    async fn resolve_secrets(
        &self,
        scope: &CallScope,
        module: &Module,
        input: &DepInput,
        assets: &mut ResolvedAssets,
    ) -> Result<()> {
        if let Some(unknown) = input
            .secrets
            .keys()
            .find(|k| !module.secrets.contains_key(*k))
        {
            return Err(Error::invalid_input(format!("unknown secret '{}'", unknown)));
        }

        for (reference, requirement) in &module.secrets {
            let Some(id) = input.secrets.get(reference) else {
                if !requirement.tags.is_empty() {
                    return Err(Error::internal(format!(
                        "secret '{}': discovery not implemented",
                        reference
                    )));
                }
                if requirement.required {
                    return Err(Error::invalid_input(format!(
                        "secret '{}' is required",
                        reference
                    )));
                }
                continue;
            };

            let secret = scope
                .http("get secret", |token| async move {
                    self.secrets.get_secret(id, &token).await
                })
                .await
                .map_err(|e| {
                    if e.is_not_found() {
                        Error::invalid_input(format!(
                            "secret '{}': '{}' does not exist",
                            reference, id
                        ))
                    } else {
                        e
                    }
                })?;

            let mut bound = DepSecret {
                id: secret.id.clone(),
                mounted_items: Default::default(),
                env_items: Default::default(),
            };
            for service in module.services.values() {
                for target in service.secret_mounts.values() {
                    if &target.reference == reference {
                        bound.mounted_items.insert(target.item.clone());
                    }
                }
                for target in service.secret_vars.values() {
                    if &target.reference == reference {
                        bound.env_items.insert(target.item.clone());
                    }
                }
            }

            let items = bound.mounted_items.iter().chain(bound.env_items.iter());
            for item in items.flatten() {
                if !secret.items.contains(item) {
                    return Err(Error::invalid_input(format!(
                        "secret '{}': '{}' has no item '{}'",
                        reference, id, item
                    )));
                }
            }
            assets.secrets.insert(reference.clone(), bound);
        }
        Ok(())
    }

    async fn materialize(
        &self,
        scope: &CallScope,
        dep_id: &DeploymentId,
        assets: &mut ResolvedAssets,
    ) -> Result<()> {
        let reference = dep_id.to_string();
        let mut files = Vec::new();
        let mut values = Vec::new();
        for secret in assets.secrets.values() {
            files.extend(secret.mounted_items.iter().map(|i| (secret.id.clone(), i.clone())));
            values.extend(secret.env_items.iter().map(|i| (secret.id.clone(), i.clone())));
        }

        for (id, item) in files {
            if assets.secret_paths.contains_key(&(id.clone(), item.clone())) {
                continue;
            }
            let request = SecretVariantRequest {
                id: id.clone(),
                item: item.clone(),
                reference: reference.clone(),
            };
            let variant = scope
                .http("init secret path variant", |token| async move {
                    self.secrets.init_path_variant(&request, &token).await
                })
                .await?;
            assets.secret_paths.insert((id, item), variant.path);
        }

        for (id, item) in values {
            if assets.secret_values.contains_key(&(id.clone(), item.clone())) {
                continue;
            }
            let request = SecretVariantRequest {
                id: id.clone(),
                item: item.clone(),
                reference: reference.clone(),
            };
            let variant = scope
                .http("init secret value variant", |token| async move {
                    self.secrets.init_value_variant(&request, &token).await
                })
                .await?;
            assets.secret_values.insert((id, item), variant.value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Timeouts;
    use modman_clients::{InMemoryHostResources, InMemorySecretStore, SecretOp};
    use modman_types::ErrorKind;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn module() -> Module {
        serde_json::from_value(json!({
            "id": "github.com/acme/broker",
            "name": "broker",
            "version": "1.0.0",
            "host_resources": {
                "serial": { "required": true },
                "camera": { "tags": ["usb", "video"] }
            },
            "secrets": {
                "creds": { "required": true },
                "tls": {}
            },
            "services": {
                "broker": {
                    "image": "acme/broker:1",
                    "secret_mounts": { "/etc/creds": { "ref": "creds", "item": "pass" } },
                    "secret_vars": {
                        "USER": { "ref": "creds", "item": "user" },
                        "PASS": { "ref": "creds", "item": "pass" }
                    },
                    "host_resources": { "/dev/ttyS0": { "ref": "serial" } }
                }
            }
        }))
        .unwrap()
    }

    struct Fixture {
        resolver: AssetResolver,
        secrets: Arc<InMemorySecretStore>,
    }

    fn fixture() -> Fixture {
        let host = Arc::new(InMemoryHostResources::new());
        host.insert(HostResource {
            id: "tty0".into(),
            name: "serial".into(),
            resource_type: None,
            path: "/dev/ttyUSB0".into(),
        });
        let secrets = Arc::new(InMemorySecretStore::new());
        secrets.insert("s1", "mqtt", "whole", &[("user", "admin"), ("pass", "pw")]);
        Fixture {
            resolver: AssetResolver::new(host, secrets.clone()),
            secrets,
        }
    }

    fn input(value: serde_json::Value) -> DepInput {
        serde_json::from_value(value).unwrap()
    }

    fn scope() -> CallScope {
        CallScope::new(&CancellationToken::new(), Timeouts::default())
    }

    #[tokio::test]
    async fn test_resolve_binds_and_materializes() {
        let mut module = module();
        module.host_resources.get_mut("camera").unwrap().tags.clear();
        let f = fixture();
        let dep = DeploymentId::generate();

        let assets = f
            .resolver
            .resolve(
                &scope(),
                &dep,
                &module,
                &input(json!({
                    "host_resources": { "serial": "tty0" },
                    "secrets": { "creds": "s1" }
                })),
            )
            .await
            .unwrap();

        assert_eq!(assets.host_resources["serial"].path, "/dev/ttyUSB0");
        assert!(!assets.host_resources.contains_key("camera"));
        assert_eq!(assets.secret_values[&("s1".into(), Some("user".into()))], "admin");
        assert_eq!(assets.secret_paths.len(), 1);
        assert_eq!(f.secrets.path_variants(&dep.to_string()), 1);

        let stored = assets.to_dep_assets();
        assert_eq!(stored.host_resources["serial"], "tty0");
        assert_eq!(stored.secrets["creds"].env_items.len(), 2);
    }

    #[tokio::test]
    async fn test_tag_discovery_is_internal() {
        let f = fixture();
        let err = f
            .resolver
            .resolve(
                &scope(),
                &DeploymentId::generate(),
                &module(),
                &input(json!({
                    "host_resources": { "serial": "tty0" },
                    "secrets": { "creds": "s1" }
                })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.message().contains("discovery not implemented"));
    }

    #[tokio::test]
    async fn test_missing_and_unknown_ids() {
        let mut module = module();
        module.host_resources.remove("camera");
        let f = fixture();

        let err = f
            .resolver
            .resolve(&scope(), &DeploymentId::generate(), &module, &input(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = f
            .resolver
            .resolve(
                &scope(),
                &DeploymentId::generate(),
                &module,
                &input(json!({
                    "host_resources": { "serial": "tty9" },
                    "secrets": { "creds": "s1" }
                })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.message().contains("tty9"));
    }

    #[tokio::test]
    async fn test_variant_failure_cleans_up() {
        let mut module = module();
        module.host_resources.remove("camera");
        let f = fixture();
        f.secrets.fail(SecretOp::InitValueVariant, 1);
        f.secrets
            .load_path_variants("x", &CancellationToken::new())
            .await
            .unwrap();
        let dep = DeploymentId::generate();
        f.secrets
            .load_path_variants(&dep.to_string(), &CancellationToken::new())
            .await
            .unwrap();

        let err = f
            .resolver
            .resolve(
                &scope(),
                &dep,
                &module,
                &input(json!({
                    "host_resources": { "serial": "tty0" },
                    "secrets": { "creds": "s1" }
                })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!f.secrets.is_loaded(&dep.to_string()));
        assert!(f.secrets.is_loaded("x"));
    }
}
