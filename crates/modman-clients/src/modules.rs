//! Module source contract and the bundled module registry
//!
//! The registry loads module descriptors from a directory laid out as
//!
//! ```text
//! modules/
//!   broker/
//!     module.json
//!     include/        (optional, bind-mount sources)
//!   standalone.json
//! ```
//!
//! and prepares a per-deployment copy of the include directory.

use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use dashmap::DashMap;
use modman_types::{DeploymentId, Module, ModuleId};
use semver::{Version, VersionReq};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const DESCRIPTOR_FILE: &str = "module.json";
const INCLUDE_DIR: &str = "include";

#[async_trait]
pub trait ModuleSource: Send + Sync {
    async fn get_module(&self, id: &ModuleId) -> ClientResult<Module>;

    /// All modules `id` transitively depends on, excluding `id` itself
    async fn dependency_tree(&self, id: &ModuleId) -> ClientResult<BTreeMap<ModuleId, Module>>;

    /// Create the include directory for a new deployment and return its path
    async fn prepare_include_dir(&self, module: &Module, dep_id: &DeploymentId)
        -> ClientResult<String>;

    async fn remove_include_dir(&self, dir: &str) -> ClientResult<()>;
}

/// Module registry backed by memory, optionally mirrored on disk
pub struct ModuleRegistry {
    modules: DashMap<ModuleId, Module>,
    /// Include directory sources per module
    sources: DashMap<ModuleId, PathBuf>,
    /// Where per-deployment include directories are created; `None` keeps
    /// them virtual
    include_root: Option<PathBuf>,
    prepared: DashMap<String, ModuleId>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModuleRegistry {
    pub fn new(include_root: Option<PathBuf>) -> Self {
        Self {
            modules: DashMap::new(),
            sources: DashMap::new(),
            include_root,
            prepared: DashMap::new(),
        }
    }

    /// Register a module, replacing any previous version
    pub fn insert(&self, module: Module) {
        self.modules.insert(module.id.clone(), module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Include directories currently prepared
    pub fn prepared_dirs(&self) -> Vec<String> {
        self.prepared.iter().map(|e| e.key().clone()).collect()
    }

    /// Load every module descriptor found in `dir`
    pub async fn load_dir(&self, dir: &Path) -> ClientResult<usize> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut loaded = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let (descriptor, include) = if entry.file_type().await?.is_dir() {
                (path.join(DESCRIPTOR_FILE), Some(path.join(INCLUDE_DIR)))
            } else if path.extension().is_some_and(|e| e == "json") {
                (path.clone(), None)
            } else {
                continue;
            };

            if !tokio::fs::try_exists(&descriptor).await? {
                debug!(path = %path.display(), "Skipping directory without descriptor");
                continue;
            }

            let raw = tokio::fs::read(&descriptor).await?;
            let module: Module = serde_json::from_slice(&raw).map_err(|e| {
                ClientError::Invalid(format!("{}: {}", descriptor.display(), e))
            })?;
            module
                .validate()
                .map_err(|e| ClientError::Invalid(e.message().to_string()))?;

            if let Some(include) = include {
                if tokio::fs::try_exists(&include).await? {
                    self.sources.insert(module.id.clone(), include);
                }
            }
            info!(module_id = %module.id, version = %module.version, "Loaded module");
            self.insert(module);
            loaded += 1;
        }

        Ok(loaded)
    }
}

fn check_version(dependent: &Module, required: &Module, constraint: &str) -> ClientResult<()> {
    if constraint.trim().is_empty() {
        return Ok(());
    }
    let req = VersionReq::parse(constraint).map_err(|e| {
        ClientError::Dependency(format!(
            "module '{}' has invalid constraint '{}' for '{}': {}",
            dependent.id, constraint, required.id, e
        ))
    })?;
    let version = Version::parse(&required.version).map_err(|e| {
        ClientError::Dependency(format!(
            "module '{}' has invalid version '{}': {}",
            required.id, required.version, e
        ))
    })?;
    if !req.matches(&version) {
        return Err(ClientError::Dependency(format!(
            "module '{}' requires '{}' {}, installed {}",
            dependent.id, required.id, constraint, required.version
        )));
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> ClientResult<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(std::io::Error::other)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn copy_dir(from: &Path, to: &Path) -> ClientResult<()> {
    let (from, to) = (from.to_path_buf(), to.to_path_buf());
    tokio::task::spawn_blocking(move || copy_tree(&from, &to))
        .await
        .map_err(|e| ClientError::Unavailable(format!("include copy: {}", e)))?
}

#[async_trait]
impl ModuleSource for ModuleRegistry {
    async fn get_module(&self, id: &ModuleId) -> ClientResult<Module> {
        self.modules
            .get(id)
            .map(|m| m.clone())
            .ok_or_else(|| ClientError::NotFound(format!("module '{}'", id)))
    }

    async fn dependency_tree(&self, id: &ModuleId) -> ClientResult<BTreeMap<ModuleId, Module>> {
        let root = self.get_module(id).await?;
        let mut tree = BTreeMap::new();
        let mut queue = VecDeque::from([root]);

        while let Some(module) = queue.pop_front() {
            for (dep_id, constraint) in &module.dependencies {
                let required = self.modules.get(dep_id).map(|m| m.clone()).ok_or_else(|| {
                    ClientError::Dependency(format!(
                        "module '{}' required by '{}'",
                        dep_id, module.id
                    ))
                })?;
                check_version(&module, &required, constraint)?;
                if dep_id != id && !tree.contains_key(dep_id) {
                    tree.insert(dep_id.clone(), required.clone());
                    queue.push_back(required);
                }
            }
        }

        Ok(tree)
    }

    async fn prepare_include_dir(
        &self,
        module: &Module,
        dep_id: &DeploymentId,
    ) -> ClientResult<String> {
        let dir = match &self.include_root {
            Some(root) => {
                let dir = root.join(dep_id.to_string());
                match self.sources.get(&module.id).map(|s| s.clone()) {
                    Some(source) => copy_dir(&source, &dir).await?,
                    None => tokio::fs::create_dir_all(&dir).await?,
                }
                dir.to_string_lossy().into_owned()
            }
            None => format!("/modman/include/{}", dep_id),
        };

        self.prepared.insert(dir.clone(), module.id.clone());
        debug!(deployment_id = %dep_id, dir = %dir, "Prepared include directory");
        Ok(dir)
    }

    async fn remove_include_dir(&self, dir: &str) -> ClientResult<()> {
        if self.include_root.is_some() {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(dir = %dir, "Include directory already removed");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.prepared.remove(dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modman_types::ErrorKind;
    use serde_json::json;

    fn module(id: &str, version: &str, deps: &[(&str, &str)]) -> Module {
        serde_json::from_value(json!({
            "id": id,
            "name": id,
            "version": version,
            "dependencies": deps.iter().map(|(d, c)| (d.to_string(), c.to_string())).collect::<BTreeMap<_, _>>(),
            "services": { "main": { "image": format!("{}:latest", id) } }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_dependency_tree_is_transitive() {
        let registry = ModuleRegistry::default();
        registry.insert(module("a", "1.0.0", &[("b", "^1")]));
        registry.insert(module("b", "1.2.0", &[("c", "")]));
        registry.insert(module("c", "0.3.0", &[]));

        let tree = registry.dependency_tree(&"a".into()).await.unwrap();
        let ids: Vec<_> = tree.keys().map(|k| k.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_dependency_tree_missing_and_incompatible() {
        let registry = ModuleRegistry::default();
        registry.insert(module("a", "1.0.0", &[("b", "^2")]));
        assert!(matches!(
            registry.dependency_tree(&"a".into()).await,
            Err(ClientError::Dependency(_))
        ));

        registry.insert(module("b", "1.0.0", &[]));
        let err = registry.dependency_tree(&"a".into()).await.unwrap_err();
        assert!(matches!(err, ClientError::Dependency(_)));
        assert_eq!(modman_types::Error::from(err).kind(), ErrorKind::Internal);

        // The root itself missing is still a plain lookup failure
        assert!(matches!(
            registry.dependency_tree(&"z".into()).await,
            Err(ClientError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_load_dir_and_include_copy() {
        let modules = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();

        let broker = modules.path().join("broker");
        tokio::fs::create_dir_all(broker.join("include/conf/tls")).await.unwrap();
        tokio::fs::write(
            broker.join(DESCRIPTOR_FILE),
            serde_json::to_vec(&module("broker", "1.0.0", &[])).unwrap(),
        )
        .await
        .unwrap();
        tokio::fs::write(broker.join("include/conf/broker.conf"), b"listener 1883")
            .await
            .unwrap();
        tokio::fs::write(broker.join("include/conf/tls/ca.pem"), b"ca")
            .await
            .unwrap();
        tokio::fs::write(modules.path().join("README.md"), b"ignored")
            .await
            .unwrap();

        let registry = ModuleRegistry::new(Some(work.path().to_path_buf()));
        assert_eq!(registry.load_dir(modules.path()).await.unwrap(), 1);

        let module = registry.get_module(&"broker".into()).await.unwrap();
        let dep_id = DeploymentId::generate();
        let dir = registry.prepare_include_dir(&module, &dep_id).await.unwrap();
        let copied = tokio::fs::read_to_string(Path::new(&dir).join("conf/broker.conf"))
            .await
            .unwrap();
        assert_eq!(copied, "listener 1883");
        assert!(Path::new(&dir).join("conf/tls/ca.pem").is_file());

        registry.remove_include_dir(&dir).await.unwrap();
        assert!(!Path::new(&dir).exists());
        assert!(registry.prepared_dirs().is_empty());
    }
}
