//! Module descriptors
//!
//! A module is an immutable, versioned bundle of container services plus the
//! requirements those services declare. Deployments are created from modules.

use crate::error::{Error, Result};
use crate::ids::ModuleId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Module descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub id: ModuleId,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Services keyed by service reference
    pub services: BTreeMap<String, Service>,
    /// Declared named volumes
    #[serde(default)]
    pub volumes: BTreeSet<String>,
    /// Required modules and their version constraints
    #[serde(default)]
    pub dependencies: BTreeMap<ModuleId, String>,
    #[serde(default)]
    pub host_resources: BTreeMap<String, HostResourceRequirement>,
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretRequirement>,
    #[serde(default)]
    pub configs: BTreeMap<String, ConfigField>,
}

impl Module {
    /// Service-to-service requirements: explicit `requires` plus every
    /// service referenced through `srv_references`.
    pub fn service_requirements(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.services
            .iter()
            .map(|(name, srv)| {
                let mut reqs = srv.requires.clone();
                reqs.extend(srv.srv_references.values().map(|t| t.service.clone()));
                (name.clone(), reqs)
            })
            .collect()
    }

    /// Check that every reference inside the services resolves to a declaration
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.services.is_empty() {
            problems.push("module declares no services".to_string());
        }

        for (name, srv) in &self.services {
            for target in srv.requires.iter().chain(srv.srv_references.values().map(|t| &t.service)) {
                if !self.services.contains_key(target) {
                    problems.push(format!("service '{}' references unknown service '{}'", name, target));
                }
            }
            for vol in srv.volumes.values() {
                if !self.volumes.contains(vol) {
                    problems.push(format!("service '{}' mounts undeclared volume '{}'", name, vol));
                }
            }
            for cfg in srv.configs.values() {
                if !self.configs.contains_key(cfg) {
                    problems.push(format!("service '{}' uses undeclared config '{}'", name, cfg));
                }
            }
            for target in srv.secret_mounts.values().chain(srv.secret_vars.values()) {
                if !self.secrets.contains_key(&target.reference) {
                    problems.push(format!(
                        "service '{}' uses undeclared secret '{}'",
                        name, target.reference
                    ));
                }
            }
            for target in srv.host_resources.values() {
                if !self.host_resources.contains_key(&target.reference) {
                    problems.push(format!(
                        "service '{}' uses undeclared host resource '{}'",
                        name, target.reference
                    ));
                }
            }
            for target in srv.ext_dependencies.values() {
                if !self.dependencies.contains_key(&target.module) {
                    problems.push(format!(
                        "service '{}' references module '{}' which is not a dependency",
                        name, target.module
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::invalid_input(format!(
                "module '{}': {}",
                self.id,
                problems.join("; ")
            )))
        }
    }
}

/// A container service within a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub image: String,
    #[serde(default)]
    pub run_config: RunConfig,
    /// Static environment variables
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    /// Env var -> config reference
    #[serde(default)]
    pub configs: BTreeMap<String, String>,
    /// Env var -> secret value
    #[serde(default)]
    pub secret_vars: BTreeMap<String, SecretTarget>,
    /// Mount point -> secret file
    #[serde(default)]
    pub secret_mounts: BTreeMap<String, SecretTarget>,
    /// Mount point -> host resource
    #[serde(default)]
    pub host_resources: BTreeMap<String, HostResourceTarget>,
    /// Mount point -> declared volume name
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    /// Mount point -> path inside the module's include directory
    #[serde(default)]
    pub bind_mounts: BTreeMap<String, BindMount>,
    #[serde(default)]
    pub tmpfs_mounts: BTreeMap<String, TmpfsMount>,
    /// Env var -> another service of the same module
    #[serde(default)]
    pub srv_references: BTreeMap<String, SrvRefTarget>,
    /// Env var -> a service of a required module
    #[serde(default)]
    pub ext_dependencies: BTreeMap<String, ExtDependencyTarget>,
    #[serde(default)]
    pub ports: Vec<Port>,
    /// Services that must be started before this one
    #[serde(default)]
    pub requires: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub run_once: bool,
    /// Seconds to wait for a graceful stop
    #[serde(default)]
    pub stop_timeout: Option<u64>,
    #[serde(default)]
    pub stop_signal: Option<String>,
    #[serde(default)]
    pub pseudo_tty: bool,
}

fn default_max_retries() -> u32 {
    5
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            run_once: false,
            stop_timeout: None,
            stop_signal: None,
            pseudo_tty: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretTarget {
    /// Module-level secret reference
    #[serde(rename = "ref")]
    pub reference: String,
    /// Item of the secret; the whole secret when absent
    #[serde(default)]
    pub item: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResourceTarget {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmpfsMount {
    /// Size in bytes
    pub size: u64,
    #[serde(default)]
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrvRefTarget {
    pub service: String,
    /// Value template; `{ref}` is replaced by the container alias
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtDependencyTarget {
    pub module: ModuleId,
    pub service: String,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    #[serde(default)]
    pub name: Option<String>,
    pub number: u16,
    #[serde(default)]
    pub protocol: Protocol,
    /// Host ports the container port is published on
    #[serde(default)]
    pub bindings: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostResourceRequirement {
    #[serde(default)]
    pub required: bool,
    /// Tags used to discover a matching resource when none is given
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecretRequirement {
    #[serde(default)]
    pub secret_type: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Declared data type of a configuration value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Bool,
    Int64,
    Float64,
}

/// User-configurable value declared by a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    pub data_type: DataType,
    #[serde(default)]
    pub is_slice: bool,
    /// Separator used when a slice is rendered into an env var
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub options: Vec<serde_json::Value>,
    /// Whether values outside `options` are accepted
    #[serde(default)]
    pub options_ext: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub validator: Option<Validator>,
}

impl ConfigField {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            is_slice: false,
            delimiter: None,
            default: None,
            options: Vec::new(),
            options_ext: false,
            required: false,
            validator: None,
        }
    }

    pub fn delimiter(&self) -> &str {
        self.delimiter.as_deref().unwrap_or(",")
    }
}

/// Type-specific value validator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Validator {
    Regex {
        pattern: String,
    },
    NumberRange {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    TextLength {
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
}
