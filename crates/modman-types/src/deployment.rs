//! Deployment types

use crate::config::ConfigValue;
use crate::ids::{DeploymentId, InstanceId, ModuleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A named instance of a module with its resolved assets and dependency edges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub module: DepModule,
    pub name: String,
    /// Module-file include directory
    pub dir: String,
    pub enabled: bool,
    /// Created only to satisfy another deployment's module dependency
    pub indirect: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Resolved assets, populated when requested
    #[serde(default)]
    pub assets: DepAssets,
    /// Live instance, populated when containers are requested
    #[serde(default)]
    pub instance: Option<DepInstance>,
    /// Deployments this one requires
    #[serde(default)]
    pub required_dep: BTreeSet<DeploymentId>,
    /// Deployments requiring this one
    #[serde(default)]
    pub dep_requiring: BTreeSet<DeploymentId>,
}

impl Deployment {
    /// Containers of the live instance in start order
    pub fn containers_in_order(&self) -> Vec<&DepContainer> {
        let mut containers: Vec<&DepContainer> = self
            .instance
            .as_ref()
            .map(|i| i.containers.values().collect())
            .unwrap_or_default();
        containers.sort_by_key(|c| c.order);
        containers
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepModule {
    pub id: ModuleId,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DepAssets {
    /// Host resource reference -> host resource id
    #[serde(default)]
    pub host_resources: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, DepSecret>,
    #[serde(default)]
    pub configs: BTreeMap<String, ConfigValue>,
}

/// A bound secret and the items materialized for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepSecret {
    pub id: String,
    /// Items materialized as files
    #[serde(default)]
    pub mounted_items: BTreeSet<Option<String>>,
    /// Items materialized as environment values
    #[serde(default)]
    pub env_items: BTreeSet<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepInstance {
    pub id: InstanceId,
    pub created: DateTime<Utc>,
    /// Containers keyed by service reference
    pub containers: BTreeMap<String, DepContainer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepContainer {
    /// Container id assigned by the container engine
    pub id: String,
    pub srv_ref: String,
    /// Deterministic name other containers address this one by
    pub alias: String,
    /// Position in the start order
    pub order: u32,
}

/// User input for creating or updating a deployment
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DepInput {
    #[serde(default)]
    pub name: Option<String>,
    /// Host resource reference -> host resource id
    #[serde(default)]
    pub host_resources: BTreeMap<String, String>,
    /// Secret reference -> secret id
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    /// Config reference -> raw value
    #[serde(default)]
    pub configs: BTreeMap<String, serde_json::Value>,
}

/// Deployment selection criteria; unset fields match everything
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DepFilter {
    #[serde(default)]
    pub ids: BTreeSet<DeploymentId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub module_id: Option<ModuleId>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub indirect: Option<bool>,
}

impl DepFilter {
    pub fn matches(&self, dep: &Deployment) -> bool {
        (self.ids.is_empty() || self.ids.contains(&dep.id))
            && self.name.as_ref().map_or(true, |n| &dep.name == n)
            && self.module_id.as_ref().map_or(true, |m| &dep.module.id == m)
            && self.enabled.map_or(true, |e| dep.enabled == e)
            && self.indirect.map_or(true, |i| dep.indirect == i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(name: &str, enabled: bool) -> Deployment {
        Deployment {
            id: DeploymentId::generate(),
            module: DepModule {
                id: ModuleId::new("github.com/acme/broker"),
                version: "1.0.0".into(),
            },
            name: name.into(),
            dir: String::new(),
            enabled,
            indirect: false,
            created: Utc::now(),
            updated: Utc::now(),
            assets: DepAssets::default(),
            instance: None,
            required_dep: BTreeSet::new(),
            dep_requiring: BTreeSet::new(),
        }
    }

    #[test]
    fn test_filter_matches() {
        let dep = deployment("broker", true);

        assert!(DepFilter::default().matches(&dep));
        assert!(DepFilter {
            enabled: Some(true),
            name: Some("broker".into()),
            ..Default::default()
        }
        .matches(&dep));
        assert!(!DepFilter {
            indirect: Some(true),
            ..Default::default()
        }
        .matches(&dep));
        assert!(!DepFilter {
            ids: [DeploymentId::generate()].into_iter().collect(),
            ..Default::default()
        }
        .matches(&dep));
    }

    #[test]
    fn test_containers_in_order() {
        let mut dep = deployment("broker", false);
        let mut containers = BTreeMap::new();
        for (srv, order) in [("api", 1), ("db", 0)] {
            containers.insert(
                srv.to_string(),
                DepContainer {
                    id: format!("c-{}", srv),
                    srv_ref: srv.into(),
                    alias: srv.into(),
                    order,
                },
            );
        }
        dep.instance = Some(DepInstance {
            id: InstanceId::generate(),
            created: Utc::now(),
            containers,
        });

        let order: Vec<_> = dep.containers_in_order().iter().map(|c| c.srv_ref.as_str()).collect();
        assert_eq!(order, vec!["db", "api"]);
    }
}
