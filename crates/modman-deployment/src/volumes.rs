//! Named volume naming
//!
//! A deployment owns one engine volume per declared module volume. Several
//! naming schemes can be recognized at once so volumes created under an
//! older scheme keep being found; new volumes always use the first one.

use modman_clients::{VolumeInfo, VolumeSpec};
use modman_types::DeploymentId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const LABEL_DEPLOYMENT: &str = "modman.deployment";
pub const LABEL_VOLUME: &str = "modman.volume";

const HASH_PREFIX: &str = "mm-vol-";
const HASH_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeNamingScheme {
    /// `mm-vol-` followed by a digest of the deployment id and volume name
    ContentHash,
    /// `<deployment id>_<volume name>`
    DeploymentPrefixed,
}

impl VolumeNamingScheme {
    pub fn name(&self, dep_id: &DeploymentId, volume: &str) -> String {
        match self {
            VolumeNamingScheme::ContentHash => {
                let digest = blake3::hash(format!("{}/{}", dep_id, volume).as_bytes());
                format!("{}{}", HASH_PREFIX, &digest.to_hex()[..HASH_LEN])
            }
            VolumeNamingScheme::DeploymentPrefixed => format!("{}_{}", dep_id, volume),
        }
    }
}

/// Outcome of comparing declared volumes with what exists on the engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeDiff {
    /// Declared volume -> existing engine volume
    pub reuse: BTreeMap<String, String>,
    /// Declared volumes with no engine volume yet
    pub create: BTreeSet<String>,
    /// Engine volumes owned by the deployment that are no longer declared
    pub orphans: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeNaming {
    schemes: Vec<VolumeNamingScheme>,
}

impl Default for VolumeNaming {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl VolumeNaming {
    /// An empty list falls back to [`VolumeNamingScheme::ContentHash`]
    pub fn new(schemes: Vec<VolumeNamingScheme>) -> Self {
        let mut unique = Vec::new();
        for scheme in schemes {
            if !unique.contains(&scheme) {
                unique.push(scheme);
            }
        }
        if unique.is_empty() {
            unique.push(VolumeNamingScheme::ContentHash);
        }
        Self { schemes: unique }
    }

    pub fn primary(&self) -> VolumeNamingScheme {
        self.schemes[0]
    }

    pub fn schemes(&self) -> &[VolumeNamingScheme] {
        &self.schemes
    }

    /// Spec for a new engine volume
    pub fn spec(&self, dep_id: &DeploymentId, volume: &str) -> VolumeSpec {
        VolumeSpec {
            name: self.primary().name(dep_id, volume),
            labels: BTreeMap::from([
                (LABEL_DEPLOYMENT.to_string(), dep_id.to_string()),
                (LABEL_VOLUME.to_string(), volume.to_string()),
            ]),
        }
    }

    /// The declared volume an engine volume belongs to, if it is owned by
    /// `dep_id` under any recognized scheme
    pub fn owner_of(
        &self,
        dep_id: &DeploymentId,
        known: &BTreeSet<String>,
        volume: &VolumeInfo,
    ) -> Option<String> {
        let dep = dep_id.to_string();
        if volume.labels.get(LABEL_DEPLOYMENT) == Some(&dep) {
            if let Some(declared) = volume.labels.get(LABEL_VOLUME) {
                return Some(declared.clone());
            }
        }

        for scheme in &self.schemes {
            match scheme {
                VolumeNamingScheme::DeploymentPrefixed => {
                    if let Some(declared) = volume.name.strip_prefix(&format!("{}_", dep)) {
                        return Some(declared.to_string());
                    }
                }
                VolumeNamingScheme::ContentHash => {
                    if let Some(declared) = known
                        .iter()
                        .find(|v| scheme.name(dep_id, v) == volume.name)
                    {
                        return Some(declared.clone());
                    }
                }
            }
        }
        None
    }

    /// Engine volumes owned by `dep_id`
    pub fn owned<'a>(
        &self,
        dep_id: &DeploymentId,
        known: &BTreeSet<String>,
        remote: &'a [VolumeInfo],
    ) -> Vec<&'a VolumeInfo> {
        remote
            .iter()
            .filter(|v| self.owner_of(dep_id, known, v).is_some())
            .collect()
    }

    pub fn diff(
        &self,
        dep_id: &DeploymentId,
        declared: &BTreeSet<String>,
        remote: &[VolumeInfo],
    ) -> VolumeDiff {
        let mut diff = VolumeDiff::default();
        for volume in remote {
            let Some(owner) = self.owner_of(dep_id, declared, volume) else {
                continue;
            };
            if declared.contains(&owner) && !diff.reuse.contains_key(&owner) {
                diff.reuse.insert(owner, volume.name.clone());
            } else {
                diff.orphans.push(volume.name.clone());
            }
        }
        diff.create = declared
            .iter()
            .filter(|v| !diff.reuse.contains_key(*v))
            .cloned()
            .collect();
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn unlabelled(name: String) -> VolumeInfo {
        VolumeInfo {
            name,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        let dep = DeploymentId::generate();
        let scheme = VolumeNamingScheme::ContentHash;
        let name = scheme.name(&dep, "data");
        assert_eq!(name, scheme.name(&dep, "data"));
        assert_ne!(name, scheme.name(&dep, "cache"));
        assert!(name.starts_with("mm-vol-"));
        assert_eq!(name.len(), HASH_PREFIX.len() + HASH_LEN);
    }

    #[test]
    fn test_empty_scheme_list_defaults() {
        let naming = VolumeNaming::new(vec![]);
        assert_eq!(naming.primary(), VolumeNamingScheme::ContentHash);
    }

    #[test]
    fn test_diff_across_schemes() {
        let dep = DeploymentId::generate();
        let other = DeploymentId::generate();
        let naming = VolumeNaming::new(vec![
            VolumeNamingScheme::ContentHash,
            VolumeNamingScheme::DeploymentPrefixed,
        ]);

        let remote = vec![
            // legacy scheme, still declared
            unlabelled(format!("{}_data", dep)),
            // current scheme, no longer declared
            naming.spec(&dep, "logs").into_info(),
            // someone else's
            naming.spec(&other, "data").into_info(),
        ];

        let diff = naming.diff(&dep, &declared(&["data", "cache"]), &remote);
        assert_eq!(diff.reuse["data"], format!("{}_data", dep));
        assert_eq!(diff.create, declared(&["cache"]));
        assert_eq!(diff.orphans, vec![naming.spec(&dep, "logs").name]);
    }

    #[test]
    fn test_unlabelled_hash_volume_found_by_name() {
        let dep = DeploymentId::generate();
        let naming = VolumeNaming::default();
        let remote = vec![unlabelled(VolumeNamingScheme::ContentHash.name(&dep, "data"))];

        let owned = naming.owned(&dep, &declared(&["data"]), &remote);
        assert_eq!(owned.len(), 1);
        assert!(naming.owned(&dep, &declared(&[]), &remote).is_empty());
    }

    trait IntoInfo {
        fn into_info(self) -> VolumeInfo;
    }

    impl IntoInfo for VolumeSpec {
        fn into_info(self) -> VolumeInfo {
            VolumeInfo {
                name: self.name,
                labels: self.labels,
            }
        }
    }
}
