use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, LifecycleResult};
use crate::provider::ClusterProviderType;

pub const KEY_API_PROVIDER: &str = "apiProvider";
pub const KEY_CLOUD_PROVIDER: &str = "cloudProvider";
pub const KEY_CLUSTER_TYPE: &str = "type";

/// Git location of a cluster's manifest tree. Immutable for the life of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCoordinates {
    pub repo_url: String,
    pub branch: String,
    pub base_path: String,
}

impl RepoCoordinates {
    pub fn new(repo_url: impl Into<String>, branch: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self { repo_url: repo_url.into(), branch: branch.into(), base_path: base_path.into() }
    }

    /// `base_path/cluster_name`, without leading or trailing slashes.
    pub fn manifest_path(&self, cluster_name: &str) -> String {
        let base = self.base_path.trim_matches('/');
        if base.is_empty() { cluster_name.to_string() } else { format!("{}/{}", base, cluster_name) }
    }
}

/// Structural identity of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterIdentity {
    pub name: String,
    /// Absent for cluster generations without a cluster spec.
    pub provider: Option<ClusterProviderType>,
}

/// Cluster-spec configuration record (stored as a ConfigMap).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    pub api_provider: Option<String>,
    pub cloud_provider: String,
    pub cluster_type: String,
    /// Remaining keys (kubernetesVersion, region, nodeType, ...).
    pub values: BTreeMap<String, String>,
}

impl ClusterSpec {
    /// Build from raw ConfigMap-style data.
    pub fn from_data(name: &str, data: &BTreeMap<String, String>) -> LifecycleResult<Self> {
        let required = |key: &str| {
            data.get(key)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| LifecycleError::AmbiguousTag(format!("cluster spec '{}' missing '{}'", name, key)))
        };
        let cloud_provider = required(KEY_CLOUD_PROVIDER)?;
        let cluster_type = required(KEY_CLUSTER_TYPE)?;
        let api_provider = data.get(KEY_API_PROVIDER).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let values = data
            .iter()
            .filter(|(k, _)| ![KEY_API_PROVIDER, KEY_CLOUD_PROVIDER, KEY_CLUSTER_TYPE].contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self { name: name.to_string(), api_provider, cloud_provider, cluster_type, values })
    }

    /// The provider tag this record encodes.
    pub fn provider_type(&self) -> LifecycleResult<ClusterProviderType> {
        ClusterProviderType::from_components(self.api_provider.as_deref(), &self.cloud_provider, &self.cluster_type)
    }
}

/// A named bundle of overlay manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    pub manifest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    pub bundle: String,
    pub key: String,
    pub value: String,
}

/// Configuration profile with its bundles already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub description: String,
    pub bundles: Vec<Bundle>,
    pub overrides: Vec<Override>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ClusterFlavor;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn cluster_spec_splits_identity_keys_from_values() {
        let cs = ClusterSpec::from_data(
            "eks-small",
            &data(&[("cloudProvider", "aws"), ("type", "eks"), ("region", "us-west-2"), ("nodeCount", "3")]),
        )
        .unwrap();
        assert_eq!(cs.api_provider, None);
        assert_eq!(cs.values.len(), 2);
        assert_eq!(cs.values["region"], "us-west-2");
        assert_eq!(cs.provider_type().unwrap().flavor, ClusterFlavor::AwsEks);
    }

    #[test]
    fn cluster_spec_without_type_is_unresolvable() {
        let e = ClusterSpec::from_data("x", &data(&[("cloudProvider", "aws")])).unwrap_err();
        assert!(e.to_string().contains("missing 'type'"), "e={}", e);
    }

    #[test]
    fn manifest_path_joins_and_trims() {
        assert_eq!(RepoCoordinates::new("u", "main", "clusters/").manifest_path("prod"), "clusters/prod");
        assert_eq!(RepoCoordinates::new("u", "main", "/a/b").manifest_path("c"), "a/b/c");
        assert_eq!(RepoCoordinates::new("u", "main", "").manifest_path("c"), "c");
    }
}
