//! Provider/cloud/cluster-type classification.
//!
//! The tag is the identity a cluster keeps for its whole lifetime. Internally it is
//! always carried as [`ClusterProviderType`]; the `tags.<tag>` string form only
//! exists at the engine wire boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;

/// API provider driving cluster provisioning. Optional on older tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ApiProvider {
    Capi,
    Xplane,
}

impl ApiProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiProvider::Capi => "capi",
            ApiProvider::Xplane => "xplane",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "capi" => Some(ApiProvider::Capi),
            "xplane" => Some(ApiProvider::Xplane),
            _ => None,
        }
    }
}

/// Valid cloud/cluster-type pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClusterFlavor {
    AwsKubeadm,
    AwsEks,
    GcpKubeadm,
    GcpGke,
    AzureKubeadm,
    AzureAks,
}

impl ClusterFlavor {
    pub const ALL: [ClusterFlavor; 6] = [
        ClusterFlavor::AwsKubeadm,
        ClusterFlavor::AwsEks,
        ClusterFlavor::GcpKubeadm,
        ClusterFlavor::GcpGke,
        ClusterFlavor::AzureKubeadm,
        ClusterFlavor::AzureAks,
    ];

    pub fn cloud(&self) -> &'static str {
        match self {
            ClusterFlavor::AwsKubeadm | ClusterFlavor::AwsEks => "aws",
            ClusterFlavor::GcpKubeadm | ClusterFlavor::GcpGke => "gcp",
            ClusterFlavor::AzureKubeadm | ClusterFlavor::AzureAks => "azure",
        }
    }

    pub fn cluster_type(&self) -> &'static str {
        match self {
            ClusterFlavor::AwsKubeadm | ClusterFlavor::GcpKubeadm | ClusterFlavor::AzureKubeadm => "kubeadm",
            ClusterFlavor::AwsEks => "eks",
            ClusterFlavor::GcpGke => "gke",
            ClusterFlavor::AzureAks => "aks",
        }
    }

    /// Look up the flavor for a cloud + cluster type pair; `None` when the pair is not offered.
    pub fn from_parts(cloud: &str, cluster_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.cloud() == cloud && f.cluster_type() == cluster_type)
    }
}

/// Typed provider tag of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterProviderType {
    pub api: Option<ApiProvider>,
    pub flavor: ClusterFlavor,
}

impl ClusterProviderType {
    pub fn new(api: Option<ApiProvider>, flavor: ClusterFlavor) -> Self {
        Self { api, flavor }
    }

    /// Resolve from the raw components of a cluster-spec record.
    pub fn from_components(api: Option<&str>, cloud: &str, cluster_type: &str) -> Result<Self, LifecycleError> {
        let api = match api.map(str::trim).filter(|s| !s.is_empty()) {
            Some(a) => Some(ApiProvider::parse(a).ok_or_else(|| {
                LifecycleError::AmbiguousTag(format!("unknown api provider '{}'", a))
            })?),
            None => None,
        };
        let flavor = ClusterFlavor::from_parts(cloud.trim(), cluster_type.trim()).ok_or_else(|| {
            LifecycleError::AmbiguousTag(format!(
                "no cluster flavor for cloud '{}' and type '{}'",
                cloud, cluster_type
            ))
        })?;
        Ok(Self { api, flavor })
    }

    /// Tag name as used in `tags.<tag>` engine parameters.
    pub fn tag(&self) -> String {
        match self.api {
            Some(api) => format!("{}-{}-{}", api.as_str(), self.flavor.cloud(), self.flavor.cluster_type()),
            None => format!("{}-{}", self.flavor.cloud(), self.flavor.cluster_type()),
        }
    }
}

impl fmt::Display for ClusterProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

impl FromStr for ClusterProviderType {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        match parts.as_slice() {
            [cloud, ty] => Self::from_components(None, cloud, ty),
            [api, cloud, ty] => Self::from_components(Some(api), cloud, ty),
            _ => Err(LifecycleError::AmbiguousTag(format!("invalid tag '{}'", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trips_with_and_without_api_provider() {
        let t: ClusterProviderType = "aws-eks".parse().unwrap();
        assert_eq!(t, ClusterProviderType::new(None, ClusterFlavor::AwsEks));
        assert_eq!(t.tag(), "aws-eks");

        let t: ClusterProviderType = "capi-gcp-kubeadm".parse().unwrap();
        assert_eq!(t.api, Some(ApiProvider::Capi));
        assert_eq!(t.flavor, ClusterFlavor::GcpKubeadm);
        assert_eq!(t.to_string(), "capi-gcp-kubeadm");
    }

    #[test]
    fn incompatible_pairs_are_rejected() {
        let e = ClusterProviderType::from_components(None, "aws", "gke").unwrap_err();
        assert!(matches!(e, LifecycleError::AmbiguousTag(_)), "e={}", e);
        assert!("k8s".parse::<ClusterProviderType>().is_err());
        assert!("foo-aws-eks".parse::<ClusterProviderType>().is_err());
        assert!("a-b-c-d".parse::<ClusterProviderType>().is_err());
    }

    #[test]
    fn blank_api_provider_is_treated_as_absent() {
        let t = ClusterProviderType::from_components(Some("  "), "azure", "aks").unwrap();
        assert_eq!(t.api, None);
        assert_eq!(t.tag(), "azure-aks");
    }
}
