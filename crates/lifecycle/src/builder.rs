//! Root descriptor construction. Pure: no store, git or engine access.

use std::collections::BTreeMap;

use arbor_core::{ClusterProviderType, ClusterSpec, LifecycleError, LifecycleResult, RootDescriptor};
use once_cell::sync::Lazy;
use regex::Regex;

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Cluster names become directory names, namespaces and engine record names.
pub fn validate_cluster_name(name: &str) -> LifecycleResult<()> {
    if name.len() > 63 || !DNS_LABEL.is_match(name) {
        return Err(LifecycleError::Configuration(format!(
            "cluster name '{}' must be a DNS-1123 label (lowercase alphanumerics and '-', at most 63 chars)",
            name
        )));
    }
    Ok(())
}

pub struct DescriptorInputs<'a> {
    pub cluster_name: &'a str,
    pub repo_url: &'a str,
    pub branch: &'a str,
    pub manifest_path: &'a str,
    pub provider: Option<ClusterProviderType>,
    pub profile: Option<&'a str>,
    pub cluster_spec: Option<&'a ClusterSpec>,
    /// Engine namespace the record lives in.
    pub namespace: &'a str,
    pub management_endpoint: &'a str,
    pub destination_server: &'a str,
}

pub fn normalize_repo_url(url: &str) -> String { url.trim().trim_end_matches('/').to_string() }

pub fn normalize_path(path: &str) -> String { path.trim().trim_matches('/').to_string() }

/// Build a complete, fresh descriptor. Identical inputs give equal descriptors.
pub fn build(inputs: &DescriptorInputs<'_>) -> RootDescriptor {
    let values: BTreeMap<String, String> = inputs.cluster_spec.map(|cs| cs.values.clone()).unwrap_or_default();
    RootDescriptor {
        name: inputs.cluster_name.to_string(),
        namespace: inputs.namespace.to_string(),
        repo_url: normalize_repo_url(inputs.repo_url),
        branch: inputs.branch.trim().to_string(),
        path: normalize_path(inputs.manifest_path),
        destination_server: inputs.destination_server.to_string(),
        destination_namespace: inputs.cluster_name.to_string(),
        provider: inputs.provider,
        profile: inputs.profile.map(str::to_string),
        cluster_spec: inputs.cluster_spec.map(|cs| cs.name.clone()),
        management_endpoint: inputs.management_endpoint.trim_end_matches('/').to_string(),
        values,
        extra_parameters: Default::default(),
        resource_version: None,
    }
}
