//! Identity resolution: cluster name from a manifest path, provider tag from a cluster spec.

use arbor_core::{ClusterProviderType, ClusterSpec, ConfigStore, LifecycleError, LifecycleResult};
use tracing::debug;

/// Split a manifest-tree path into `(base_path, cluster_name)`.
///
/// Surrounding slashes are ignored. Fails with `MalformedPath` when fewer than two
/// segments remain.
pub fn decompose_path(path: &str) -> LifecycleResult<(String, String)> {
    let trimmed = path.trim().trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((base, name)) if !name.is_empty() && !base.trim_matches('/').is_empty() => {
            Ok((base.trim_end_matches('/').to_string(), name.to_string()))
        }
        _ => Err(LifecycleError::MalformedPath(format!(
            "'{}' needs at least a base directory and a cluster name",
            path
        ))),
    }
}

/// Resolves cluster identity from the configuration store. Read-only.
pub struct IdentityResolver<'a> {
    store: &'a dyn ConfigStore,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(store: &'a dyn ConfigStore) -> Self { Self { store } }

    /// Fetch a cluster spec together with the provider tag it encodes.
    pub async fn resolve(&self, cluster_spec: &str) -> LifecycleResult<(ClusterSpec, ClusterProviderType)> {
        let spec = self.store.cluster_spec(cluster_spec).await?;
        let tag = spec.provider_type()?;
        debug!(cluster_spec, tag = %tag, "identity: resolved provider tag");
        Ok((spec, tag))
    }

    pub async fn resolve_tag(&self, cluster_spec: &str) -> LifecycleResult<ClusterProviderType> {
        self.resolve(cluster_spec).await.map(|(_, tag)| tag)
    }
}
