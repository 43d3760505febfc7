//! Arbor core types, errors and collaborator traits.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod descriptor;
pub mod error;
pub mod model;
pub mod provider;

pub use descriptor::{Application, HelmParameter, RootDescriptor};
pub use error::{Backend, InvariantField, LifecycleError, LifecycleResult, RecordKind};
pub use model::{Bundle, ClusterIdentity, ClusterSpec, Override, Profile, RepoCoordinates};
pub use provider::{ApiProvider, ClusterFlavor, ClusterProviderType};

pub mod prelude {
    pub use super::{
        ClusterIdentity, ClusterProviderType, ClusterSpec, ConfigStore, DeliveryEngine, LifecycleError,
        LifecycleResult, ManifestDeployer, Profile, RepoCoordinates, RootDescriptor, TreeChange,
    };
}

/// File-level effect of one manifest tree deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeChange {
    pub written: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Commit id when the deployment produced a commit.
    pub commit: Option<String>,
}

impl TreeChange {
    pub fn is_noop(&self) -> bool { self.written == 0 && self.removed == 0 }
}

/// Read-only source of cluster-spec and profile records.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fails with `NotFound { kind: ClusterSpec }` when absent.
    async fn cluster_spec(&self, name: &str) -> LifecycleResult<ClusterSpec>;
    /// Fails with `NotFound { kind: Profile }` when absent; bundles come back resolved.
    async fn profile(&self, name: &str) -> LifecycleResult<Profile>;
}

/// Writes a cluster's manifest tree under `base_path/cluster_name`. Must be idempotent.
#[async_trait]
pub trait ManifestDeployer: Send + Sync {
    async fn deploy(
        &self,
        repo: &RepoCoordinates,
        identity: &ClusterIdentity,
        profile: Option<&Profile>,
    ) -> LifecycleResult<TreeChange>;
}

/// Delivery-engine registration surface.
#[async_trait]
pub trait DeliveryEngine: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> LifecycleResult<Option<RootDescriptor>>;
    async fn create(&self, descriptor: &RootDescriptor) -> LifecycleResult<RootDescriptor>;
    /// Replace the record wholesale. A stale `resource_version` yields `Conflict`.
    async fn update(&self, descriptor: &RootDescriptor) -> LifecycleResult<RootDescriptor>;
}
