//! Arbor lifecycle: cluster descriptor Create/Update orchestration.
//!
//! Frontends depend on [`Lifecycle`] and the request/outcome types here. The
//! collaborators (configuration store, manifest deployer, delivery engine, journal)
//! are injected as trait objects so the same protocol runs against Kubernetes and git
//! in production and against the in-memory [`mock`] types in tests.

#![forbid(unsafe_code)]

use arbor_core::{RepoCoordinates, RootDescriptor, TreeChange};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod builder;
pub mod identity;
pub mod manager;
pub mod mock;

pub use arbor_persist::{JournalEntry, Stage};
pub use builder::{build, validate_cluster_name, DescriptorInputs};
pub use identity::{decompose_path, IdentityResolver};
pub use manager::Lifecycle;

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_BASE_PATH: &str = "clusters";

/// Runtime settings shared by every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleSettings {
    /// Namespace holding root descriptors.
    pub engine_namespace: String,
    /// Management cluster URL handed to cluster charts.
    pub management_endpoint: String,
    /// Cluster the engine deploys root charts into.
    pub destination_server: String,
}

impl LifecycleSettings {
    pub fn from_env(management_endpoint: impl Into<String>) -> Self {
        Self {
            engine_namespace: std::env::var("ARBOR_ARGOCD_NS").ok().filter(|s| !s.is_empty()).unwrap_or_else(|| "argocd".to_string()),
            management_endpoint: management_endpoint.into(),
            destination_server: std::env::var("ARBOR_DESTINATION_SERVER")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "https://kubernetes.default.svc".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub cluster_name: String,
    pub repo: RepoCoordinates,
    pub cluster_spec: Option<String>,
    pub profile: Option<String>,
    /// `false` returns the descriptor for inspection instead of registering it.
    pub register: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub cluster_name: String,
    pub cluster_spec: Option<String>,
    pub profile: Option<String>,
    pub register: bool,
}

/// Result of a lifecycle operation, including how far it got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleOutcome {
    pub operation_id: Uuid,
    pub descriptor: RootDescriptor,
    pub tree_deployed: bool,
    pub engine_registered: bool,
    pub tree_change: Option<TreeChange>,
}
