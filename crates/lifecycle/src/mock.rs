//! In-memory collaborators for tests and dry runs. They record every call.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use arbor_core::{
    Backend, ClusterIdentity, ClusterSpec, ConfigStore, DeliveryEngine, LifecycleError, LifecycleResult,
    ManifestDeployer, Profile, RecordKind, RepoCoordinates, RootDescriptor, TreeChange,
};
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Fixed set of cluster specs and profiles.
#[derive(Debug, Default)]
pub struct StaticConfigStore {
    pub cluster_specs: BTreeMap<String, ClusterSpec>,
    pub profiles: BTreeMap<String, Profile>,
}

impl StaticConfigStore {
    pub fn with_cluster_spec(mut self, name: &str, api: Option<&str>, cloud: &str, cluster_type: &str) -> Self {
        self.cluster_specs.insert(
            name.to_string(),
            ClusterSpec {
                name: name.to_string(),
                api_provider: api.map(str::to_string),
                cloud_provider: cloud.to_string(),
                cluster_type: cluster_type.to_string(),
                values: BTreeMap::new(),
            },
        );
        self
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profiles.insert(profile.name.clone(), profile);
        self
    }
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn cluster_spec(&self, name: &str) -> LifecycleResult<ClusterSpec> {
        self.cluster_specs.get(name).cloned().ok_or_else(|| LifecycleError::not_found(RecordKind::ClusterSpec, name))
    }

    async fn profile(&self, name: &str) -> LifecycleResult<Profile> {
        self.profiles.get(name).cloned().ok_or_else(|| LifecycleError::not_found(RecordKind::Profile, name))
    }
}

/// One recorded deploy call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployCall {
    pub repo: RepoCoordinates,
    pub identity: ClusterIdentity,
    pub profile: Option<String>,
}

#[derive(Debug, Default)]
pub struct MockDeployer {
    calls: Mutex<Vec<DeployCall>>,
    /// When set, every deploy fails with a git transport error.
    pub fail: AtomicBool,
}

impl MockDeployer {
    pub async fn calls(&self) -> Vec<DeployCall> { self.calls.lock().await.clone() }
}

#[async_trait]
impl ManifestDeployer for MockDeployer {
    async fn deploy(
        &self,
        repo: &RepoCoordinates,
        identity: &ClusterIdentity,
        profile: Option<&Profile>,
    ) -> LifecycleResult<TreeChange> {
        let mut calls = self.calls.lock().await;
        calls.push(DeployCall { repo: repo.clone(), identity: identity.clone(), profile: profile.map(|p| p.name.clone()) });
        if self.fail.load(Ordering::SeqCst) {
            return Err(LifecycleError::transport(Backend::Git, "remote unreachable"));
        }
        // First deploy of a cluster writes, later ones are no-ops.
        let first = calls.iter().filter(|c| c.identity.name == identity.name).count() == 1;
        Ok(if first {
            TreeChange { written: 2, removed: 0, unchanged: 0, commit: Some(format!("{:040x}", calls.len())) }
        } else {
            TreeChange { written: 0, removed: 0, unchanged: 2, commit: None }
        })
    }
}

/// Delivery engine keeping records in memory with a monotonically increasing version.
#[derive(Debug, Default)]
pub struct MockEngine {
    records: Mutex<BTreeMap<(String, String), RootDescriptor>>,
    version: AtomicU64,
    creates: AtomicUsize,
    updates: AtomicUsize,
    /// When set, create/update fail with an engine transport error.
    pub fail_writes: AtomicBool,
}

impl MockEngine {
    /// Store a record as if it already existed; returns it with its version token.
    pub async fn seed(&self, mut descriptor: RootDescriptor) -> RootDescriptor {
        descriptor.resource_version = Some(self.next_version());
        self.records.lock().await.insert((descriptor.namespace.clone(), descriptor.name.clone()), descriptor.clone());
        descriptor
    }

    pub fn create_calls(&self) -> usize { self.creates.load(Ordering::SeqCst) }

    pub fn update_calls(&self) -> usize { self.updates.load(Ordering::SeqCst) }

    fn next_version(&self) -> String { (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string() }

    fn check_available(&self) -> LifecycleResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LifecycleError::transport(Backend::Engine, "engine unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryEngine for MockEngine {
    async fn get(&self, namespace: &str, name: &str) -> LifecycleResult<Option<RootDescriptor>> {
        Ok(self.records.lock().await.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn create(&self, descriptor: &RootDescriptor) -> LifecycleResult<RootDescriptor> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let key = (descriptor.namespace.clone(), descriptor.name.clone());
        let mut records = self.records.lock().await;
        if records.contains_key(&key) {
            return Err(LifecycleError::AlreadyExists(descriptor.name.clone()));
        }
        let mut stored = descriptor.clone();
        stored.resource_version = Some(self.next_version());
        records.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, descriptor: &RootDescriptor) -> LifecycleResult<RootDescriptor> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let key = (descriptor.namespace.clone(), descriptor.name.clone());
        let mut records = self.records.lock().await;
        let current = records.get(&key).ok_or_else(|| LifecycleError::not_found(RecordKind::Descriptor, &descriptor.name))?;
        if descriptor.resource_version.is_some() && descriptor.resource_version != current.resource_version {
            return Err(LifecycleError::Conflict(format!(
                "descriptor '{}' changed (have {:?}, engine has {:?})",
                descriptor.name, descriptor.resource_version, current.resource_version
            )));
        }
        let mut stored = descriptor.clone();
        stored.resource_version = Some(self.next_version());
        records.insert(key, stored.clone());
        Ok(stored)
    }
}
