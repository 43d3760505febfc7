//! Create and Update as two variants of one protocol: resolve, build, check,
//! deploy the tree, register with the engine.

use std::sync::Arc;
use std::time::Instant;

use arbor_core::{
    ClusterIdentity, ClusterProviderType, ClusterSpec, ConfigStore, DeliveryEngine, InvariantField, LifecycleError,
    LifecycleResult, ManifestDeployer, Profile, RecordKind, RepoCoordinates, RootDescriptor,
};
use arbor_persist::{maybe_compress, now_ms, Journal, JournalEntry, Stage};
use metrics::{counter, histogram};
use tracing::{info, warn};
use uuid::Uuid;

use crate::builder::{build, validate_cluster_name, DescriptorInputs};
use crate::identity::{decompose_path, IdentityResolver};
use crate::{CreateRequest, LifecycleOutcome, LifecycleSettings, UpdateRequest};

const KIND_CREATE: &str = "create";
const KIND_UPDATE: &str = "update";

pub struct Lifecycle {
    store: Arc<dyn ConfigStore>,
    deployer: Arc<dyn ManifestDeployer>,
    engine: Arc<dyn DeliveryEngine>,
    journal: Option<Arc<dyn Journal>>,
    settings: LifecycleSettings,
}

/// Journal bookkeeping for one operation. Failures to write are logged, never returned.
struct OpTrack<'a> {
    journal: Option<&'a dyn Journal>,
    id: Uuid,
    cluster: &'a str,
    kind: &'static str,
}

impl OpTrack<'_> {
    fn record(&self, stage: Stage, descriptor: &RootDescriptor, detail: Option<String>) {
        let Some(journal) = self.journal else { return };
        let yaml = match descriptor.to_yaml() {
            Ok(y) => y,
            Err(e) => {
                warn!(op = %self.id, error = %e, "journal: descriptor not serializable");
                String::new()
            }
        };
        let entry = JournalEntry {
            op_id: *self.id.as_bytes(),
            cluster: self.cluster.to_string(),
            kind: self.kind.to_string(),
            stage,
            ts: now_ms(),
            detail,
            descriptor: maybe_compress(&yaml),
        };
        if let Err(e) = journal.record(entry) {
            warn!(op = %self.id, cluster = %self.cluster, stage = %stage, error = %e, "journal: record failed");
        }
    }
}

fn check_profile_requires_spec(cluster_spec: Option<&str>, profile: Option<&str>) -> LifecycleResult<()> {
    if profile.is_some() && cluster_spec.is_none() {
        return Err(LifecycleError::Configuration(
            "a profile requires a cluster spec; clusters without a cluster spec take no profile".into(),
        ));
    }
    Ok(())
}

fn check_git_reference(existing: &RootDescriptor, next: &RootDescriptor) -> LifecycleResult<()> {
    if next.repo_url != existing.repo_url {
        return Err(LifecycleError::invariant(
            InvariantField::RepoUrl,
            format!("git reference changed: repo url '{}' would become '{}'", existing.repo_url, next.repo_url),
        ));
    }
    if next.path != existing.path {
        return Err(LifecycleError::invariant(
            InvariantField::Path,
            format!("git reference changed: path '{}' would become '{}'", existing.path, next.path),
        ));
    }
    Ok(())
}

fn observe(kind: &'static str, t0: Instant, res: &LifecycleResult<LifecycleOutcome>) {
    histogram!("lifecycle_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => kind);
    match res {
        Ok(_) if kind == KIND_CREATE => {
            counter!("lifecycle_create_total", 1u64);
        }
        Ok(_) => {
            counter!("lifecycle_update_total", 1u64);
        }
        Err(e) => {
            if matches!(e, LifecycleError::InvariantViolation { .. }) {
                counter!("lifecycle_invariant_violation_total", 1u64);
            }
            counter!("lifecycle_error_total", 1u64, "op" => kind, "kind" => e.kind_label());
        }
    }
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        deployer: Arc<dyn ManifestDeployer>,
        engine: Arc<dyn DeliveryEngine>,
        settings: LifecycleSettings,
    ) -> Self {
        Self { store, deployer, engine, journal: None, settings }
    }

    pub fn with_journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn settings(&self) -> &LifecycleSettings { &self.settings }

    fn track<'a>(&'a self, cluster: &'a str, kind: &'static str) -> OpTrack<'a> {
        OpTrack { journal: self.journal.as_deref(), id: Uuid::new_v4(), cluster, kind }
    }

    async fn resolve_spec(&self, cluster_spec: Option<&str>) -> LifecycleResult<Option<(ClusterSpec, ClusterProviderType)>> {
        match cluster_spec {
            Some(name) => IdentityResolver::new(self.store.as_ref()).resolve(name).await.map(Some),
            None => Ok(None),
        }
    }

    async fn fetch_profile(&self, profile: Option<&str>) -> LifecycleResult<Option<Profile>> {
        match profile {
            Some(name) => self.store.profile(name).await.map(Some),
            None => Ok(None),
        }
    }

    /// Deploy the tree, then register when asked. Stages are journaled as they complete.
    async fn deploy_and_register(
        &self,
        op: &OpTrack<'_>,
        repo: &RepoCoordinates,
        descriptor: RootDescriptor,
        profile: Option<&Profile>,
        register: bool,
    ) -> LifecycleResult<LifecycleOutcome> {
        op.record(Stage::Started, &descriptor, None);
        let identity = ClusterIdentity { name: descriptor.name.clone(), provider: descriptor.provider };
        let change = match self.deployer.deploy(repo, &identity, profile).await {
            Ok(c) => c,
            Err(e) => {
                op.record(Stage::Failed, &descriptor, Some(e.to_string()));
                return Err(e);
            }
        };
        op.record(Stage::TreeDeployed, &descriptor, None);
        info!(op = %op.id, cluster = %descriptor.name, written = change.written, removed = change.removed, commit = ?change.commit, "lifecycle: tree deployed");

        if !register {
            return Ok(LifecycleOutcome {
                operation_id: op.id,
                descriptor,
                tree_deployed: true,
                engine_registered: false,
                tree_change: Some(change),
            });
        }
        let registered =
            if op.kind == KIND_CREATE { self.engine.create(&descriptor).await } else { self.engine.update(&descriptor).await };
        match registered {
            Ok(stored) => {
                op.record(Stage::EngineRegistered, &stored, None);
                Ok(LifecycleOutcome {
                    operation_id: op.id,
                    descriptor: stored,
                    tree_deployed: true,
                    engine_registered: true,
                    tree_change: Some(change),
                })
            }
            Err(e) => {
                // The tree already matches the intended state; `resume` retries registration.
                op.record(Stage::TreeDeployed, &descriptor, Some(e.to_string()));
                warn!(op = %op.id, cluster = %descriptor.name, error = %e, "lifecycle: registration failed after tree deploy");
                Err(e)
            }
        }
    }

    /// Create a cluster: build its descriptor, deploy its tree and optionally register it.
    pub async fn create(&self, req: CreateRequest) -> LifecycleResult<LifecycleOutcome> {
        let t0 = Instant::now();
        let res = self.create_inner(&req).await;
        observe(KIND_CREATE, t0, &res);
        res
    }

    async fn create_inner(&self, req: &CreateRequest) -> LifecycleResult<LifecycleOutcome> {
        validate_cluster_name(&req.cluster_name)?;
        check_profile_requires_spec(req.cluster_spec.as_deref(), req.profile.as_deref())?;
        if req.repo.repo_url.trim().is_empty() {
            return Err(LifecycleError::Configuration("repository url is required".into()));
        }
        if self.engine.get(&self.settings.engine_namespace, &req.cluster_name).await?.is_some() {
            return Err(LifecycleError::AlreadyExists(format!(
                "root descriptor '{}' already registered in namespace '{}'",
                req.cluster_name, self.settings.engine_namespace
            )));
        }
        let resolved = self.resolve_spec(req.cluster_spec.as_deref()).await?;
        let profile = self.fetch_profile(req.profile.as_deref()).await?;

        let manifest_path = req.repo.manifest_path(&req.cluster_name);
        let descriptor = build(&DescriptorInputs {
            cluster_name: &req.cluster_name,
            repo_url: &req.repo.repo_url,
            branch: &req.repo.branch,
            manifest_path: &manifest_path,
            provider: resolved.as_ref().map(|(_, tag)| *tag),
            profile: req.profile.as_deref(),
            cluster_spec: resolved.as_ref().map(|(cs, _)| cs),
            namespace: &self.settings.engine_namespace,
            management_endpoint: &self.settings.management_endpoint,
            destination_server: &self.settings.destination_server,
        });
        let repo = RepoCoordinates::new(descriptor.repo_url.clone(), descriptor.branch.clone(), req.repo.base_path.clone());

        let op = self.track(&req.cluster_name, KIND_CREATE);
        info!(op = %op.id, cluster = %req.cluster_name, tag = ?descriptor.provider.map(|t| t.tag()), register = req.register, "lifecycle: create");
        self.deploy_and_register(&op, &repo, descriptor, profile.as_ref(), req.register).await
    }

    /// Re-derive the descriptor of an existing cluster and replace it.
    ///
    /// The provider tag, cluster name, repository URL and manifest path of `existing`
    /// are fixed; any change is an `InvariantViolation` raised before the tree or the
    /// engine is touched.
    pub async fn update(&self, existing: &RootDescriptor, req: UpdateRequest) -> LifecycleResult<LifecycleOutcome> {
        let t0 = Instant::now();
        let res = self.update_inner(existing, &req).await;
        observe(KIND_UPDATE, t0, &res);
        res
    }

    async fn update_inner(&self, existing: &RootDescriptor, req: &UpdateRequest) -> LifecycleResult<LifecycleOutcome> {
        validate_cluster_name(&req.cluster_name)?;
        check_profile_requires_spec(req.cluster_spec.as_deref(), req.profile.as_deref())?;

        // 1-2: the resolved tag must be the one the existing record carries
        let resolved = self.resolve_spec(req.cluster_spec.as_deref()).await?;
        let tag = resolved.as_ref().map(|(_, tag)| *tag);
        match tag {
            Some(t) if !existing.carries_tag(&t) => {
                return Err(LifecycleError::invariant(
                    InvariantField::ProviderTag,
                    format!(
                        "provider/cloud/type changed: '{}' is not enabled on descriptor '{}' (has {})",
                        t,
                        existing.name,
                        existing.provider.map(|p| p.tag()).unwrap_or_else(|| "none".into())
                    ),
                ));
            }
            None if existing.provider.is_some() => {
                return Err(LifecycleError::invariant(
                    InvariantField::ProviderTag,
                    format!("provider/cloud/type changed: descriptor '{}' requires a cluster spec", existing.name),
                ));
            }
            _ => {}
        }

        // 3: the manifest path names this cluster
        let (base_path, extracted) = decompose_path(&existing.path)?;
        if extracted != req.cluster_name {
            return Err(LifecycleError::invariant(
                InvariantField::ClusterName,
                format!("cluster identity mismatch: path '{}' belongs to '{}', not '{}'", existing.path, extracted, req.cluster_name),
            ));
        }

        // 4-5: coordinates come from the existing record only
        let repo = RepoCoordinates::new(existing.repo_url.clone(), existing.branch.clone(), base_path);
        let profile = self.fetch_profile(req.profile.as_deref()).await?;
        let mut descriptor = build(&DescriptorInputs {
            cluster_name: &req.cluster_name,
            repo_url: &repo.repo_url,
            branch: &repo.branch,
            manifest_path: &existing.path,
            provider: tag,
            profile: req.profile.as_deref(),
            cluster_spec: resolved.as_ref().map(|(cs, _)| cs),
            namespace: &existing.namespace,
            management_endpoint: &self.settings.management_endpoint,
            destination_server: &self.settings.destination_server,
        });
        descriptor.resource_version = existing.resource_version.clone();

        // 6
        check_git_reference(existing, &descriptor)?;

        // 7-8
        let op = self.track(&req.cluster_name, KIND_UPDATE);
        info!(op = %op.id, cluster = %req.cluster_name, profile = ?req.profile, register = req.register, "lifecycle: update");
        self.deploy_and_register(&op, &repo, descriptor, profile.as_ref(), req.register).await
    }

    /// Update the cluster whose descriptor the engine currently holds.
    pub async fn update_by_name(&self, req: UpdateRequest) -> LifecycleResult<LifecycleOutcome> {
        let existing = self
            .engine
            .get(&self.settings.engine_namespace, &req.cluster_name)
            .await?
            .ok_or_else(|| LifecycleError::not_found(RecordKind::Descriptor, &req.cluster_name))?;
        self.update(&existing, req).await
    }

    fn journal(&self) -> LifecycleResult<&dyn Journal> {
        self.journal.as_deref().ok_or_else(|| LifecycleError::Configuration("operation journal is disabled".into()))
    }

    /// Finish the latest operation for `cluster` that deployed its tree but never registered.
    ///
    /// Fails with `Conflict` when the engine record changed after that operation read it.
    pub async fn resume(&self, cluster: &str) -> LifecycleResult<LifecycleOutcome> {
        let journal = self.journal()?;
        let entry = journal
            .latest(cluster)
            .map_err(|e| LifecycleError::Internal(format!("{:#}", e)))?
            .ok_or_else(|| LifecycleError::not_found(RecordKind::Descriptor, cluster))?;
        let op_id = Uuid::from_bytes(entry.op_id);
        if entry.stage != Stage::TreeDeployed {
            return Err(LifecycleError::Configuration(format!(
                "latest operation {} for '{}' is {}; nothing to resume",
                op_id, cluster, entry.stage
            )));
        }
        let descriptor = RootDescriptor::from_yaml(&entry.descriptor_yaml())?;
        let kind = if entry.kind == KIND_CREATE { KIND_CREATE } else { KIND_UPDATE };
        let op = OpTrack { journal: Some(journal), id: op_id, cluster, kind };
        let stored = match self.register_journaled(&descriptor).await {
            Ok(s) => s,
            Err(e) => {
                op.record(Stage::TreeDeployed, &descriptor, Some(e.to_string()));
                return Err(e);
            }
        };
        op.record(Stage::EngineRegistered, &stored, None);
        info!(op = %op_id, cluster, kind = %entry.kind, "lifecycle: resumed registration");
        Ok(LifecycleOutcome { operation_id: op_id, descriptor: stored, tree_deployed: true, engine_registered: true, tree_change: None })
    }

    /// Register a journaled descriptor against the record it was built to replace.
    /// The journaled version token is kept, so a record that moved on since is a `Conflict`.
    async fn register_journaled(&self, descriptor: &RootDescriptor) -> LifecycleResult<RootDescriptor> {
        let live = self.engine.get(&descriptor.namespace, &descriptor.name).await?;
        match (&descriptor.resource_version, live) {
            (None, None) => self.engine.create(descriptor).await,
            (None, Some(_)) => Err(LifecycleError::AlreadyExists(format!(
                "root descriptor '{}' was registered after operation started",
                descriptor.name
            ))),
            (Some(rv), None) => Err(LifecycleError::Conflict(format!(
                "root descriptor '{}' (version {}) no longer exists",
                descriptor.name, rv
            ))),
            (Some(rv), Some(live)) => {
                if live.resource_version.as_ref() != Some(rv) {
                    return Err(LifecycleError::Conflict(format!(
                        "root descriptor '{}' changed since version {} (engine has {:?})",
                        descriptor.name, rv, live.resource_version
                    )));
                }
                if live.provider != descriptor.provider {
                    return Err(LifecycleError::invariant(
                        InvariantField::ProviderTag,
                        format!("provider/cloud/type changed on descriptor '{}'", descriptor.name),
                    ));
                }
                check_git_reference(&live, descriptor)?;
                self.engine.update(descriptor).await
            }
        }
    }

    /// Journaled operations for `cluster`, newest first.
    pub fn history(&self, cluster: &str, limit: usize) -> LifecycleResult<Vec<JournalEntry>> {
        self.journal()?.history(cluster, limit).map_err(|e| LifecycleError::Internal(format!("{:#}", e)))
    }
}
