#![forbid(unsafe_code)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use arbor_core::{Bundle, ClusterFlavor, DeliveryEngine, LifecycleError, Profile, RepoCoordinates};
use arbor_lifecycle::mock::{MockDeployer, MockEngine, StaticConfigStore};
use arbor_lifecycle::{CreateRequest, Lifecycle, LifecycleSettings, Stage, UpdateRequest};
use arbor_persist::SqliteJournal;
use arbor_tree::DirDeployer;
use uuid::Uuid;

fn settings() -> LifecycleSettings {
    LifecycleSettings {
        engine_namespace: "argocd".into(),
        management_endpoint: "https://mgmt:6443".into(),
        destination_server: "https://kubernetes.default.svc".into(),
    }
}

fn store() -> StaticConfigStore {
    StaticConfigStore::default().with_cluster_spec("eks-small", Some("capi"), "aws", "eks").with_profile(Profile {
        name: "baseline".into(),
        description: "defaults".into(),
        bundles: vec![Bundle { name: "cni".into(), manifest: "kind: ConfigMap\nmetadata:\n  name: cni\n".into() }],
        overrides: vec![],
    })
}

fn create_request(name: &str) -> CreateRequest {
    CreateRequest {
        cluster_name: name.into(),
        repo: RepoCoordinates::new("git://x/y/", "main", "clusters"),
        cluster_spec: Some("eks-small".into()),
        profile: Some("baseline".into()),
        register: true,
    }
}

fn journal(dir: &tempfile::TempDir) -> Arc<SqliteJournal> {
    Arc::new(SqliteJournal::open(&dir.path().join("arbor.db").to_string_lossy()).unwrap())
}

#[tokio::test]
async fn create_registers_a_normalized_descriptor() {
    let engine = Arc::new(MockEngine::default());
    let lc = Lifecycle::new(Arc::new(store()), Arc::new(MockDeployer::default()), engine.clone(), settings());

    let out = lc.create(create_request("prod")).await.unwrap();
    assert!(out.engine_registered);
    assert_eq!(engine.create_calls(), 1);
    let d = out.descriptor;
    assert_eq!(d.repo_url, "git://x/y");
    assert_eq!(d.path, "clusters/prod");
    assert_eq!(d.provider.map(|p| p.tag()), Some("capi-aws-eks".to_string()));
    assert!(d.resource_version.is_some());

    let e = lc.create(create_request("prod")).await.unwrap_err();
    assert!(matches!(e, LifecycleError::AlreadyExists(_)), "e={}", e);
    assert_eq!(engine.create_calls(), 1);
}

#[tokio::test]
async fn create_preview_returns_yaml_ready_descriptor() {
    let engine = Arc::new(MockEngine::default());
    let deployer = Arc::new(MockDeployer::default());
    let lc = Lifecycle::new(Arc::new(store()), deployer.clone(), engine.clone(), settings());
    let mut req = create_request("prod");
    req.register = false;

    let out = lc.create(req).await.unwrap();
    assert!(!out.engine_registered);
    assert_eq!(engine.create_calls(), 0);
    assert_eq!(deployer.calls().await.len(), 1);
    let yaml = out.descriptor.to_yaml().unwrap();
    assert!(yaml.contains("tags.capi-aws-eks"), "yaml={}", yaml);
    assert!(yaml.contains("git://x/y") && !yaml.contains("git://x/y/"), "yaml={}", yaml);
}

#[tokio::test]
async fn create_rejects_bad_input_before_side_effects() {
    let engine = Arc::new(MockEngine::default());
    let deployer = Arc::new(MockDeployer::default());
    let lc = Lifecycle::new(Arc::new(store()), deployer.clone(), engine.clone(), settings());

    let e = lc.create(create_request("Prod_1")).await.unwrap_err();
    assert!(matches!(e, LifecycleError::Configuration(_)), "e={}", e);

    let mut req = create_request("prod");
    req.cluster_spec = None;
    let e = lc.create(req).await.unwrap_err();
    assert!(matches!(e, LifecycleError::Configuration(_)), "e={}", e);

    let mut req = create_request("prod");
    req.profile = Some("missing".into());
    let e = lc.create(req).await.unwrap_err();
    assert!(matches!(e, LifecycleError::NotFound { .. }), "e={}", e);

    assert!(deployer.calls().await.is_empty());
    assert_eq!(engine.create_calls(), 0);
}

#[tokio::test]
async fn create_without_cluster_spec_has_no_tag() {
    let lc = Lifecycle::new(Arc::new(store()), Arc::new(MockDeployer::default()), Arc::new(MockEngine::default()), settings());
    let req = CreateRequest { cluster_spec: None, profile: None, ..create_request("edge-1") };

    let out = lc.create(req).await.unwrap();
    assert!(out.descriptor.provider.is_none());
    assert!(out.descriptor.helm_parameters().iter().all(|p| !p.name.starts_with("tags.")));
}

#[tokio::test]
async fn failed_registration_can_be_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::default());
    let deployer = Arc::new(MockDeployer::default());
    let lc = Lifecycle::new(Arc::new(store()), deployer.clone(), engine.clone(), settings()).with_journal(journal(&dir));

    engine.fail_writes.store(true, Ordering::SeqCst);
    let e = lc.create(create_request("prod")).await.unwrap_err();
    assert!(e.is_retryable(), "e={}", e);

    let history = lc.history("prod", 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].stage, Stage::TreeDeployed);
    assert!(history[0].detail.is_some());

    engine.fail_writes.store(false, Ordering::SeqCst);
    let out = lc.resume("prod").await.unwrap();
    assert!(out.engine_registered);
    assert_eq!(out.descriptor.path, "clusters/prod");
    assert_eq!(deployer.calls().await.len(), 1, "resume must not redeploy the tree");

    let latest = &lc.history("prod", 10).unwrap()[0];
    assert_eq!(latest.stage, Stage::EngineRegistered);
    assert_eq!(uuid_of(latest), out.operation_id);

    let e = lc.resume("prod").await.unwrap_err();
    assert!(matches!(e, LifecycleError::Configuration(_)), "e={}", e);
}

#[tokio::test]
async fn resume_does_not_overwrite_a_later_registration() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::default());
    let profiles = || {
        store()
            .with_profile(Profile { name: "hardened".into(), ..Default::default() })
            .with_profile(Profile { name: "minimal".into(), ..Default::default() })
    };
    let first = Lifecycle::new(Arc::new(profiles()), Arc::new(MockDeployer::default()), engine.clone(), settings())
        .with_journal(journal(&dir));
    let second = Lifecycle::new(Arc::new(profiles()), Arc::new(MockDeployer::default()), engine.clone(), settings());
    let update = |profile: &str| UpdateRequest {
        cluster_name: "prod".into(),
        cluster_spec: Some("eks-small".into()),
        profile: Some(profile.into()),
        register: true,
    };

    first.create(create_request("prod")).await.unwrap();
    engine.fail_writes.store(true, Ordering::SeqCst);
    assert!(first.update_by_name(update("hardened")).await.is_err());
    engine.fail_writes.store(false, Ordering::SeqCst);

    second.update_by_name(update("minimal")).await.unwrap();

    let e = first.resume("prod").await.unwrap_err();
    assert!(matches!(e, LifecycleError::Conflict(_)), "e={}", e);
    let live = engine.get("argocd", "prod").await.unwrap().unwrap();
    assert_eq!(live.profile.as_deref(), Some("minimal"));
    assert_eq!(engine.update_calls(), 2);

    let latest = &first.history("prod", 1).unwrap()[0];
    assert_eq!(latest.stage, Stage::TreeDeployed);
    assert!(latest.detail.as_deref().unwrap_or_default().contains("changed"), "detail={:?}", latest.detail);
}

#[tokio::test]
async fn resume_rejects_a_create_whose_record_appeared_meanwhile() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::default());
    let lc = Lifecycle::new(Arc::new(store()), Arc::new(MockDeployer::default()), engine.clone(), settings()).with_journal(journal(&dir));

    engine.fail_writes.store(true, Ordering::SeqCst);
    assert!(lc.create(create_request("prod")).await.is_err());
    engine.fail_writes.store(false, Ordering::SeqCst);

    let other = Lifecycle::new(Arc::new(store()), Arc::new(MockDeployer::default()), engine.clone(), settings());
    other.create(create_request("prod")).await.unwrap();

    let e = lc.resume("prod").await.unwrap_err();
    assert!(matches!(e, LifecycleError::AlreadyExists(_)), "e={}", e);
    assert_eq!(engine.create_calls(), 2);
}

fn uuid_of(entry: &arbor_lifecycle::JournalEntry) -> Uuid { Uuid::from_bytes(entry.op_id) }

#[tokio::test]
async fn failed_tree_deploy_is_journaled() {
    let dir = tempfile::tempdir().unwrap();
    let deployer = Arc::new(MockDeployer::default());
    deployer.fail.store(true, Ordering::SeqCst);
    let lc = Lifecycle::new(Arc::new(store()), deployer, Arc::new(MockEngine::default()), settings()).with_journal(journal(&dir));

    assert!(lc.create(create_request("prod")).await.is_err());
    assert_eq!(lc.history("prod", 1).unwrap()[0].stage, Stage::Failed);
    assert!(lc.resume("prod").await.is_err());
}

#[tokio::test]
async fn create_then_update_against_a_directory_tree() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::default());
    let deployer = Arc::new(DirDeployer::new(dir.path().join("repo")));
    let lc = Lifecycle::new(Arc::new(store()), deployer, engine.clone(), settings()).with_journal(journal(&dir));

    let created = lc.create(create_request("prod")).await.unwrap();
    assert!(dir.path().join("repo/clusters/prod/profile/cni.yaml").exists());
    assert_eq!(created.tree_change.as_ref().map(|c| c.written), Some(3));

    let req = UpdateRequest { cluster_name: "prod".into(), cluster_spec: Some("eks-small".into()), profile: Some("baseline".into()), register: true };
    let updated = lc.update(&created.descriptor, req).await.unwrap();
    assert!(updated.tree_change.as_ref().map(|c| c.is_noop()).unwrap_or(false));
    assert_eq!(updated.descriptor.provider.map(|p| p.flavor), Some(ClusterFlavor::AwsEks));
    assert_eq!(engine.update_calls(), 1);
    assert_eq!(lc.history("prod", 10).unwrap().len(), 2);
}
