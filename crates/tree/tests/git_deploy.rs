#![forbid(unsafe_code)]

use std::path::Path;

use arbor_core::{Bundle, ClusterFlavor, ClusterIdentity, ClusterProviderType, ManifestDeployer, Profile, RepoCoordinates};
use arbor_tree::{GitDeployer, GitSettings};
use git2::{Repository, Signature};

fn seed_remote(dir: &Path) -> String {
    let repo = Repository::init_bare(dir).unwrap();
    let sig = Signature::now("seed", "seed@localhost").unwrap();
    let empty = repo.treebuilder(None).unwrap().write().unwrap();
    let tree = repo.find_tree(empty).unwrap();
    repo.commit(Some("refs/heads/main"), &sig, &sig, "init", &tree, &[]).unwrap();
    repo.set_head("refs/heads/main").unwrap();
    format!("file://{}", dir.display())
}

fn remote_has(dir: &Path, path: &str) -> bool {
    let repo = Repository::open_bare(dir).unwrap();
    let tree = repo.find_reference("refs/heads/main").unwrap().peel_to_tree().unwrap();
    tree.get_path(Path::new(path)).is_ok()
}

fn identity() -> ClusterIdentity {
    ClusterIdentity { name: "prod".into(), provider: Some(ClusterProviderType::new(None, ClusterFlavor::AwsEks)) }
}

fn profile() -> Profile {
    Profile {
        name: "baseline".into(),
        bundles: vec![Bundle { name: "cni".into(), manifest: "kind: ConfigMap\n".into() }],
        ..Default::default()
    }
}

#[tokio::test]
async fn deploy_commits_once_then_is_a_noop() {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote.git");
    let url = seed_remote(&remote);
    let deployer = GitDeployer::new(GitSettings { workdir: tmp.path().join("work"), ..Default::default() });
    let coords = RepoCoordinates::new(url, "main", "clusters");

    let first = deployer.deploy(&coords, &identity(), Some(&profile())).await.unwrap();
    assert!(first.commit.is_some());
    assert_eq!(first.written, 3);
    assert!(remote_has(&remote, "clusters/prod/Chart.yaml"));
    assert!(remote_has(&remote, "clusters/prod/profile/cni.yaml"));

    let second = deployer.deploy(&coords, &identity(), Some(&profile())).await.unwrap();
    assert!(second.is_noop());
    assert!(second.commit.is_none());

    let third = deployer.deploy(&coords, &identity(), None).await.unwrap();
    assert!(third.removed > 0);
    assert!(third.commit.is_some());
    assert!(!remote_has(&remote, "clusters/prod/profile/cni.yaml"));
    assert!(remote_has(&remote, "clusters/prod/values.yaml"));
}

#[tokio::test]
async fn missing_branch_is_a_configuration_error() {
    let tmp = tempfile::tempdir().unwrap();
    let url = seed_remote(&tmp.path().join("remote.git"));
    let deployer = GitDeployer::new(GitSettings { workdir: tmp.path().join("work"), ..Default::default() });
    let coords = RepoCoordinates::new(url, "release", "clusters");

    let e = deployer.deploy(&coords, &identity(), None).await.unwrap_err();
    assert!(matches!(e, arbor_core::LifecycleError::Configuration(_)), "e={}", e);
}
