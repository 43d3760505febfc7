//! Git-backed deployer: clone, sync the cluster directory, commit, push.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::Instant;

use arbor_core::{
    Backend, ClusterIdentity, LifecycleError, LifecycleResult, ManifestDeployer, Profile, RepoCoordinates, TreeChange,
};
use async_trait::async_trait;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{BranchType, Cred, ErrorCode, FetchOptions, IndexAddOption, Oid, PushOptions, RemoteCallbacks, Repository, Signature};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::{render_tree, sync_dir, ManifestTree};

#[derive(Debug, Clone)]
pub struct GitSettings {
    /// Parent directory for scratch clones.
    pub workdir: PathBuf,
    /// SSH key or token file.
    pub credentials: Option<PathBuf>,
    pub author_name: String,
    pub author_email: String,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            workdir: std::env::temp_dir(),
            credentials: None,
            author_name: "arbor".to_string(),
            author_email: "arbor@localhost".to_string(),
        }
    }
}

impl GitSettings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workdir: std::env::var("ARBOR_WORKDIR").ok().filter(|s| !s.is_empty()).map(PathBuf::from).unwrap_or(d.workdir),
            credentials: std::env::var("ARBOR_GIT_CREDENTIALS").ok().filter(|s| !s.is_empty()).map(PathBuf::from),
            author_name: std::env::var("ARBOR_GIT_AUTHOR_NAME").ok().filter(|s| !s.is_empty()).unwrap_or(d.author_name),
            author_email: std::env::var("ARBOR_GIT_AUTHOR_EMAIL").ok().filter(|s| !s.is_empty()).unwrap_or(d.author_email),
        }
    }
}

fn git_err(e: git2::Error) -> LifecycleError {
    match e.code() {
        ErrorCode::NotFastForward => LifecycleError::WriteConflict(e.message().to_string()),
        _ => LifecycleError::transport(Backend::Git, e.message()),
    }
}

fn credential_callbacks(credentials: Option<&Path>) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, allowed| {
        let user = username_from_url.unwrap_or("git");
        if allowed.contains(git2::CredentialType::SSH_KEY) {
            return match credentials {
                Some(key) => Cred::ssh_key(user, None, key, None),
                None => Cred::ssh_key_from_agent(user),
            };
        }
        if allowed.contains(git2::CredentialType::USER_PASS_PLAINTEXT) {
            if let Some(token) = credentials.and_then(|p| std::fs::read_to_string(p).ok()) {
                return Cred::userpass_plaintext(user, token.trim());
            }
        }
        Cred::default()
    });
    callbacks
}

fn clone_repo(url: &str, path: &Path, credentials: Option<&Path>) -> LifecycleResult<Repository> {
    let mut fetch = FetchOptions::new();
    fetch.remote_callbacks(credential_callbacks(credentials));
    RepoBuilder::new().fetch_options(fetch).clone(url, path).map_err(git_err)
}

/// Check out `branch`, creating the local branch from `origin` when needed.
fn checkout_branch(repo: &Repository, branch: &str) -> LifecycleResult<()> {
    let commit = match repo.find_branch(branch, BranchType::Local) {
        Ok(local) => local.get().peel_to_commit().map_err(git_err)?,
        Err(_) => {
            let remote = repo
                .find_reference(&format!("refs/remotes/origin/{}", branch))
                .map_err(|_| LifecycleError::Configuration(format!("branch '{}' does not exist on the remote", branch)))?;
            let commit = remote.peel_to_commit().map_err(git_err)?;
            repo.branch(branch, &commit, false).map_err(git_err)?;
            commit
        }
    };
    let mut co = CheckoutBuilder::new();
    co.force();
    repo.checkout_tree(commit.as_object(), Some(&mut co)).map_err(git_err)?;
    repo.set_head(&format!("refs/heads/{}", branch)).map_err(git_err)
}

/// Stage everything under `rel` and commit it. `None` when the tree did not change.
fn commit_dir(repo: &Repository, rel: &str, settings: &GitSettings, message: &str) -> Result<Option<Oid>, git2::Error> {
    let mut index = repo.index()?;
    index.add_all(std::iter::once(rel), IndexAddOption::DEFAULT, None)?;
    index.update_all(std::iter::once(rel), None)?;
    index.write()?;
    let tree_id = index.write_tree()?;
    let parent = repo.head()?.peel_to_commit()?;
    if parent.tree_id() == tree_id {
        return Ok(None);
    }
    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now(&settings.author_name, &settings.author_email)?;
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent]).map(Some)
}

fn push_branch(repo: &Repository, branch: &str, credentials: Option<&Path>) -> LifecycleResult<()> {
    let rejected: RefCell<Option<String>> = RefCell::new(None);
    {
        let mut callbacks = credential_callbacks(credentials);
        callbacks.push_update_reference(|refname, status| {
            if let Some(msg) = status {
                *rejected.borrow_mut() = Some(format!("{} rejected: {}", refname, msg));
            }
            Ok(())
        });
        let mut opts = PushOptions::new();
        opts.remote_callbacks(callbacks);
        let mut remote = repo.find_remote("origin").map_err(git_err)?;
        let spec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        remote.push(&[spec.as_str()], Some(&mut opts)).map_err(git_err)?;
    }
    match rejected.into_inner() {
        Some(msg) => Err(LifecycleError::WriteConflict(msg)),
        None => Ok(()),
    }
}

fn sync_to_git(
    settings: &GitSettings,
    coords: &RepoCoordinates,
    cluster: &str,
    tree: &ManifestTree,
) -> LifecycleResult<TreeChange> {
    let internal = |e: std::io::Error| LifecycleError::Internal(format!("scratch clone: {}", e));
    std::fs::create_dir_all(&settings.workdir).map_err(internal)?;
    let scratch = tempfile::Builder::new().prefix("arbor-").tempdir_in(&settings.workdir).map_err(internal)?;
    let creds = settings.credentials.as_deref();

    let repo = clone_repo(&coords.repo_url, scratch.path(), creds)?;
    checkout_branch(&repo, &coords.branch)?;

    let rel = coords.manifest_path(cluster);
    let mut change =
        sync_dir(&scratch.path().join(&rel), tree).map_err(|e| LifecycleError::Internal(format!("{:#}", e)))?;
    if change.is_noop() {
        debug!(cluster, path = %rel, "tree: nothing to commit");
        return Ok(change);
    }
    let message = format!("arbor: deploy manifest tree for cluster {}", cluster);
    match commit_dir(&repo, &rel, settings, &message).map_err(git_err)? {
        Some(oid) => {
            push_branch(&repo, &coords.branch, creds)?;
            change.commit = Some(oid.to_string());
        }
        None => warn!(cluster, path = %rel, "tree: files differed but index tree is unchanged"),
    }
    Ok(change)
}

/// Deploys manifest trees by committing and pushing to the cluster's repo.
pub struct GitDeployer {
    settings: GitSettings,
}

impl GitDeployer {
    pub fn new(settings: GitSettings) -> Self { Self { settings } }
    pub fn from_env() -> Self { Self::new(GitSettings::from_env()) }
}

#[async_trait]
impl ManifestDeployer for GitDeployer {
    async fn deploy(
        &self,
        repo: &RepoCoordinates,
        identity: &ClusterIdentity,
        profile: Option<&Profile>,
    ) -> LifecycleResult<TreeChange> {
        let t0 = Instant::now();
        let tree = render_tree(identity, profile)?;
        let settings = self.settings.clone();
        let coords = repo.clone();
        let cluster = identity.name.clone();
        let change = tokio::task::spawn_blocking(move || sync_to_git(&settings, &coords, &cluster, &tree))
            .await
            .map_err(|e| LifecycleError::Internal(format!("deploy task: {}", e)))??;
        histogram!("tree_deploy_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if change.commit.is_some() {
            counter!("tree_commit_total", 1u64);
        } else {
            counter!("tree_noop_total", 1u64);
        }
        info!(
            cluster = %identity.name,
            repo = %repo.repo_url,
            branch = %repo.branch,
            written = change.written,
            removed = change.removed,
            commit = ?change.commit,
            took_ms = %t0.elapsed().as_millis(),
            "tree: deployed"
        );
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_fast_forward_is_a_write_conflict() {
        let e = git2::Error::new(ErrorCode::NotFastForward, git2::ErrorClass::Reference, "cannot push");
        assert!(matches!(git_err(e), LifecycleError::WriteConflict(_)));
        let e = git2::Error::new(ErrorCode::GenericError, git2::ErrorClass::Net, "connection refused");
        assert!(matches!(git_err(e), LifecycleError::Transport { backend: Backend::Git, .. }));
    }

    #[test]
    fn settings_defaults_are_usable() {
        let s = GitSettings::default();
        assert_eq!(s.author_name, "arbor");
        assert!(s.credentials.is_none());
    }
}
