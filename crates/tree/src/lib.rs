//! Arbor tree: render a cluster's manifest tree and sync it into a checkout.
//!
//! Rendering is pure. Syncing only touches files whose bytes differ, so re-deploying
//! identical inputs is a no-op.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use arbor_core::{
    ClusterIdentity, LifecycleError, LifecycleResult, ManifestDeployer, Profile, RepoCoordinates, TreeChange,
};
use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value as Yaml};
use tracing::{debug, info};

pub mod git;

pub use git::{GitDeployer, GitSettings};

pub const CHART_FILE: &str = "Chart.yaml";
pub const VALUES_FILE: &str = "values.yaml";
pub const PROFILE_DIR: &str = "profile";
pub const OVERRIDES_FILE: &str = "profile/overrides.yaml";

fn max_bundle_bytes() -> usize {
    std::env::var("ARBOR_MAX_BUNDLE_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

/// Rendered files keyed by path relative to the cluster directory (`/` separated).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestTree {
    pub files: BTreeMap<String, Vec<u8>>,
}

impl ManifestTree {
    pub fn paths(&self) -> impl Iterator<Item = &str> { self.files.keys().map(|s| s.as_str()) }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Chart<'a> {
    api_version: &'a str,
    name: &'a str,
    description: String,
    #[serde(rename = "type")]
    chart_type: &'a str,
    version: &'a str,
}

fn safe_bundle_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn check_bundle_yaml(name: &str, manifest: &str) -> LifecycleResult<()> {
    if manifest.len() > max_bundle_bytes() {
        return Err(LifecycleError::Render(format!("bundle '{}' too large (>{} bytes)", name, max_bundle_bytes())));
    }
    for doc in serde_yaml::Deserializer::from_str(manifest) {
        Yaml::deserialize(doc).map_err(|e| LifecycleError::Render(format!("bundle '{}' is not valid YAML: {}", name, e)))?;
    }
    Ok(())
}

fn to_yaml_bytes<T: Serialize>(what: &str, v: &T) -> LifecycleResult<Vec<u8>> {
    serde_yaml::to_string(v)
        .map(String::into_bytes)
        .map_err(|e| LifecycleError::Render(format!("serializing {}: {}", what, e)))
}

/// Base chart for the cluster type plus the profile's overlays.
pub fn render_tree(identity: &ClusterIdentity, profile: Option<&Profile>) -> LifecycleResult<ManifestTree> {
    let mut files = BTreeMap::new();

    let chart = Chart {
        api_version: "v2",
        name: &identity.name,
        description: match &identity.provider {
            Some(p) => format!("root chart for cluster {} ({})", identity.name, p),
            None => format!("root chart for cluster {}", identity.name),
        },
        chart_type: "application",
        version: "0.1.0",
    };
    files.insert(CHART_FILE.to_string(), to_yaml_bytes("Chart.yaml", &chart)?);

    let mut global = Mapping::new();
    global.insert(Yaml::from("clusterName"), Yaml::from(identity.name.as_str()));
    if let Some(p) = profile {
        global.insert(Yaml::from("profileName"), Yaml::from(p.name.as_str()));
    }
    let mut tags = Mapping::new();
    if let Some(p) = &identity.provider {
        tags.insert(Yaml::from(p.tag()), Yaml::from(true));
    }
    let mut values = Mapping::new();
    values.insert(Yaml::from("global"), Yaml::Mapping(global));
    values.insert(Yaml::from("tags"), Yaml::Mapping(tags));
    files.insert(VALUES_FILE.to_string(), to_yaml_bytes("values.yaml", &values)?);

    if let Some(p) = profile {
        for b in p.bundles.iter() {
            if !safe_bundle_name(&b.name) {
                return Err(LifecycleError::Render(format!("bundle name '{}' is not a safe file name", b.name)));
            }
            check_bundle_yaml(&b.name, &b.manifest)?;
            let path = format!("{}/{}.yaml", PROFILE_DIR, b.name);
            if path == OVERRIDES_FILE {
                return Err(LifecycleError::Render(format!(
                    "bundle '{}' in profile '{}' collides with the overrides file",
                    b.name, p.name
                )));
            }
            if files.insert(path, b.manifest.clone().into_bytes()).is_some() {
                return Err(LifecycleError::Render(format!("bundle '{}' listed twice in profile '{}'", b.name, p.name)));
            }
        }
        if !p.overrides.is_empty() {
            let mut by_bundle: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
            for o in p.overrides.iter() {
                by_bundle.entry(o.bundle.as_str()).or_default().insert(o.key.as_str(), o.value.as_str());
            }
            files.insert(OVERRIDES_FILE.to_string(), to_yaml_bytes("overrides", &by_bundle)?);
        }
    }
    Ok(ManifestTree { files })
}

fn walk_files(root: &Path, dir: &Path, out: &mut BTreeSet<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            walk_files(root, &path, out)?;
        } else {
            let rel = path.strip_prefix(root).context("relativizing tree path")?;
            let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect();
            out.insert(parts.join("/"));
        }
    }
    Ok(())
}

/// Make `dir` hold exactly `tree`: rewrite differing files, remove files not in the tree.
pub fn sync_dir(dir: &Path, tree: &ManifestTree) -> Result<TreeChange> {
    let mut existing = BTreeSet::new();
    if dir.exists() {
        walk_files(dir, dir, &mut existing)?;
    }
    let mut change = TreeChange::default();
    for (rel, bytes) in tree.files.iter() {
        let path = dir.join(rel);
        let same = existing.remove(rel) && std::fs::read(&path).map(|cur| &cur == bytes).unwrap_or(false);
        if same {
            change.unchanged += 1;
            continue;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        change.written += 1;
    }
    for stale in existing {
        let path = dir.join(&stale);
        std::fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        debug!(path = %stale, "removed stale manifest");
        change.removed += 1;
    }
    Ok(change)
}

/// Deploys into a local directory (an existing checkout managed outside arbor).
pub struct DirDeployer {
    root: PathBuf,
}

impl DirDeployer {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }
}

#[async_trait]
impl ManifestDeployer for DirDeployer {
    async fn deploy(
        &self,
        repo: &RepoCoordinates,
        identity: &ClusterIdentity,
        profile: Option<&Profile>,
    ) -> LifecycleResult<TreeChange> {
        let t0 = Instant::now();
        let tree = render_tree(identity, profile)?;
        let dir = self.root.join(repo.manifest_path(&identity.name));
        let change = sync_dir(&dir, &tree).map_err(|e| LifecycleError::Internal(format!("{:#}", e)))?;
        histogram!("tree_deploy_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if change.is_noop() { counter!("tree_noop_total", 1u64); }
        info!(cluster = %identity.name, dir = %dir.display(), written = change.written, removed = change.removed, "tree: synced directory");
        Ok(change)
    }
}
