//! Root descriptor and its delivery-engine wire form.
//!
//! [`RootDescriptor`] is the typed record the lifecycle logic works with. The engine
//! stores an ArgoCD-style `Application`; conversion happens only through
//! [`RootDescriptor::to_application`] and [`RootDescriptor::from_application`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{LifecycleError, LifecycleResult};
use crate::provider::ClusterProviderType;

pub const APP_API_VERSION: &str = "argoproj.io/v1alpha1";
pub const APP_KIND: &str = "Application";
pub const APP_FINALIZER: &str = "resources-finalizer.argocd.argoproj.io";
pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_ARBOR_TYPE: &str = "arbor-type";
pub const ANNOTATION_PROFILE: &str = "arbor.io/profile";
pub const ANNOTATION_CLUSTER_SPEC: &str = "arbor.io/clusterspec";
pub const PARAM_CLUSTER_NAME: &str = "global.clusterName";
pub const PARAM_MANAGEMENT_URL: &str = "global.managementClusterUrl";
pub const PARAM_GLOBAL_PREFIX: &str = "global.";
pub const PARAM_TAGS_PREFIX: &str = "tags.";

/// The record registered with the delivery engine, one per managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootDescriptor {
    pub name: String,
    pub namespace: String,
    pub repo_url: String,
    pub branch: String,
    pub path: String,
    pub destination_server: String,
    pub destination_namespace: String,
    pub provider: Option<ClusterProviderType>,
    pub profile: Option<String>,
    pub cluster_spec: Option<String>,
    pub management_endpoint: String,
    /// Cluster-spec values, emitted as `global.<key>` parameters.
    pub values: BTreeMap<String, String>,
    /// Parameters this crate does not interpret; preserved as found.
    pub extra_parameters: SmallVec<[HelmParameter; 4]>,
    /// Engine version token of the record this descriptor was read from or will replace.
    pub resource_version: Option<String>,
}

impl RootDescriptor {
    /// True when the descriptor carries exactly this provider tag.
    pub fn carries_tag(&self, tag: &ClusterProviderType) -> bool {
        self.provider.as_ref() == Some(tag)
    }

    /// Flattened engine parameter list, in emission order.
    pub fn helm_parameters(&self) -> Vec<HelmParameter> {
        let mut out = Vec::with_capacity(3 + self.values.len() + self.extra_parameters.len());
        out.push(HelmParameter::new(PARAM_CLUSTER_NAME, &self.name));
        out.push(HelmParameter::new(PARAM_MANAGEMENT_URL, &self.management_endpoint));
        for (k, v) in self.values.iter() {
            out.push(HelmParameter::new(format!("{}{}", PARAM_GLOBAL_PREFIX, k), v));
        }
        out.extend(self.extra_parameters.iter().cloned());
        if let Some(tag) = &self.provider {
            out.push(HelmParameter::new(format!("{}{}", PARAM_TAGS_PREFIX, tag.tag()), "true"));
        }
        out
    }

    pub fn to_application(&self) -> Application {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), "arbor".to_string());
        labels.insert(LABEL_ARBOR_TYPE.to_string(), "cluster-app".to_string());
        let mut annotations = BTreeMap::new();
        if let Some(p) = &self.profile { annotations.insert(ANNOTATION_PROFILE.to_string(), p.clone()); }
        if let Some(cs) = &self.cluster_spec { annotations.insert(ANNOTATION_CLUSTER_SPEC.to_string(), cs.clone()); }
        Application {
            api_version: APP_API_VERSION.to_string(),
            kind: APP_KIND.to_string(),
            metadata: AppMetadata {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
                labels,
                annotations,
                finalizers: vec![APP_FINALIZER.to_string()],
                resource_version: self.resource_version.clone(),
            },
            spec: AppSpec {
                source: AppSource {
                    repo_url: self.repo_url.clone(),
                    target_revision: self.branch.clone(),
                    path: self.path.clone(),
                    helm: Some(HelmSource { parameters: self.helm_parameters() }),
                },
                destination: AppDestination {
                    server: Some(self.destination_server.clone()),
                    namespace: Some(self.destination_namespace.clone()),
                },
                sync_policy: Some(SyncPolicy { automated: Some(SyncPolicyAutomated { prune: true, self_heal: false }) }),
            },
        }
    }

    /// Parse the engine's record. Fails with `AmbiguousTag` when more than one
    /// provider tag is enabled; enabled tags that name no provider type are kept
    /// in `extra_parameters`.
    pub fn from_application(app: &Application) -> LifecycleResult<Self> {
        let mut provider: Option<ClusterProviderType> = None;
        let mut management_endpoint = String::new();
        let mut values = BTreeMap::new();
        let mut extra_parameters = SmallVec::new();
        let params = app.spec.source.helm.as_ref().map(|h| h.parameters.as_slice()).unwrap_or(&[]);
        for p in params {
            if let Some(tag) = p.name.strip_prefix(PARAM_TAGS_PREFIX) {
                if p.value != "true" {
                    extra_parameters.push(p.clone());
                    continue;
                }
                // Other enabled tags (helm subchart groups) are not provider types.
                let Ok(parsed) = tag.parse::<ClusterProviderType>() else {
                    extra_parameters.push(p.clone());
                    continue;
                };
                if let Some(prev) = provider {
                    if prev != parsed {
                        return Err(LifecycleError::AmbiguousTag(format!(
                            "descriptor '{}' enables both '{}' and '{}'",
                            app.metadata.name, prev, parsed
                        )));
                    }
                }
                provider = Some(parsed);
            } else if p.name == PARAM_CLUSTER_NAME {
                continue;
            } else if p.name == PARAM_MANAGEMENT_URL {
                management_endpoint = p.value.clone();
            } else if let Some(key) = p.name.strip_prefix(PARAM_GLOBAL_PREFIX) {
                values.insert(key.to_string(), p.value.clone());
            } else {
                extra_parameters.push(p.clone());
            }
        }
        Ok(Self {
            name: app.metadata.name.clone(),
            namespace: app.metadata.namespace.clone(),
            repo_url: app.spec.source.repo_url.clone(),
            branch: app.spec.source.target_revision.clone(),
            path: app.spec.source.path.clone(),
            destination_server: app.spec.destination.server.clone().unwrap_or_default(),
            destination_namespace: app.spec.destination.namespace.clone().unwrap_or_default(),
            provider,
            profile: app.metadata.annotations.get(ANNOTATION_PROFILE).cloned(),
            cluster_spec: app.metadata.annotations.get(ANNOTATION_CLUSTER_SPEC).cloned(),
            management_endpoint,
            values,
            extra_parameters,
            resource_version: app.metadata.resource_version.clone(),
        })
    }

    pub fn to_yaml(&self) -> LifecycleResult<String> {
        serde_yaml::to_string(&self.to_application())
            .map_err(|e| LifecycleError::Internal(format!("serializing descriptor: {}", e)))
    }

    pub fn from_yaml(yaml: &str) -> LifecycleResult<Self> {
        let app: Application = serde_yaml::from_str(yaml)
            .map_err(|e| LifecycleError::Internal(format!("parsing descriptor yaml: {}", e)))?;
        Self::from_application(&app)
    }
}

// ---- wire form ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub api_version: String,
    pub kind: String,
    pub metadata: AppMetadata,
    pub spec: AppSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMetadata {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    pub source: AppSource,
    pub destination: AppDestination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSource {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default)]
    pub target_revision: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HelmSource {
    #[serde(default)]
    pub parameters: Vec<HelmParameter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmParameter {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_string: bool,
}

impl HelmParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), force_string: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppDestination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<SyncPolicyAutomated>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicyAutomated {
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub self_heal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ClusterFlavor;

    fn sample() -> RootDescriptor {
        let mut values = BTreeMap::new();
        values.insert("region".to_string(), "us-west-2".to_string());
        RootDescriptor {
            name: "prod".into(),
            namespace: "argocd".into(),
            repo_url: "git://x/y".into(),
            branch: "main".into(),
            path: "clusters/prod".into(),
            destination_server: "https://kubernetes.default.svc".into(),
            destination_namespace: "default".into(),
            provider: Some(ClusterProviderType::new(None, ClusterFlavor::AwsEks)),
            profile: Some("baseline".into()),
            cluster_spec: Some("eks-small".into()),
            management_endpoint: "https://mgmt:6443".into(),
            values,
            extra_parameters: SmallVec::new(),
            resource_version: None,
        }
    }

    #[test]
    fn tag_is_emitted_as_boolean_parameter() {
        let params = sample().helm_parameters();
        let names: Vec<_> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["global.clusterName", "global.managementClusterUrl", "global.region", "tags.aws-eks"]);
        assert_eq!(params[3].value, "true");
    }

    #[test]
    fn wire_form_parses_back_to_same_descriptor() {
        let d = sample();
        let yaml = d.to_yaml().unwrap();
        assert!(yaml.contains("repoURL: git://x/y"), "yaml={}", yaml);
        let back = RootDescriptor::from_yaml(&yaml).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn two_enabled_tags_are_ambiguous() {
        let mut app = sample().to_application();
        if let Some(h) = app.spec.source.helm.as_mut() {
            h.parameters.push(HelmParameter::new("tags.gcp-gke", "true"));
        }
        let e = RootDescriptor::from_application(&app).unwrap_err();
        assert!(matches!(e, LifecycleError::AmbiguousTag(_)), "e={}", e);
    }

    #[test]
    fn disabled_tags_and_foreign_params_are_preserved() {
        let mut app = sample().to_application();
        if let Some(h) = app.spec.source.helm.as_mut() {
            h.parameters.insert(0, HelmParameter::new("tags.gcp-gke", "false"));
            h.parameters.insert(0, HelmParameter::new("replicaCount", "2"));
        }
        let d = RootDescriptor::from_application(&app).unwrap();
        assert_eq!(d.provider.map(|p| p.tag()), Some("aws-eks".to_string()));
        let extra: Vec<_> = d.extra_parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(extra, vec!["replicaCount", "tags.gcp-gke"]);
    }

    #[test]
    fn unrelated_enabled_tag_is_kept_as_extra_parameter() {
        let mut app = sample().to_application();
        if let Some(h) = app.spec.source.helm.as_mut() {
            h.parameters.push(HelmParameter::new("tags.monitoring", "true"));
        }
        let yaml = serde_yaml::to_string(&app).unwrap();
        let d = RootDescriptor::from_yaml(&yaml).unwrap();
        assert_eq!(d.provider.map(|p| p.tag()), Some("aws-eks".to_string()));
        let extra: Vec<_> = d.extra_parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(extra, vec!["tags.monitoring"]);
        assert!(d.helm_parameters().iter().any(|p| p.name == "tags.monitoring" && p.value == "true"));
    }

    #[test]
    fn missing_helm_section_yields_untagged_descriptor() {
        let mut app = sample().to_application();
        app.spec.source.helm = None;
        let d = RootDescriptor::from_application(&app).unwrap();
        assert_eq!(d.provider, None);
        assert!(d.values.is_empty());
    }
}
