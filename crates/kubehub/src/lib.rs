//! Arbor kubehub – kube client wiring, cluster-spec/profile store and engine client

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{Context, Result};
use arbor_core::{
    Application, Backend, Bundle, ClusterSpec, ConfigStore, DeliveryEngine, LifecycleError, LifecycleResult,
    Override, Profile, RecordKind, RootDescriptor,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

pub const PROFILE_GROUP: &str = "core.arbor.io";
pub const PROFILE_VERSION: &str = "v1";
pub const BUNDLE_DATA_KEY: &str = "data";

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared kube client for the current context; created on first use.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let client = Client::try_default().await.context("creating kube client from current context")?;
    let _ = CLIENT.set(client.clone());
    Ok(client)
}

/// API server URL of the current context; used as the default management endpoint.
pub async fn management_endpoint() -> Result<String> {
    let cfg = kube::Config::infer().await.context("inferring kube config")?;
    Ok(cfg.cluster_url.to_string().trim_end_matches('/').to_string())
}

fn kube_err(backend: Backend, e: kube::Error) -> LifecycleError {
    if let kube::Error::Api(ae) = &e {
        if ae.code == 409 {
            return LifecycleError::Conflict(ae.message.clone());
        }
    }
    LifecycleError::transport(backend, e)
}

async fn client_or_transport(backend: Backend) -> LifecycleResult<Client> {
    get_kube_client().await.map_err(|e| LifecycleError::transport(backend, format!("{:#}", e)))
}

// ----------------- Configuration store -----------------

/// Reads cluster specs (ConfigMaps), profiles (`core.arbor.io/v1 Profile`, falling back to
/// legacy ConfigMap profiles) and bundles (Secrets) from one namespace.
pub struct KubeConfigStore {
    namespace: String,
}

impl KubeConfigStore {
    pub fn new(namespace: impl Into<String>) -> Self { Self { namespace: namespace.into() } }

    fn profile_resource() -> ApiResource {
        let gvk = GroupVersionKind::gvk(PROFILE_GROUP, PROFILE_VERSION, "Profile");
        ApiResource::from_gvk_with_plural(&gvk, "profiles")
    }

    async fn bundle(&self, client: Client, name: &str) -> LifecycleResult<Bundle> {
        let api: Api<Secret> = Api::namespaced(client, &self.namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(|e| kube_err(Backend::Kube, e))?
            .ok_or_else(|| LifecycleError::not_found(RecordKind::Bundle, name))?;
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(BUNDLE_DATA_KEY))
            .map(|b| b.0.clone())
            .ok_or_else(|| LifecycleError::Render(format!("bundle '{}' has no '{}' key", name, BUNDLE_DATA_KEY)))?;
        let manifest = String::from_utf8(bytes)
            .map_err(|_| LifecycleError::Render(format!("bundle '{}' is not valid UTF-8", name)))?;
        Ok(Bundle { name: name.to_string(), manifest })
    }
}

/// Profile header as stored on the cluster, before bundles are fetched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfileRecord {
    pub description: String,
    pub bundles: Vec<String>,
    pub overrides: Vec<Override>,
}

/// Parse a Profile object's JSON (`spec.description`, `spec.bundles`, `spec.overrides`).
pub fn profile_record_from_object(obj: &Json) -> ProfileRecord {
    let spec = obj.get("spec");
    let description = spec.and_then(|s| s.get("description")).and_then(|v| v.as_str()).unwrap_or("").to_string();
    let bundles = spec
        .and_then(|s| s.get("bundles"))
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|b| b.as_str()).map(|s| s.to_string()).collect())
        .unwrap_or_default();
    let overrides = spec
        .and_then(|s| s.get("overrides"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|o| {
                    Some(Override {
                        bundle: o.get("bundle")?.as_str()?.to_string(),
                        key: o.get("key")?.as_str()?.to_string(),
                        value: o.get("value").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    ProfileRecord { description, bundles, overrides }
}

/// Parse a legacy ConfigMap profile (`bundles` is comma separated).
pub fn profile_record_from_legacy(data: &BTreeMap<String, String>) -> ProfileRecord {
    let bundles = data
        .get("bundles")
        .map(|s| s.split(',').map(str::trim).filter(|b| !b.is_empty()).map(|b| b.to_string()).collect())
        .unwrap_or_default();
    ProfileRecord {
        description: data.get("description").cloned().unwrap_or_default(),
        bundles,
        overrides: Vec::new(),
    }
}

#[async_trait]
impl ConfigStore for KubeConfigStore {
    async fn cluster_spec(&self, name: &str) -> LifecycleResult<ClusterSpec> {
        let client = client_or_transport(Backend::Kube).await?;
        let api: Api<ConfigMap> = Api::namespaced(client, &self.namespace);
        let cm = api
            .get_opt(name)
            .await
            .map_err(|e| kube_err(Backend::Kube, e))?
            .ok_or_else(|| LifecycleError::not_found(RecordKind::ClusterSpec, name))?;
        let data = cm.data.unwrap_or_default();
        debug!(cluster_spec = %name, keys = data.len(), "cluster spec loaded");
        ClusterSpec::from_data(name, &data)
    }

    async fn profile(&self, name: &str) -> LifecycleResult<Profile> {
        let client = client_or_transport(Backend::Kube).await?;
        let ar = Self::profile_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), &self.namespace, &ar);
        let record = match api.get_opt(name).await.map_err(|e| kube_err(Backend::Kube, e))? {
            Some(obj) => profile_record_from_object(&obj.data),
            None => {
                let cms: Api<ConfigMap> = Api::namespaced(client.clone(), &self.namespace);
                match cms.get_opt(name).await.map_err(|e| kube_err(Backend::Kube, e))? {
                    Some(cm) => {
                        warn!(profile = %name, "profile object not found, using legacy profile");
                        profile_record_from_legacy(&cm.data.unwrap_or_default())
                    }
                    None => return Err(LifecycleError::not_found(RecordKind::Profile, name)),
                }
            }
        };
        let mut bundles = Vec::with_capacity(record.bundles.len());
        for b in record.bundles.iter() {
            bundles.push(self.bundle(client.clone(), b).await?);
        }
        Ok(Profile { name: name.to_string(), description: record.description, bundles, overrides: record.overrides })
    }
}

// ----------------- Delivery engine -----------------

/// Registers root descriptors as ArgoCD `Application` objects through the kube API.
pub struct KubeEngine;

impl KubeEngine {
    pub fn new() -> Self { Self }

    fn resource() -> ApiResource {
        let gvk = GroupVersionKind::gvk("argoproj.io", "v1alpha1", "Application");
        ApiResource::from_gvk_with_plural(&gvk, "applications")
    }

    async fn api(namespace: &str) -> LifecycleResult<Api<DynamicObject>> {
        let client = client_or_transport(Backend::Engine).await?;
        Ok(Api::namespaced_with(client, namespace, &Self::resource()))
    }
}

impl Default for KubeEngine {
    fn default() -> Self { Self::new() }
}

pub fn dynamic_from_application(app: &Application) -> LifecycleResult<DynamicObject> {
    let v = serde_json::to_value(app).map_err(|e| LifecycleError::Internal(format!("encoding application: {}", e)))?;
    serde_json::from_value(v).map_err(|e| LifecycleError::Internal(format!("building dynamic object: {}", e)))
}

pub fn application_from_dynamic(obj: &DynamicObject) -> LifecycleResult<Application> {
    let v = serde_json::to_value(obj).map_err(|e| LifecycleError::Internal(format!("encoding object: {}", e)))?;
    serde_json::from_value(v).map_err(|e| LifecycleError::Internal(format!("decoding application: {}", e)))
}

#[async_trait]
impl DeliveryEngine for KubeEngine {
    async fn get(&self, namespace: &str, name: &str) -> LifecycleResult<Option<RootDescriptor>> {
        let api = Self::api(namespace).await?;
        match api.get_opt(name).await.map_err(|e| kube_err(Backend::Engine, e))? {
            Some(obj) => Ok(Some(RootDescriptor::from_application(&application_from_dynamic(&obj)?)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, descriptor: &RootDescriptor) -> LifecycleResult<RootDescriptor> {
        let t0 = Instant::now();
        let api = Self::api(&descriptor.namespace).await?;
        let mut app = descriptor.to_application();
        app.metadata.resource_version = None;
        let obj = dynamic_from_application(&app)?;
        let created = api.create(&PostParams::default(), &obj).await.map_err(|e| {
            counter!("engine_err", 1u64);
            kube_err(Backend::Engine, e)
        })?;
        histogram!("engine_call_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(name = %descriptor.name, ns = %descriptor.namespace, rv = ?created.metadata.resource_version, "engine: descriptor created");
        RootDescriptor::from_application(&application_from_dynamic(&created)?)
    }

    async fn update(&self, descriptor: &RootDescriptor) -> LifecycleResult<RootDescriptor> {
        let t0 = Instant::now();
        let api = Self::api(&descriptor.namespace).await?;
        let obj = dynamic_from_application(&descriptor.to_application())?;
        let replaced = api.replace(&descriptor.name, &PostParams::default(), &obj).await.map_err(|e| {
            counter!("engine_err", 1u64);
            kube_err(Backend::Engine, e)
        })?;
        histogram!("engine_call_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(name = %descriptor.name, ns = %descriptor.namespace, rv = ?replaced.metadata.resource_version, "engine: descriptor replaced");
        RootDescriptor::from_application(&application_from_dynamic(&replaced)?)
    }
}
