// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes pod backend.
//!
//! Talks to the Kubernetes REST API directly. The API client is created once by
//! [`PodResourceOperatorBuilder::initialize`]; until that succeeds the builder
//! reports every kind as unsupported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ResourceError, Result};
use crate::traits::{
    Resource, ResourceId, ResourceKind, ResourceLocation, ResourceOperator,
    ResourceOperatorBuilder, ResourceSpec, ResourceState,
};

const LABEL_APP: &str = "app";
const LABEL_REGION: &str = "tasklane/region";
const LABEL_GROUP: &str = "tasklane/group";
const APP_NAME: &str = "tasklane-supervisor";
const CONTAINER_NAME: &str = "supervisor";

/// Configuration for the pod backend.
///
/// Either `api_url` (plus optional `token`) or `kube_config` must be set.
#[derive(Debug, Clone)]
pub struct PodOperatorConfig {
    pub api_url: Option<String>,
    pub token: Option<String>,
    /// Kube-config document, YAML or JSON.
    pub kube_config: Option<String>,
    pub namespace: String,
    /// Default container image for supervisor pods.
    pub image: String,
    /// Port the supervisor container listens on.
    pub container_port: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// TCP keep-alive interval for API connections.
    pub keep_alive: Duration,
    pub accept_invalid_certs: bool,
}

impl Default for PodOperatorConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            token: None,
            kube_config: None,
            namespace: "default".to_string(),
            image: "tasklane/supervisor:latest".to_string(),
            container_port: 9100,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
            accept_invalid_certs: false,
        }
    }
}

impl PodOperatorConfig {
    /// Load Kubernetes settings from `TASKLANE_K8S_*` variables.
    ///
    /// Returns `Ok(None)` when neither `TASKLANE_K8S_API_URL` nor
    /// `TASKLANE_K8S_CONFIG` is set. `TASKLANE_K8S_CONFIG` may hold inline
    /// kube-config JSON, a path to a kube-config file, or a base64-encoded
    /// kube-config.
    pub fn from_env() -> Result<Option<Self>> {
        fn millis(key: &str, default: Duration) -> Result<Duration> {
            match std::env::var(key) {
                Ok(v) => v
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(|_| ResourceError::InvalidConfig(format!("{key} must be a number"))),
                Err(_) => Ok(default),
            }
        }

        let api_url = std::env::var("TASKLANE_K8S_API_URL").ok();
        let kube_config = std::env::var("TASKLANE_K8S_CONFIG")
            .ok()
            .map(|value| load_kube_config(&value))
            .transpose()?;
        if api_url.is_none() && kube_config.is_none() {
            return Ok(None);
        }

        let default = Self::default();
        let keep_alive_secs = match std::env::var("TASKLANE_K8S_KEEPALIVE_SECS") {
            Ok(v) => v.parse().map_err(|_| {
                ResourceError::InvalidConfig("TASKLANE_K8S_KEEPALIVE_SECS must be a number".into())
            })?,
            Err(_) => default.keep_alive.as_secs(),
        };

        Ok(Some(Self {
            api_url,
            token: std::env::var("TASKLANE_K8S_TOKEN").ok(),
            kube_config,
            namespace: std::env::var("TASKLANE_K8S_NAMESPACE").unwrap_or(default.namespace),
            image: std::env::var("TASKLANE_K8S_IMAGE").unwrap_or(default.image),
            container_port: default.container_port,
            connect_timeout: millis("TASKLANE_K8S_CONNECT_TIMEOUT_MS", default.connect_timeout)?,
            read_timeout: millis("TASKLANE_K8S_READ_TIMEOUT_MS", default.read_timeout)?,
            keep_alive: Duration::from_secs(keep_alive_secs),
            accept_invalid_certs: std::env::var("TASKLANE_K8S_INSECURE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }))
    }
}

// ========== Kube-config ==========

/// Turn a `TASKLANE_K8S_CONFIG` value into kube-config text: inline JSON is
/// kept, an existing file is read, anything else must be base64.
fn load_kube_config(value: &str) -> Result<String> {
    let value = value.trim();
    if value.starts_with('{') {
        return Ok(value.to_string());
    }
    if std::path::Path::new(value).is_file() {
        return Ok(std::fs::read_to_string(value)?);
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| {
            ResourceError::InvalidConfig(format!(
                "kube-config is neither JSON, a readable file nor base64: {e}"
            ))
        })?;
    String::from_utf8(bytes)
        .map_err(|_| ResourceError::InvalidConfig("decoded kube-config is not UTF-8".into()))
}

#[derive(Debug, Deserialize)]
struct KubeConfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context", default)]
    current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    server: String,
    #[serde(rename = "certificate-authority-data", default)]
    certificate_authority_data: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
}

/// Connection settings resolved from either configuration form.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ApiTarget {
    base_url: String,
    token: Option<String>,
    ca_pem: Option<Vec<u8>>,
    insecure: bool,
    namespace: Option<String>,
}

fn resolve_kube_config(raw: &str) -> Result<ApiTarget> {
    // JSON is a subset of YAML, so one parser covers both forms.
    let config: KubeConfig = serde_yaml::from_str(raw)
        .map_err(|e| ResourceError::InvalidConfig(format!("kube-config is not valid: {e}")))?;

    let context = match &config.current_context {
        Some(name) => config.contexts.iter().find(|c| &c.name == name),
        None => config.contexts.first(),
    };

    let cluster = match context {
        Some(ctx) => config
            .clusters
            .iter()
            .find(|c| c.name == ctx.context.cluster),
        None => config.clusters.first(),
    }
    .ok_or_else(|| ResourceError::InvalidConfig("kube-config has no usable cluster".into()))?;

    let user = match context.and_then(|ctx| ctx.context.user.as_deref()) {
        Some(name) => config.users.iter().find(|u| u.name == name),
        None => config.users.first(),
    };

    let ca_pem = cluster
        .cluster
        .certificate_authority_data
        .as_deref()
        .map(|data| base64::engine::general_purpose::STANDARD.decode(data.trim()))
        .transpose()
        .map_err(|e| ResourceError::InvalidConfig(format!("bad certificate-authority-data: {e}")))?;

    Ok(ApiTarget {
        base_url: cluster.cluster.server.trim_end_matches('/').to_string(),
        token: user.and_then(|u| u.user.token.clone()),
        ca_pem,
        insecure: cluster.cluster.insecure_skip_tls_verify,
        namespace: context.and_then(|ctx| ctx.context.namespace.clone()),
    })
}

fn resolve_target(config: &PodOperatorConfig) -> Result<ApiTarget> {
    if let Some(raw) = &config.kube_config {
        return resolve_kube_config(raw);
    }
    let base_url = config.api_url.as_deref().ok_or_else(|| {
        ResourceError::InvalidConfig("either an API URL or a kube-config is required".into())
    })?;
    Ok(ApiTarget {
        base_url: base_url.trim_end_matches('/').to_string(),
        token: config.token.clone(),
        ca_pem: None,
        insecure: config.accept_invalid_certs,
        namespace: None,
    })
}

// ========== API client ==========

/// Minimal client for the core/v1 pod endpoints.
pub struct PodApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl PodApiClient {
    fn new(target: &ApiTarget, config: &PodOperatorConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .tcp_keepalive(config.keep_alive)
            .danger_accept_invalid_certs(target.insecure);
        if let Some(pem) = &target.ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }
        Ok(Self {
            http: builder.build()?,
            base_url: target.base_url.clone(),
            token: target.token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ResourceError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// GET /version; used as the liveness ping during initialization.
    pub async fn ping(&self) -> Result<()> {
        let response = self.request(reqwest::Method::GET, "/version").send().await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn create_pod(&self, namespace: &str, manifest: &Value) -> Result<Value> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/namespaces/{namespace}/pods"),
            )
            .json(manifest)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Value>> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/namespaces/{namespace}/pods/{name}"),
            )
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check(response).await?.json().await?))
    }

    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/api/v1/namespaces/{namespace}/pods/{name}"),
            )
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(namespace, name, "Pod already deleted");
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }
}

// ========== Builder ==========

/// Builder for [`PodResourceOperator`].
pub struct PodResourceOperatorBuilder {
    config: PodOperatorConfig,
    client: OnceLock<(Arc<PodApiClient>, String)>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
}

impl PodResourceOperatorBuilder {
    pub fn new(config: PodOperatorConfig) -> Self {
        Self {
            config,
            client: OnceLock::new(),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ResourceOperatorBuilder for PodResourceOperatorBuilder {
    fn name(&self) -> &'static str {
        "k8s"
    }

    /// Create the API client and ping it. Concurrent callers wait for the first
    /// attempt; after a success further calls return immediately. A failed
    /// attempt may be retried.
    async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        let target = resolve_target(&self.config)?;
        let client = PodApiClient::new(&target, &self.config)?;
        client.ping().await?;

        let namespace = target
            .namespace
            .unwrap_or_else(|| self.config.namespace.clone());
        info!(api = %target.base_url, %namespace, "Kubernetes API client initialized");

        let _ = self.client.set((Arc::new(client), namespace));
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn supports(&self, kind: ResourceKind) -> bool {
        kind == ResourceKind::Pod && self.is_initialized()
    }

    fn build(&self, location: &ResourceLocation) -> Result<Arc<dyn ResourceOperator>> {
        let (client, namespace) = self
            .client
            .get()
            .ok_or(ResourceError::Unsupported(ResourceKind::Pod))?;
        Ok(Arc::new(PodResourceOperator {
            client: client.clone(),
            namespace: namespace.clone(),
            image: self.config.image.clone(),
            container_port: self.config.container_port,
            location: location.clone(),
        }))
    }
}

// ========== Operator ==========

/// Operator creating one supervisor pod per resource.
pub struct PodResourceOperator {
    client: Arc<PodApiClient>,
    namespace: String,
    image: String,
    container_port: u16,
    location: ResourceLocation,
}

/// Pod names must be DNS-1123 labels.
fn pod_name(raw: &str) -> String {
    let mut name: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    name.truncate(63);
    name.trim_matches('-').to_string()
}

impl PodResourceOperator {
    fn manifest(&self, spec: &ResourceSpec, name: &str) -> Value {
        let env: Vec<Value> = spec
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();

        let mut container = json!({
            "name": CONTAINER_NAME,
            "image": spec.image.as_deref().unwrap_or(&self.image),
            "env": env,
            "ports": [{ "containerPort": spec.port.unwrap_or(self.container_port) }],
        });
        if let (Some(min), Some(max)) = (spec.heap_min_mb, spec.heap_max_mb) {
            container["resources"] = json!({
                "requests": { "memory": format!("{min}Mi") },
                "limits": { "memory": format!("{max}Mi") },
            });
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "labels": {
                    LABEL_APP: APP_NAME,
                    LABEL_REGION: spec.location.region,
                    LABEL_GROUP: spec.location.group,
                },
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [container],
            },
        })
    }

    fn to_resource(&self, id: ResourceId, pod: &Value) -> Resource {
        let state = match pod["status"]["phase"].as_str() {
            Some("Pending") => ResourceState::Creating,
            Some("Running") => ResourceState::Running,
            Some("Succeeded") => ResourceState::Exited,
            Some("Failed") => ResourceState::Failed,
            None => ResourceState::Creating,
            Some(_) => ResourceState::Unknown,
        };
        let created_at = pod["metadata"]["creationTimestamp"]
            .as_str()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Resource {
            id,
            state,
            host: pod["status"]["podIP"].as_str().map(str::to_string),
            port: Some(self.container_port),
            created_at,
        }
    }

    fn check_id(&self, id: &ResourceId) -> Result<()> {
        if id.kind != ResourceKind::Pod || id.name.is_empty() {
            return Err(ResourceError::InvalidId(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceOperator for PodResourceOperator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Pod
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<Resource> {
        let name = pod_name(&spec.name);
        if name.is_empty() {
            return Err(ResourceError::CreateFailed(format!(
                "'{}' does not yield a valid pod name",
                spec.name
            )));
        }

        let created = self
            .client
            .create_pod(&self.namespace, &self.manifest(spec, &name))
            .await
            .map_err(|e| match e {
                ResourceError::Api { status, message } => {
                    ResourceError::CreateFailed(format!("pod {name} rejected ({status}): {message}"))
                }
                other => other,
            })?;

        info!(pod = %name, namespace = %self.namespace, "Created supervisor pod");
        let id = ResourceId::new(
            ResourceKind::Pod,
            self.location.clone(),
            self.namespace.clone(),
            name,
        );
        Ok(self.to_resource(id, &created))
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<Resource>> {
        self.check_id(id)?;
        let pod = self.client.get_pod(&id.namespace, &id.name).await?;
        Ok(pod.map(|pod| self.to_resource(id.clone(), &pod)))
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        self.check_id(id)?;
        if let Err(e) = self.client.delete_pod(&id.namespace, &id.name).await {
            warn!(pod = %id.name, error = %e, "Failed to delete pod");
            return Err(e);
        }
        info!(pod = %id.name, "Deleted supervisor pod");
        Ok(())
    }
}
