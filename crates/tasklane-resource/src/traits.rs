// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource operator trait definitions.
//!
//! A [`ResourceOperatorBuilder`] says whether it can serve a [`ResourceKind`] and
//! builds [`ResourceOperator`]s bound to a [`ResourceLocation`]. Operators are
//! interchangeable: the allocator only sees `create`/`get`/`delete`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ResourceError, Result};

/// Kind of compute resource a job executor runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Local operating-system process.
    Process,
    /// Kubernetes pod.
    Pod,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Process => "process",
            ResourceKind::Pod => "pod",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(ResourceKind::Process),
            "pod" | "k8s" => Ok(ResourceKind::Pod),
            other => Err(ResourceError::InvalidConfig(format!(
                "unknown resource kind '{other}'"
            ))),
        }
    }
}

/// Region/group tags used to place resources and pick supervisors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLocation {
    pub region: String,
    pub group: String,
}

impl ResourceLocation {
    pub fn new(region: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for ResourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.group)
    }
}

/// Identifies one resource across backends.
///
/// The string form is `kind:region/group/namespace/name` and is what gets
/// persisted as the backlink from a supervisor endpoint to its resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub location: ResourceLocation,
    pub namespace: String,
    /// Backend handle: process id for processes, pod name for pods.
    pub name: String,
}

impl ResourceId {
    pub fn new(
        kind: ResourceKind,
        location: ResourceLocation,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            location,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}/{}",
            self.kind, self.location.region, self.location.group, self.namespace, self.name
        )
    }
}

impl FromStr for ResourceId {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ResourceError::InvalidId(s.to_string());
        let (kind, rest) = s.split_once(':').ok_or_else(invalid)?;
        let parts: Vec<&str> = rest.splitn(4, '/').collect();
        let [region, group, namespace, name] = parts.as_slice() else {
            return Err(invalid());
        };
        if name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            kind: kind.parse()?,
            location: ResourceLocation::new(*region, *group),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

/// Observed lifecycle state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    /// Scheduled but not yet running (pending pod).
    Creating,
    Running,
    /// Finished on its own.
    Exited,
    Failed,
    Unknown,
}

impl ResourceState {
    pub fn is_alive(&self) -> bool {
        matches!(self, ResourceState::Creating | ResourceState::Running)
    }
}

/// A resource as reported by its backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub state: ResourceState,
    /// Reachable address, once the backend has assigned one.
    pub host: Option<String>,
    pub port: Option<u16>,
    pub created_at: DateTime<Utc>,
}

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    pub location: ResourceLocation,
    /// Unique name for the resource (pod name; process label).
    pub name: String,
    pub env: BTreeMap<String, String>,
    pub heap_min_mb: Option<u32>,
    pub heap_max_mb: Option<u32>,
    /// Port the resource listens on; chosen by the backend when absent.
    pub port: Option<u16>,
    /// Container image override for pod backends.
    pub image: Option<String>,
}

impl ResourceSpec {
    pub fn new(kind: ResourceKind, location: ResourceLocation, name: impl Into<String>) -> Self {
        Self {
            kind,
            location,
            name: name.into(),
            env: BTreeMap::new(),
            heap_min_mb: None,
            heap_max_mb: None,
            port: None,
            image: None,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_envs(mut self, envs: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(envs);
        self
    }

    pub fn with_heap(mut self, min_mb: u32, max_mb: u32) -> Self {
        self.heap_min_mb = Some(min_mb);
        self.heap_max_mb = Some(max_mb);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// Creates, inspects and destroys resources of one kind.
#[async_trait]
pub trait ResourceOperator: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Create a resource and return it as first observed.
    async fn create(&self, spec: &ResourceSpec) -> Result<Resource>;

    /// Look a resource up. `Ok(None)` means it no longer exists.
    async fn get(&self, id: &ResourceId) -> Result<Option<Resource>>;

    /// Destroy a resource. Destroying one that is already gone succeeds.
    async fn delete(&self, id: &ResourceId) -> Result<()>;
}

/// Produces operators for the kinds it supports.
#[async_trait]
pub trait ResourceOperatorBuilder: Send + Sync {
    /// Builder name for logs (e.g., "process", "k8s").
    fn name(&self) -> &'static str;

    /// One-time setup of backend clients.
    ///
    /// Runs before the registry is queried. A failure leaves the builder
    /// unsupported; it must not panic.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Whether this builder can currently produce an operator for `kind`.
    fn supports(&self, kind: ResourceKind) -> bool;

    /// Build an operator bound to `location`.
    fn build(&self, location: &ResourceLocation) -> Result<Arc<dyn ResourceOperator>>;
}
