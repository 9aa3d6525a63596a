// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock operator for testing.
//!
//! Keeps resources in memory and counts calls, so allocator and supervisor
//! tests can run without processes or a cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{ResourceError, Result};
use crate::traits::{
    Resource, ResourceId, ResourceKind, ResourceLocation, ResourceOperator,
    ResourceOperatorBuilder, ResourceSpec, ResourceState,
};

/// In-memory [`ResourceOperator`].
pub struct MockResourceOperator {
    kind: ResourceKind,
    resources: Arc<Mutex<HashMap<String, Resource>>>,
    next_id: AtomicU64,
    creates: AtomicUsize,
    deletes: AtomicUsize,
    fail_create: AtomicBool,
    /// Host reported for created resources.
    pub host: String,
    /// Port reported for created resources.
    pub port: u16,
}

impl MockResourceOperator {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            resources: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            host: "127.0.0.1".to_string(),
            port: 9100,
        }
    }

    /// Create a mock whose `create` always fails.
    pub fn failing(kind: ResourceKind) -> Self {
        let mock = Self::new(kind);
        mock.fail_create.store(true, Ordering::SeqCst);
        mock
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_create.store(failing, Ordering::SeqCst);
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Number of resources currently alive.
    pub async fn live_count(&self) -> usize {
        self.resources
            .lock()
            .await
            .values()
            .filter(|r| r.state.is_alive())
            .count()
    }

    /// Force the state of a resource, e.g. to simulate a crash.
    pub async fn set_state(&self, id: &ResourceId, state: ResourceState) -> bool {
        match self.resources.lock().await.get_mut(&id.name) {
            Some(resource) => {
                resource.state = state;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ResourceOperator for MockResourceOperator {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<Resource> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ResourceError::CreateFailed("mock failure".to_string()));
        }

        let name = format!("{}-{}", spec.name, self.next_id.fetch_add(1, Ordering::SeqCst));
        let resource = Resource {
            id: ResourceId::new(self.kind, spec.location.clone(), "mock", name.clone()),
            state: ResourceState::Running,
            host: Some(self.host.clone()),
            port: Some(spec.port.unwrap_or(self.port)),
            created_at: Utc::now(),
        };
        self.resources.lock().await.insert(name, resource.clone());
        Ok(resource)
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<Resource>> {
        Ok(self.resources.lock().await.get(&id.name).cloned())
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.resources.lock().await.remove(&id.name);
        Ok(())
    }
}

/// Builder handing out one shared [`MockResourceOperator`].
pub struct MockResourceOperatorBuilder {
    kind: ResourceKind,
    operator: Arc<MockResourceOperator>,
    builds: AtomicUsize,
}

impl MockResourceOperatorBuilder {
    pub fn new(kind: ResourceKind, operator: Arc<MockResourceOperator>) -> Self {
        Self {
            kind,
            operator,
            builds: AtomicUsize::new(0),
        }
    }

    pub fn operator(&self) -> &Arc<MockResourceOperator> {
        &self.operator
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceOperatorBuilder for MockResourceOperatorBuilder {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports(&self, kind: ResourceKind) -> bool {
        kind == self.kind
    }

    fn build(&self, _location: &ResourceLocation) -> Result<Arc<dyn ResourceOperator>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(self.operator.clone())
    }
}
