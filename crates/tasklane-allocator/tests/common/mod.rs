// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for allocator integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tasklane_allocator::{
    AllocationRecord, AllocationStore, AllocatorConfig, NewSupervisorEndpoint,
    OperatorResourceManageStrategy, ResourceAllocator, SqliteAllocationStore, StrategyConfig,
    SupervisorAgentAllocator, SupervisorEndpointRecord, SupervisorProbe,
};
use tasklane_protocol::{JobIdentity, SupervisorEndpoint};
use tasklane_resource::{
    MockResourceOperator, MockResourceOperatorBuilder, ResourceKind, ResourceLocation,
    ResourceManager, ResourceOperatorBuilder,
};

/// Probe answering with a switchable flag.
pub struct MockProbe {
    alive: AtomicBool,
    calls: AtomicUsize,
}

impl MockProbe {
    pub fn new(alive: bool) -> Self {
        Self {
            alive: AtomicBool::new(alive),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SupervisorProbe for MockProbe {
    async fn is_alive(&self, _endpoint: &SupervisorEndpoint) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.alive.load(Ordering::SeqCst)
    }
}

pub fn location() -> ResourceLocation {
    ResourceLocation::new("eu-west", "default")
}

/// Allocator settings whose timeout never fires during a test.
pub fn patient() -> AllocatorConfig {
    AllocatorConfig::default()
}

/// Allocator settings under which every record is already past its timeout.
pub fn expired() -> AllocatorConfig {
    AllocatorConfig {
        allocate_timeout: Duration::ZERO,
        ..Default::default()
    }
}

/// In-memory store, mock pod backend and mock probe wired into the
/// operator strategy.
pub struct Harness {
    pub store: Arc<SqliteAllocationStore>,
    pub operator: Arc<MockResourceOperator>,
    pub probe: Arc<MockProbe>,
    pub strategy: Arc<OperatorResourceManageStrategy>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_strategy_config(StrategyConfig::default()).await
    }

    pub async fn with_strategy_config(config: StrategyConfig) -> Self {
        let store = Arc::new(SqliteAllocationStore::in_memory().await.unwrap());
        let operator = Arc::new(MockResourceOperator::new(ResourceKind::Pod));
        let builder: Arc<dyn ResourceOperatorBuilder> = Arc::new(MockResourceOperatorBuilder::new(
            ResourceKind::Pod,
            operator.clone(),
        ));
        let manager = Arc::new(ResourceManager::new(vec![builder]));
        let probe = Arc::new(MockProbe::new(true));
        let strategy = Arc::new(OperatorResourceManageStrategy::new(
            store.clone(),
            manager,
            probe.clone(),
            config,
        ));

        Self {
            store,
            operator,
            probe,
            strategy,
        }
    }

    pub fn store(&self) -> Arc<dyn AllocationStore> {
        self.store.clone()
    }

    pub fn allocator(&self, config: AllocatorConfig) -> ResourceAllocator {
        ResourceAllocator::new(self.store.clone(), self.strategy.clone(), config)
    }

    pub fn facade(&self) -> SupervisorAgentAllocator {
        SupervisorAgentAllocator::new(self.store.clone())
    }

    /// File a request for job `id` at [`location`].
    pub async fn submit(&self, id: i64) -> JobIdentity {
        let job = JobIdentity::new(id);
        self.facade()
            .submit_allocate_request("test-scheduler", job, location())
            .await
            .unwrap();
        job
    }

    /// Register a pre-provisioned `AVAILABLE` supervisor.
    pub async fn register_supervisor(&self, host: &str) -> SupervisorEndpointRecord {
        self.store
            .insert_endpoint(&NewSupervisorEndpoint::available(host, 9100, location()))
            .await
            .unwrap()
    }

    pub async fn record(&self, job: JobIdentity) -> AllocationRecord {
        self.store.get_allocation(job).await.unwrap().unwrap()
    }

    pub async fn endpoint(&self, id: i64) -> SupervisorEndpointRecord {
        self.store.get_endpoint(id).await.unwrap().unwrap()
    }

    pub async fn loads(&self, endpoint_id: i64) -> i64 {
        self.endpoint(endpoint_id).await.loads
    }
}
