// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable allocator runtime.
//!
//! ```rust,ignore
//! let runtime = AllocatorRuntime::builder()
//!     .store(store)
//!     .strategy(strategy)
//!     .build()?
//!     .start();
//!
//! let allocator = runtime.facade();
//! allocator.submit_allocate_request("scheduler", job, location).await?;
//!
//! runtime.shutdown().await;
//! ```

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::allocator::{AllocatorConfig, ResourceAllocator};
use crate::facade::SupervisorAgentAllocator;
use crate::store::AllocationStore;
use crate::strategy::ResourceManageStrategy;
use crate::sweeper::{AllocationSweeper, CleanupWorker, CleanupWorkerConfig, SweeperConfig};

/// Error returned when a required builder field is missing.
#[derive(Debug, thiserror::Error)]
#[error("missing required field: {0}")]
pub struct MissingField(pub &'static str);

/// Builder for an [`AllocatorRuntime`].
#[derive(Default)]
pub struct AllocatorRuntimeBuilder {
    store: Option<Arc<dyn AllocationStore>>,
    strategy: Option<Arc<dyn ResourceManageStrategy>>,
    allocator_config: AllocatorConfig,
    sweeper_config: SweeperConfig,
    cleanup_config: CleanupWorkerConfig,
}

impl AllocatorRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the allocation store (required).
    pub fn store(mut self, store: Arc<dyn AllocationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the resource management strategy (required).
    pub fn strategy(mut self, strategy: Arc<dyn ResourceManageStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn allocator_config(mut self, config: AllocatorConfig) -> Self {
        self.allocator_config = config;
        self
    }

    pub fn sweeper_config(mut self, config: SweeperConfig) -> Self {
        self.sweeper_config = config;
        self
    }

    pub fn cleanup_config(mut self, config: CleanupWorkerConfig) -> Self {
        self.cleanup_config = config;
        self
    }

    pub fn build(self) -> Result<AllocatorRuntimeConfig, MissingField> {
        Ok(AllocatorRuntimeConfig {
            store: self.store.ok_or(MissingField("store"))?,
            strategy: self.strategy.ok_or(MissingField("strategy"))?,
            allocator_config: self.allocator_config,
            sweeper_config: self.sweeper_config,
            cleanup_config: self.cleanup_config,
        })
    }
}

/// Validated runtime configuration.
pub struct AllocatorRuntimeConfig {
    store: Arc<dyn AllocationStore>,
    strategy: Arc<dyn ResourceManageStrategy>,
    allocator_config: AllocatorConfig,
    sweeper_config: SweeperConfig,
    cleanup_config: CleanupWorkerConfig,
}

impl AllocatorRuntimeConfig {
    /// Spawn the sweeper and the cleanup worker.
    pub fn start(self) -> AllocatorRuntime {
        let allocator = Arc::new(ResourceAllocator::new(
            self.store.clone(),
            self.strategy.clone(),
            self.allocator_config,
        ));

        let sweeper = AllocationSweeper::new(allocator.clone(), self.sweeper_config);
        let trigger = sweeper.trigger_handle();
        let sweeper_shutdown = sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(async move {
            sweeper.run().await;
        });

        let cleanup = CleanupWorker::new(self.store.clone(), self.strategy, self.cleanup_config);
        let cleanup_shutdown = cleanup.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move {
            cleanup.run().await;
        });

        info!("AllocatorRuntime started");

        AllocatorRuntime {
            facade: SupervisorAgentAllocator::new(self.store).with_trigger(trigger.clone()),
            allocator,
            trigger,
            sweeper_handle,
            cleanup_handle,
            sweeper_shutdown,
            cleanup_shutdown,
        }
    }
}

/// A running allocator.
pub struct AllocatorRuntime {
    facade: SupervisorAgentAllocator,
    allocator: Arc<ResourceAllocator>,
    trigger: Arc<Notify>,
    sweeper_handle: JoinHandle<()>,
    cleanup_handle: JoinHandle<()>,
    sweeper_shutdown: Arc<Notify>,
    cleanup_shutdown: Arc<Notify>,
}

impl AllocatorRuntime {
    pub fn builder() -> AllocatorRuntimeBuilder {
        AllocatorRuntimeBuilder::new()
    }

    /// Façade wired to wake the sweeper on every request.
    pub fn facade(&self) -> SupervisorAgentAllocator {
        self.facade.clone()
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    /// Request a sweep without waiting for the next tick.
    pub fn trigger_sweep(&self) {
        self.trigger.notify_one();
    }

    pub fn is_running(&self) -> bool {
        !self.sweeper_handle.is_finished() && !self.cleanup_handle.is_finished()
    }

    /// Stop both workers and wait for them.
    pub async fn shutdown(self) {
        info!("AllocatorRuntime shutting down...");

        self.sweeper_shutdown.notify_one();
        self.cleanup_shutdown.notify_one();

        if let Err(e) = self.sweeper_handle.await {
            error!("Allocation sweeper task panicked: {}", e);
        }
        if let Err(e) = self.cleanup_handle.await {
            error!("Cleanup worker task panicked: {}", e);
        }

        info!("AllocatorRuntime shutdown complete");
    }
}
