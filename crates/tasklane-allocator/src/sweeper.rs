// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background workers driving the allocation state machine.
//!
//! [`AllocationSweeper`] advances pending records on a fixed interval and
//! whenever its trigger is notified. [`CleanupWorker`] purges released
//! records and reclaims idle supervisors.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::allocator::{ResourceAllocator, SweepReport};
use crate::error::{AllocationError, Result};
use crate::model::EndpointStatus;
use crate::store::AllocationStore;
use crate::strategy::ResourceManageStrategy;

/// Configuration for the allocation sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub poll_interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Periodically runs [`ResourceAllocator::sweep`].
pub struct AllocationSweeper {
    allocator: Arc<ResourceAllocator>,
    config: SweeperConfig,
    trigger: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl AllocationSweeper {
    pub fn new(allocator: Arc<ResourceAllocator>, config: SweeperConfig) -> Self {
        Self {
            allocator,
            config,
            trigger: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Notify this to run a sweep without waiting for the next tick.
    pub fn trigger_handle(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Allocation sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Allocation sweeper received shutdown signal");
                    break;
                }

                _ = self.trigger.notified() => self.sweep_once().await,

                _ = tokio::time::sleep(self.config.poll_interval) => self.sweep_once().await,
            }
        }

        info!("Allocation sweeper stopped");
    }

    async fn sweep_once(&self) {
        match self.allocator.sweep().await {
            Ok(report) if report == SweepReport::default() => {}
            Ok(report) => debug!(?report, "Allocation sweep finished"),
            Err(e) => error!(error = %e, "Allocation sweep failed"),
        }
    }
}

/// Configuration for the cleanup worker.
#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub poll_interval: Duration,
    /// How long `RELEASED` allocation records are kept.
    pub released_retention: Duration,
    /// Supervisors without load for this long are reclaimed.
    pub idle_timeout: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            released_retention: Duration::from_secs(24 * 3600),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Counts from one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub purged_allocations: u64,
    pub released_endpoints: usize,
    pub purged_endpoints: u64,
}

/// Background worker reclaiming released records and idle supervisors.
pub struct CleanupWorker {
    store: Arc<dyn AllocationStore>,
    strategy: Arc<dyn ResourceManageStrategy>,
    config: CleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl CleanupWorker {
    pub fn new(
        store: Arc<dyn AllocationStore>,
        strategy: Arc<dyn ResourceManageStrategy>,
        config: CleanupWorkerConfig,
    ) -> Self {
        Self {
            store,
            strategy,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            retention_secs = self.config.released_retention.as_secs(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "Cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.run_once().await {
                        Ok(report) if report == CleanupReport::default() => {}
                        Ok(report) => info!(?report, "Cleanup pass finished"),
                        Err(e) => error!(error = %e, "Cleanup pass failed"),
                    }
                }
            }
        }

        info!("Cleanup worker stopped");
    }

    /// One cleanup pass.
    pub async fn run_once(&self) -> Result<CleanupReport> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(self.config.released_retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention));
        let mut report = CleanupReport::default();
        if let Some(cutoff) = cutoff {
            report.purged_allocations = self.store.purge_released_allocations(cutoff).await?;
        }

        for endpoint in self.store.list_endpoints(None).await? {
            if endpoint.resource_id.is_none() || endpoint.loads > 0 {
                continue;
            }
            let idle = (now - endpoint.update_time)
                .to_std()
                .is_ok_and(|idle| idle >= self.config.idle_timeout);
            let reclaim = match endpoint.status {
                EndpointStatus::Unavailable => true,
                EndpointStatus::Available | EndpointStatus::Preparing => idle,
                EndpointStatus::Abandoned => false,
            };
            if !reclaim {
                continue;
            }

            match self.strategy.release_endpoint(&endpoint).await {
                Ok(true) => report.released_endpoints += 1,
                Ok(false) => debug!(endpoint_id = endpoint.id, "Supervisor picked up load"),
                Err(AllocationError::Resource(e)) => {
                    warn!(endpoint_id = endpoint.id, error = %e, "Could not reclaim supervisor");
                }
                Err(e) => return Err(e),
            }
        }

        report.purged_endpoints = self.store.purge_abandoned_endpoints().await?;
        Ok(report)
    }
}
