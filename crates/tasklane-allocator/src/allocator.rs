// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Allocation state machine.
//!
//! [`ResourceAllocator::allocate`] advances one record by at most one step:
//!
//! ```text
//! PREPARING ──bind existing──────────────► AVAILABLE
//!     │                                        ▲
//!     └─create supervisor─► CREATING_RESOURCE ─┘ (heartbeat answered)
//!
//! any non-terminal ──timeout / released / supervisor lost──► FAILED
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use tasklane_protocol::JobIdentity;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{AllocationError, Result, StoreError};
use crate::model::{AllocateState, AllocationRecord, BindOutcome, LoadReservation, UsageState};
use crate::store::AllocationStore;
use crate::strategy::{EndpointReadiness, ResourceManageStrategy};

/// Tuning for [`ResourceAllocator`].
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Records not updated for this long fail.
    pub allocate_timeout: Duration,
    /// Wait for the per-record guard before giving up with `LockTimeout`.
    pub lock_timeout: Duration,
    /// Records handled per sweep.
    pub sweep_batch: i64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            allocate_timeout: Duration::from_secs(300),
            lock_timeout: Duration::from_secs(3),
            sweep_batch: 100,
        }
    }
}

/// Summary of one [`ResourceAllocator::sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub processed: usize,
    pub available: usize,
    pub creating: usize,
    pub failed: usize,
    pub lock_timeouts: usize,
    pub errors: usize,
}

/// Drives allocation records towards a terminal state.
pub struct ResourceAllocator {
    store: Arc<dyn AllocationStore>,
    strategy: Arc<dyn ResourceManageStrategy>,
    config: AllocatorConfig,
    locks: DashMap<JobIdentity, Arc<Mutex<()>>>,
}

impl ResourceAllocator {
    pub fn new(
        store: Arc<dyn AllocationStore>,
        strategy: Arc<dyn ResourceManageStrategy>,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            store,
            strategy,
            config,
            locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Advance the record of `task_id` by one step and return its state.
    ///
    /// Concurrent calls for the same record queue on an in-process guard;
    /// a caller that cannot take it within the lock timeout gets
    /// [`AllocationError::LockTimeout`].
    pub async fn allocate(&self, task_id: JobIdentity) -> Result<AllocateState> {
        let guard = self
            .locks
            .entry(task_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = match tokio::time::timeout(self.config.lock_timeout, guard.lock()).await {
            Ok(_held) => self.transition(task_id).await.map_err(|e| match e {
                AllocationError::Store(StoreError::LockTimeout) => {
                    AllocationError::LockTimeout(task_id)
                }
                other => other,
            }),
            Err(_) => Err(AllocationError::LockTimeout(task_id)),
        };

        drop(guard);
        self.locks
            .remove_if(&task_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Run [`allocate`](Self::allocate) over a batch of pending records.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let pending = self
            .store
            .list_pending_allocations(self.config.sweep_batch)
            .await?;

        let outcomes = join_all(pending.iter().map(|r| self.allocate(r.task_id))).await;

        let mut report = SweepReport {
            processed: outcomes.len(),
            ..Default::default()
        };
        for (record, outcome) in pending.iter().zip(outcomes) {
            match outcome {
                Ok(AllocateState::Available) => report.available += 1,
                Ok(AllocateState::CreatingResource) => report.creating += 1,
                Ok(AllocateState::Failed) => report.failed += 1,
                Ok(AllocateState::Preparing) => {}
                Err(AllocationError::LockTimeout(_)) => {
                    debug!(job_id = %record.task_id, "Allocation busy, retrying next sweep");
                    report.lock_timeouts += 1;
                }
                Err(e) => {
                    warn!(job_id = %record.task_id, error = %e, "Allocation step failed");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    async fn transition(&self, task_id: JobIdentity) -> Result<AllocateState> {
        let record = self
            .store
            .get_allocation(task_id)
            .await?
            .ok_or(AllocationError::NotFound(task_id))?;

        match record.allocate_state {
            AllocateState::Preparing => self.on_preparing(&record).await,
            AllocateState::CreatingResource => self.on_creating_resource(&record).await,
            terminal => Ok(terminal),
        }
    }

    fn should_fail(&self, record: &AllocationRecord) -> bool {
        record.usage_state == UsageState::Released
            || record.idle_for(Utc::now()) >= self.config.allocate_timeout
    }

    async fn current_state(&self, task_id: JobIdentity) -> Result<AllocateState> {
        self.store
            .get_allocation(task_id)
            .await?
            .map(|r| r.allocate_state)
            .ok_or(AllocationError::NotFound(task_id))
    }

    async fn on_preparing(&self, record: &AllocationRecord) -> Result<AllocateState> {
        let task_id = record.task_id;

        if self.should_fail(record) {
            if self
                .store
                .fail_allocation(task_id, AllocateState::Preparing, false)
                .await?
            {
                info!(
                    job_id = %task_id,
                    usage = %record.usage_state,
                    "Allocation failed before a supervisor was found"
                );
                return Ok(AllocateState::Failed);
            }
            return self.current_state(task_id).await;
        }

        let reservation = LoadReservation::Reserve {
            limit: self.strategy.max_loads(),
        };
        for candidate in self.store.list_available_endpoints(&record.location).await? {
            if !self.strategy.has_capacity(&candidate) {
                continue;
            }
            if !self.strategy.is_alive(&candidate).await? {
                continue;
            }
            match self
                .store
                .bind_endpoint(task_id, AllocateState::Preparing, &candidate, reservation)
                .await?
            {
                BindOutcome::Bound => {
                    info!(
                        job_id = %task_id,
                        endpoint = %candidate.endpoint(),
                        "Allocation bound to existing supervisor"
                    );
                    return Ok(AllocateState::Available);
                }
                BindOutcome::RecordChanged => return self.current_state(task_id).await,
                BindOutcome::EndpointRejected => continue,
            }
        }

        let Some(endpoint) = self.strategy.handle_no_resource_available(record).await? else {
            debug!(job_id = %task_id, location = %record.location, "No supervisor available yet");
            return Ok(AllocateState::Preparing);
        };

        if self.store.mark_creating_resource(task_id, endpoint.id).await? {
            info!(
                job_id = %task_id,
                endpoint_id = endpoint.id,
                "Allocation waiting for new supervisor"
            );
            return Ok(AllocateState::CreatingResource);
        }

        // The record moved on while the supervisor was being created.
        self.strategy.release_endpoint(&endpoint).await?;
        self.current_state(task_id).await
    }

    async fn on_creating_resource(&self, record: &AllocationRecord) -> Result<AllocateState> {
        let task_id = record.task_id;

        if self.should_fail(record) {
            return self.fail_creating(task_id, "timed out or released").await;
        }

        match self.strategy.detect_if_endpoint_is_available(record).await {
            Ok(EndpointReadiness::Ready(endpoint)) => {
                match self
                    .store
                    .bind_endpoint(
                        task_id,
                        AllocateState::CreatingResource,
                        &endpoint,
                        LoadReservation::AlreadyReserved,
                    )
                    .await?
                {
                    BindOutcome::Bound => {
                        info!(
                            job_id = %task_id,
                            endpoint = %endpoint.endpoint(),
                            "Allocation bound to new supervisor"
                        );
                        Ok(AllocateState::Available)
                    }
                    _ => self.current_state(task_id).await,
                }
            }
            Ok(EndpointReadiness::Unavailable) => {
                self.fail_creating(task_id, "supervisor unavailable").await
            }
            Ok(EndpointReadiness::Pending) => Ok(AllocateState::CreatingResource),
            Err(e) => {
                warn!(job_id = %task_id, error = %e, "Could not check supervisor readiness");
                Ok(AllocateState::CreatingResource)
            }
        }
    }

    async fn fail_creating(&self, task_id: JobIdentity, reason: &str) -> Result<AllocateState> {
        if self
            .store
            .fail_allocation(task_id, AllocateState::CreatingResource, true)
            .await?
        {
            warn!(job_id = %task_id, reason, "Allocation failed while creating supervisor");
            return Ok(AllocateState::Failed);
        }
        self.current_state(task_id).await
    }
}
