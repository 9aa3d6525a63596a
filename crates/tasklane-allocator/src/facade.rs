// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Allocation request façade used by job producers.
//!
//! Producers submit a request, then poll [`SupervisorAgentAllocator::check_allocation_state`]
//! (or block in [`SupervisorAgentAllocator::wait_for_endpoint`]) until a
//! supervisor is bound, and release it when the job is done.

use std::sync::Arc;
use std::time::Duration;

use tasklane_protocol::{JobIdentity, SupervisorEndpoint};
use tasklane_resource::ResourceLocation;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{AllocationError, Result};
use crate::model::{AllocateState, AllocationRecord, UsageState};
use crate::store::AllocationStore;

/// Entry point for requesting and releasing supervisors.
#[derive(Clone)]
pub struct SupervisorAgentAllocator {
    store: Arc<dyn AllocationStore>,
    trigger: Option<Arc<Notify>>,
}

impl SupervisorAgentAllocator {
    pub fn new(store: Arc<dyn AllocationStore>) -> Self {
        Self {
            store,
            trigger: None,
        }
    }

    /// Wake this notifier whenever a request is submitted (usually the
    /// sweeper's trigger).
    pub fn with_trigger(mut self, trigger: Arc<Notify>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Persist a `PREPARING` allocation for `job` and return immediately.
    pub async fn submit_allocate_request(
        &self,
        owner_tag: &str,
        job: JobIdentity,
        location: ResourceLocation,
    ) -> Result<()> {
        let record = AllocationRecord::new(job, location, owner_tag);
        self.store.insert_allocation(&record).await?;

        info!(job_id = %job, owner = owner_tag, location = %record.location, "Allocation requested");
        if let Some(trigger) = &self.trigger {
            trigger.notify_one();
        }
        Ok(())
    }

    /// The bound supervisor once the allocation is `AVAILABLE`, `None` while
    /// it is still in progress.
    ///
    /// The first successful call moves the usage state to `USING`.
    pub async fn check_allocation_state(
        &self,
        job: JobIdentity,
    ) -> Result<Option<SupervisorEndpoint>> {
        let record = self
            .store
            .get_allocation(job)
            .await?
            .ok_or(AllocationError::NotFound(job))?;

        match record.allocate_state {
            AllocateState::Available => {
                if self
                    .store
                    .mark_usage(job, UsageState::Preparing, UsageState::Using)
                    .await?
                {
                    debug!(job_id = %job, "Allocation in use");
                }
                Ok(record.supervisor_endpoint)
            }
            AllocateState::Failed => Err(AllocationError::AllocationFailed(job)),
            AllocateState::Preparing | AllocateState::CreatingResource => Ok(None),
        }
    }

    /// Poll [`check_allocation_state`](Self::check_allocation_state) every
    /// `interval` until an endpoint is bound or `deadline` passes.
    pub async fn wait_for_endpoint(
        &self,
        job: JobIdentity,
        deadline: Instant,
        interval: Duration,
    ) -> Result<SupervisorEndpoint> {
        loop {
            if let Some(endpoint) = self.check_allocation_state(job).await? {
                return Ok(endpoint);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AllocationError::WaitTimeout(job));
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    /// Release the supervisor held by `job`. Repeated calls are no-ops.
    pub async fn deallocate_supervisor_endpoint(&self, job: JobIdentity) -> Result<()> {
        if self.store.release_allocation(job).await? {
            info!(job_id = %job, "Allocation released");
            if let Some(trigger) = &self.trigger {
                trigger.notify_one();
            }
            return Ok(());
        }

        match self.store.get_allocation(job).await? {
            Some(_) => Ok(()),
            None => Err(AllocationError::NotFound(job)),
        }
    }

    pub async fn query_allocation(&self, job: JobIdentity) -> Result<Option<AllocationRecord>> {
        Ok(self.store.get_allocation(job).await?)
    }
}
