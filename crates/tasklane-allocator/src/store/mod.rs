// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence of allocation records and supervisor endpoints.
//!
//! Every state transition is a compare-and-set on the current state and
//! reports whether it applied. Load bookkeeping on `supervisor_endpoint`
//! happens in the same transaction as the allocation change it belongs to.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresAllocationStore;
pub use self::sqlite::SqliteAllocationStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tasklane_protocol::{JobIdentity, SupervisorEndpoint};
use tasklane_resource::ResourceLocation;

use crate::error::StoreError;
use crate::model::{
    AllocateState, AllocationRecord, BindOutcome, EndpointStatus, LoadReservation,
    NewSupervisorEndpoint, SupervisorEndpointRecord, UsageState,
};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage for the allocation state machine.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Persist a new record. Fails with [`StoreError::Duplicate`] if the task
    /// id is taken.
    async fn insert_allocation(&self, record: &AllocationRecord) -> StoreResult<()>;

    async fn get_allocation(&self, task_id: JobIdentity) -> StoreResult<Option<AllocationRecord>>;

    /// Records in `PREPARING` or `CREATING_RESOURCE`, oldest update first.
    async fn list_pending_allocations(&self, limit: i64) -> StoreResult<Vec<AllocationRecord>>;

    /// Bind `task_id` to `endpoint` and move it to `AVAILABLE`.
    ///
    /// Applies only while the record is in `expected` and not `RELEASED`.
    /// With [`LoadReservation::Reserve`] the endpoint must be `AVAILABLE`
    /// and below the limit, and its load is incremented in the same
    /// transaction.
    async fn bind_endpoint(
        &self,
        task_id: JobIdentity,
        expected: AllocateState,
        endpoint: &SupervisorEndpointRecord,
        reservation: LoadReservation,
    ) -> StoreResult<BindOutcome>;

    /// `PREPARING -> CREATING_RESOURCE`, reserving one load on `endpoint_id`.
    async fn mark_creating_resource(
        &self,
        task_id: JobIdentity,
        endpoint_id: i64,
    ) -> StoreResult<bool>;

    /// Move a record in `expected` to `FAILED`. With `release_load` the
    /// reservation held on `supervisor_endpoint_ref` is returned.
    async fn fail_allocation(
        &self,
        task_id: JobIdentity,
        expected: AllocateState,
        release_load: bool,
    ) -> StoreResult<bool>;

    /// Compare-and-set on the usage state.
    async fn mark_usage(
        &self,
        task_id: JobIdentity,
        from: UsageState,
        to: UsageState,
    ) -> StoreResult<bool>;

    /// Mark the record `RELEASED`. The load held by an `AVAILABLE` record is
    /// returned exactly once. Returns whether this call released it.
    async fn release_allocation(&self, task_id: JobIdentity) -> StoreResult<bool>;

    /// Drop `RELEASED` records whose last update is older than `older_than`.
    async fn purge_released_allocations(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    async fn insert_endpoint(
        &self,
        endpoint: &NewSupervisorEndpoint,
    ) -> StoreResult<SupervisorEndpointRecord>;

    async fn get_endpoint(&self, id: i64) -> StoreResult<Option<SupervisorEndpointRecord>>;

    /// `AVAILABLE` endpoints at `location`, ordered by load then id.
    async fn list_available_endpoints(
        &self,
        location: &ResourceLocation,
    ) -> StoreResult<Vec<SupervisorEndpointRecord>>;

    async fn list_endpoints(
        &self,
        status: Option<EndpointStatus>,
    ) -> StoreResult<Vec<SupervisorEndpointRecord>>;

    async fn update_endpoint_status(&self, id: i64, status: EndpointStatus) -> StoreResult<bool>;

    /// Record the address a created supervisor was scheduled at.
    async fn set_endpoint_address(&self, id: i64, host: &str, port: u16) -> StoreResult<bool>;

    /// Count a failed probe and return the consecutive failure count.
    async fn record_probe_failure(&self, id: i64) -> StoreResult<i64>;

    async fn reset_probe_failures(&self, id: i64) -> StoreResult<()>;

    /// Mark an endpoint `ABANDONED` if it carries no load.
    async fn abandon_idle_endpoint(&self, id: i64) -> StoreResult<bool>;

    /// Delete `ABANDONED` endpoints. Records referencing them keep their
    /// stored address.
    async fn purge_abandoned_endpoints(&self) -> StoreResult<u64>;
}

/// Connect to `url` and run the migrations. `postgres://` and `sqlite:`
/// URLs are accepted. `lock_timeout` bounds PostgreSQL row-lock waits.
pub async fn connect(url: &str, lock_timeout: Duration) -> StoreResult<Arc<dyn AllocationStore>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        crate::migrations::run_postgres(&pool).await?;
        Ok(Arc::new(
            PostgresAllocationStore::new(pool).with_lock_timeout(lock_timeout),
        ))
    } else if url.starts_with("sqlite:") {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        crate::migrations::run_sqlite(&pool).await?;
        Ok(Arc::new(SqliteAllocationStore::new(pool)))
    } else {
        Err(StoreError::UnsupportedUrl(url.to_string()))
    }
}

/// Row shape of `resource_allocation`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct AllocationRow {
    pub task_id: i64,
    pub resource_region: String,
    pub resource_group: String,
    pub resource_applier_name: String,
    pub allocate_state: String,
    pub usage_state: String,
    pub supervisor_endpoint: Option<String>,
    pub supervisor_endpoint_ref: Option<i64>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl TryFrom<AllocationRow> for AllocationRecord {
    type Error = StoreError;

    fn try_from(row: AllocationRow) -> Result<Self, Self::Error> {
        let supervisor_endpoint = row
            .supervisor_endpoint
            .as_deref()
            .map(serde_json::from_str::<SupervisorEndpoint>)
            .transpose()
            .map_err(|e| {
                StoreError::Corrupt(format!("supervisor_endpoint of task {}: {e}", row.task_id))
            })?;

        Ok(AllocationRecord {
            task_id: JobIdentity::new(row.task_id),
            location: ResourceLocation::new(row.resource_region, row.resource_group),
            owner_tag: row.resource_applier_name,
            allocate_state: row.allocate_state.parse()?,
            usage_state: row.usage_state.parse()?,
            supervisor_endpoint,
            supervisor_endpoint_ref: row.supervisor_endpoint_ref,
            create_time: row.create_time,
            update_time: row.update_time,
        })
    }
}

/// Row shape of `supervisor_endpoint`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct EndpointRow {
    pub id: i64,
    pub host: String,
    pub port: i64,
    pub status: String,
    pub resource_region: String,
    pub resource_group: String,
    pub resource_id: Option<String>,
    pub loads: i64,
    pub probe_failures: i64,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl TryFrom<EndpointRow> for SupervisorEndpointRecord {
    type Error = StoreError;

    fn try_from(row: EndpointRow) -> Result<Self, Self::Error> {
        let port = u16::try_from(row.port)
            .map_err(|_| StoreError::Corrupt(format!("port {} of endpoint {}", row.port, row.id)))?;

        Ok(SupervisorEndpointRecord {
            id: row.id,
            host: row.host,
            port,
            status: row.status.parse()?,
            location: ResourceLocation::new(row.resource_region, row.resource_group),
            resource_id: row.resource_id,
            loads: row.loads,
            probe_failures: row.probe_failures,
            create_time: row.create_time,
            update_time: row.update_time,
        })
    }
}

pub(crate) fn collect<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

pub(crate) fn encode_endpoint(endpoint: &SupervisorEndpoint) -> StoreResult<String> {
    serde_json::to_string(endpoint)
        .map_err(|e| StoreError::Corrupt(format!("cannot encode endpoint {endpoint}: {e}")))
}
