// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed allocation store.
//!
//! Transitions lock the allocation row with `SELECT ... FOR UPDATE` under a
//! transaction-local `lock_timeout`, so a transition blocked behind another
//! one fails with [`StoreError::LockTimeout`] instead of waiting forever.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tasklane_protocol::JobIdentity;
use tasklane_resource::ResourceLocation;

use super::{
    AllocationRow, AllocationStore, EndpointRow, StoreResult, collect, encode_endpoint,
};
use crate::error::StoreError;
use crate::model::{
    AllocateState, AllocationRecord, BindOutcome, EndpointStatus, LoadReservation,
    NewSupervisorEndpoint, SupervisorEndpointRecord, UsageState,
};

/// Default wait for a row lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// PostgreSQL-backed [`AllocationStore`].
#[derive(Clone)]
pub struct PostgresAllocationStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresAllocationStore {
    /// Wrap a pool whose schema is already migrated.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

/// Lock the allocation row and return its state columns.
async fn lock_allocation(
    tx: &mut Transaction<'static, Postgres>,
    task_id: JobIdentity,
) -> StoreResult<Option<(String, String, Option<i64>)>> {
    sqlx::query_as(
        r#"
        SELECT allocate_state, usage_state, supervisor_endpoint_ref
        FROM resource_allocation
        WHERE task_id = $1
        FOR UPDATE
        "#,
    )
    .bind(task_id.get())
    .fetch_optional(&mut **tx)
    .await
    .map_err(StoreError::locking)
}

async fn release_one_load(
    tx: &mut Transaction<'static, Postgres>,
    endpoint_id: i64,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE supervisor_endpoint
        SET loads = CASE WHEN loads > 0 THEN loads - 1 ELSE 0 END, update_time = $2
        WHERE id = $1
        "#,
    )
    .bind(endpoint_id)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(StoreError::locking)?;

    Ok(())
}

#[async_trait]
impl AllocationStore for PostgresAllocationStore {
    async fn insert_allocation(&self, record: &AllocationRecord) -> StoreResult<()> {
        let endpoint = record
            .supervisor_endpoint
            .as_ref()
            .map(encode_endpoint)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO resource_allocation (
                task_id, resource_region, resource_group, resource_applier_name,
                allocate_state, usage_state, supervisor_endpoint, supervisor_endpoint_ref,
                create_time, update_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.task_id.get())
        .bind(&record.location.region)
        .bind(&record.location.group)
        .bind(&record.owner_tag)
        .bind(record.allocate_state.as_str())
        .bind(record.usage_state.as_str())
        .bind(endpoint)
        .bind(record.supervisor_endpoint_ref)
        .bind(record.create_time)
        .bind(record.update_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::classify(e, record.task_id))?;

        Ok(())
    }

    async fn get_allocation(&self, task_id: JobIdentity) -> StoreResult<Option<AllocationRecord>> {
        let row = sqlx::query_as::<_, AllocationRow>(
            r#"
            SELECT task_id, resource_region, resource_group, resource_applier_name,
                   allocate_state, usage_state, supervisor_endpoint, supervisor_endpoint_ref,
                   create_time, update_time
            FROM resource_allocation
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.get())
        .fetch_optional(&self.pool)
        .await?;

        row.map(AllocationRecord::try_from).transpose()
    }

    async fn list_pending_allocations(&self, limit: i64) -> StoreResult<Vec<AllocationRecord>> {
        let rows = sqlx::query_as::<_, AllocationRow>(
            r#"
            SELECT task_id, resource_region, resource_group, resource_applier_name,
                   allocate_state, usage_state, supervisor_endpoint, supervisor_endpoint_ref,
                   create_time, update_time
            FROM resource_allocation
            WHERE allocate_state IN ('PREPARING', 'CREATING_RESOURCE')
            ORDER BY update_time ASC, task_id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn bind_endpoint(
        &self,
        task_id: JobIdentity,
        expected: AllocateState,
        endpoint: &SupervisorEndpointRecord,
        reservation: LoadReservation,
    ) -> StoreResult<BindOutcome> {
        let encoded = encode_endpoint(&endpoint.endpoint())?;
        let now = Utc::now();
        let mut tx = self.begin().await?;

        match lock_allocation(&mut tx, task_id).await? {
            Some((state, usage, _))
                if state == expected.as_str() && usage != UsageState::Released.as_str() => {}
            _ => return Ok(BindOutcome::RecordChanged),
        }

        if let LoadReservation::Reserve { limit } = reservation {
            let reserved = sqlx::query(
                r#"
                UPDATE supervisor_endpoint
                SET loads = loads + 1, update_time = $2
                WHERE id = $1 AND status = 'AVAILABLE' AND ($3::BIGINT IS NULL OR loads < $3)
                "#,
            )
            .bind(endpoint.id)
            .bind(now)
            .bind(limit)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::locking)?;

            if reserved.rows_affected() == 0 {
                return Ok(BindOutcome::EndpointRejected);
            }
        }

        sqlx::query(
            r#"
            UPDATE resource_allocation
            SET allocate_state = 'AVAILABLE', supervisor_endpoint = $2,
                supervisor_endpoint_ref = $3, update_time = $4
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.get())
        .bind(&encoded)
        .bind(endpoint.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(BindOutcome::Bound)
    }

    async fn mark_creating_resource(
        &self,
        task_id: JobIdentity,
        endpoint_id: i64,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        match lock_allocation(&mut tx, task_id).await? {
            Some((state, usage, _))
                if state == AllocateState::Preparing.as_str()
                    && usage != UsageState::Released.as_str() => {}
            _ => return Ok(false),
        }

        sqlx::query(
            r#"
            UPDATE resource_allocation
            SET allocate_state = 'CREATING_RESOURCE', supervisor_endpoint_ref = $2, update_time = $3
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.get())
        .bind(endpoint_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE supervisor_endpoint SET loads = loads + 1, update_time = $2 WHERE id = $1")
            .bind(endpoint_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::locking)?;

        tx.commit().await?;
        Ok(true)
    }

    async fn fail_allocation(
        &self,
        task_id: JobIdentity,
        expected: AllocateState,
        release_load: bool,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let endpoint_ref = match lock_allocation(&mut tx, task_id).await? {
            Some((state, _, endpoint_ref)) if state == expected.as_str() => endpoint_ref,
            _ => return Ok(false),
        };

        sqlx::query(
            r#"
            UPDATE resource_allocation
            SET allocate_state = 'FAILED', supervisor_endpoint = NULL, update_time = $2
            WHERE task_id = $1
            "#,
        )
        .bind(task_id.get())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if release_load && let Some(endpoint_id) = endpoint_ref {
            release_one_load(&mut tx, endpoint_id, now).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn mark_usage(
        &self,
        task_id: JobIdentity,
        from: UsageState,
        to: UsageState,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE resource_allocation
            SET usage_state = $3, update_time = $4
            WHERE task_id = $1 AND usage_state = $2
            "#,
        )
        .bind(task_id.get())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_allocation(&self, task_id: JobIdentity) -> StoreResult<bool> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let (allocate_state, endpoint_ref) = match lock_allocation(&mut tx, task_id).await? {
            Some((state, usage, endpoint_ref)) if usage != UsageState::Released.as_str() => {
                (state.parse::<AllocateState>()?, endpoint_ref)
            }
            _ => return Ok(false),
        };

        sqlx::query(
            "UPDATE resource_allocation SET usage_state = 'RELEASED', update_time = $2 WHERE task_id = $1",
        )
        .bind(task_id.get())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if allocate_state == AllocateState::Available
            && let Some(endpoint_id) = endpoint_ref
        {
            release_one_load(&mut tx, endpoint_id, now).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn purge_released_allocations(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM resource_allocation WHERE usage_state = 'RELEASED' AND update_time < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn insert_endpoint(
        &self,
        endpoint: &NewSupervisorEndpoint,
    ) -> StoreResult<SupervisorEndpointRecord> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, EndpointRow>(
            r#"
            INSERT INTO supervisor_endpoint (
                host, port, status, resource_region, resource_group, resource_id,
                loads, probe_failures, create_time, update_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, 0, 0, $7, $7)
            RETURNING id, host, port, status, resource_region, resource_group, resource_id,
                      loads, probe_failures, create_time, update_time
            "#,
        )
        .bind(&endpoint.host)
        .bind(i64::from(endpoint.port))
        .bind(endpoint.status.as_str())
        .bind(&endpoint.location.region)
        .bind(&endpoint.location.group)
        .bind(&endpoint.resource_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_endpoint(&self, id: i64) -> StoreResult<Option<SupervisorEndpointRecord>> {
        let row = sqlx::query_as::<_, EndpointRow>(
            r#"
            SELECT id, host, port, status, resource_region, resource_group, resource_id,
                   loads, probe_failures, create_time, update_time
            FROM supervisor_endpoint
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SupervisorEndpointRecord::try_from).transpose()
    }

    async fn list_available_endpoints(
        &self,
        location: &ResourceLocation,
    ) -> StoreResult<Vec<SupervisorEndpointRecord>> {
        let rows = sqlx::query_as::<_, EndpointRow>(
            r#"
            SELECT id, host, port, status, resource_region, resource_group, resource_id,
                   loads, probe_failures, create_time, update_time
            FROM supervisor_endpoint
            WHERE resource_region = $1 AND resource_group = $2 AND status = 'AVAILABLE'
            ORDER BY loads ASC, id ASC
            "#,
        )
        .bind(&location.region)
        .bind(&location.group)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn list_endpoints(
        &self,
        status: Option<EndpointStatus>,
    ) -> StoreResult<Vec<SupervisorEndpointRecord>> {
        let rows = sqlx::query_as::<_, EndpointRow>(
            r#"
            SELECT id, host, port, status, resource_region, resource_group, resource_id,
                   loads, probe_failures, create_time, update_time
            FROM supervisor_endpoint
            WHERE $1::TEXT IS NULL OR status = $1
            ORDER BY id ASC
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn update_endpoint_status(&self, id: i64, status: EndpointStatus) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE supervisor_endpoint SET status = $2, update_time = $3 WHERE id = $1 AND status <> $2",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_endpoint_address(&self, id: i64, host: &str, port: u16) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE supervisor_endpoint SET host = $2, port = $3, update_time = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(host)
        .bind(i64::from(port))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_probe_failure(&self, id: i64) -> StoreResult<i64> {
        let failures: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE supervisor_endpoint
            SET probe_failures = probe_failures + 1
            WHERE id = $1
            RETURNING probe_failures
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(failures.unwrap_or(0))
    }

    async fn reset_probe_failures(&self, id: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE supervisor_endpoint SET probe_failures = 0 WHERE id = $1 AND probe_failures <> 0",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn abandon_idle_endpoint(&self, id: i64) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE supervisor_endpoint
            SET status = 'ABANDONED', update_time = $2
            WHERE id = $1 AND loads = 0 AND status <> 'ABANDONED'
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_abandoned_endpoints(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM supervisor_endpoint WHERE status = 'ABANDONED'")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
