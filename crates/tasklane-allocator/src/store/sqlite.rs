// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed allocation store.
//!
//! SQLite serializes writers, so the compare-and-set `UPDATE`s inside a
//! transaction are enough; there is no row locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
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

/// SQLite-backed [`AllocationStore`].
#[derive(Clone)]
pub struct SqliteAllocationStore {
    pool: SqlitePool,
}

impl SqliteAllocationStore {
    /// Wrap a pool whose schema is already migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// A private in-memory database with the schema applied.
    ///
    /// The pool holds a single connection that is never recycled, so every
    /// caller sees the same database.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        crate::migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl AllocationStore for SqliteAllocationStore {
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
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
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
            WHERE task_id = ?
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
            LIMIT ?
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
        let mut tx = self.pool.begin().await?;

        let bound = sqlx::query(
            r#"
            UPDATE resource_allocation
            SET allocate_state = 'AVAILABLE', supervisor_endpoint = ?,
                supervisor_endpoint_ref = ?, update_time = ?
            WHERE task_id = ? AND allocate_state = ? AND usage_state <> 'RELEASED'
            "#,
        )
        .bind(&encoded)
        .bind(endpoint.id)
        .bind(now)
        .bind(task_id.get())
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await?;

        if bound.rows_affected() == 0 {
            return Ok(BindOutcome::RecordChanged);
        }

        if let LoadReservation::Reserve { limit } = reservation {
            let reserved = sqlx::query(
                r#"
                UPDATE supervisor_endpoint
                SET loads = loads + 1, update_time = ?
                WHERE id = ? AND status = 'AVAILABLE' AND (? IS NULL OR loads < ?)
                "#,
            )
            .bind(now)
            .bind(endpoint.id)
            .bind(limit)
            .bind(limit)
            .execute(&mut *tx)
            .await?;

            if reserved.rows_affected() == 0 {
                return Ok(BindOutcome::EndpointRejected);
            }
        }

        tx.commit().await?;
        Ok(BindOutcome::Bound)
    }

    async fn mark_creating_resource(
        &self,
        task_id: JobIdentity,
        endpoint_id: i64,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            r#"
            UPDATE resource_allocation
            SET allocate_state = 'CREATING_RESOURCE', supervisor_endpoint_ref = ?, update_time = ?
            WHERE task_id = ? AND allocate_state = 'PREPARING' AND usage_state <> 'RELEASED'
            "#,
        )
        .bind(endpoint_id)
        .bind(now)
        .bind(task_id.get())
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE supervisor_endpoint SET loads = loads + 1, update_time = ? WHERE id = ?")
            .bind(now)
            .bind(endpoint_id)
            .execute(&mut *tx)
            .await?;

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
        let mut tx = self.pool.begin().await?;

        let endpoint_ref: Option<Option<i64>> = sqlx::query_scalar(
            "SELECT supervisor_endpoint_ref FROM resource_allocation WHERE task_id = ? AND allocate_state = ?",
        )
        .bind(task_id.get())
        .bind(expected.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(endpoint_ref) = endpoint_ref else {
            return Ok(false);
        };

        sqlx::query(
            r#"
            UPDATE resource_allocation
            SET allocate_state = 'FAILED', supervisor_endpoint = NULL, update_time = ?
            WHERE task_id = ? AND allocate_state = ?
            "#,
        )
        .bind(now)
        .bind(task_id.get())
        .bind(expected.as_str())
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
            "UPDATE resource_allocation SET usage_state = ?, update_time = ? WHERE task_id = ? AND usage_state = ?",
        )
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(task_id.get())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_allocation(&self, task_id: JobIdentity) -> StoreResult<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let current: Option<(String, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT allocate_state, supervisor_endpoint_ref
            FROM resource_allocation
            WHERE task_id = ? AND usage_state <> 'RELEASED'
            "#,
        )
        .bind(task_id.get())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((allocate_state, endpoint_ref)) = current else {
            return Ok(false);
        };

        sqlx::query(
            "UPDATE resource_allocation SET usage_state = 'RELEASED', update_time = ? WHERE task_id = ?",
        )
        .bind(now)
        .bind(task_id.get())
        .execute(&mut *tx)
        .await?;

        if allocate_state.parse::<AllocateState>()? == AllocateState::Available
            && let Some(endpoint_id) = endpoint_ref
        {
            release_one_load(&mut tx, endpoint_id, now).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn purge_released_allocations(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM resource_allocation WHERE usage_state = 'RELEASED' AND update_time < ?",
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
            VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?)
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
            WHERE id = ?
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
            WHERE resource_region = ? AND resource_group = ? AND status = 'AVAILABLE'
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
            WHERE ? IS NULL OR status = ?
            ORDER BY id ASC
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn update_endpoint_status(&self, id: i64, status: EndpointStatus) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE supervisor_endpoint SET status = ?, update_time = ? WHERE id = ? AND status <> ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_endpoint_address(&self, id: i64, host: &str, port: u16) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE supervisor_endpoint SET host = ?, port = ?, update_time = ? WHERE id = ?",
        )
        .bind(host)
        .bind(i64::from(port))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_probe_failure(&self, id: i64) -> StoreResult<i64> {
        let failures: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE supervisor_endpoint
            SET probe_failures = probe_failures + 1
            WHERE id = ?
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
            "UPDATE supervisor_endpoint SET probe_failures = 0 WHERE id = ? AND probe_failures <> 0",
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
            SET status = 'ABANDONED', update_time = ?
            WHERE id = ? AND loads = 0 AND status <> 'ABANDONED'
            "#,
        )
        .bind(Utc::now())
        .bind(id)
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

async fn release_one_load(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    endpoint_id: i64,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE supervisor_endpoint
        SET loads = CASE WHEN loads > 0 THEN loads - 1 ELSE 0 END, update_time = ?
        WHERE id = ?
        "#,
    )
    .bind(now)
    .bind(endpoint_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> ResourceLocation {
        ResourceLocation::new("eu", "default")
    }

    async fn store_with_endpoint() -> (SqliteAllocationStore, SupervisorEndpointRecord) {
        let store = SqliteAllocationStore::in_memory().await.unwrap();
        let endpoint = store
            .insert_endpoint(&NewSupervisorEndpoint::available("10.0.0.1", 9100, location()))
            .await
            .unwrap();
        (store, endpoint)
    }

    async fn pending(store: &SqliteAllocationStore, id: i64) -> JobIdentity {
        let task_id = JobIdentity::new(id);
        store
            .insert_allocation(&AllocationRecord::new(task_id, location(), "test"))
            .await
            .unwrap();
        task_id
    }

    #[tokio::test]
    async fn test_insert_and_get_allocation() {
        let store = SqliteAllocationStore::in_memory().await.unwrap();
        let task_id = pending(&store, 1).await;

        let record = store.get_allocation(task_id).await.unwrap().unwrap();
        assert_eq!(record.allocate_state, AllocateState::Preparing);
        assert_eq!(record.usage_state, UsageState::Preparing);
        assert_eq!(record.location, location());
        assert_eq!(record.owner_tag, "test");
        assert!(store.get_allocation(JobIdentity::new(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_allocation_is_rejected() {
        let store = SqliteAllocationStore::in_memory().await.unwrap();
        let task_id = pending(&store, 1).await;

        let err = store
            .insert_allocation(&AllocationRecord::new(task_id, location(), "test"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == task_id));
    }

    #[tokio::test]
    async fn test_bind_reserves_load_in_same_transaction() {
        let (store, endpoint) = store_with_endpoint().await;
        let task_id = pending(&store, 1).await;

        let outcome = store
            .bind_endpoint(
                task_id,
                AllocateState::Preparing,
                &endpoint,
                LoadReservation::Reserve { limit: Some(1) },
            )
            .await
            .unwrap();
        assert_eq!(outcome, BindOutcome::Bound);

        let record = store.get_allocation(task_id).await.unwrap().unwrap();
        assert_eq!(record.allocate_state, AllocateState::Available);
        assert_eq!(record.supervisor_endpoint, Some(endpoint.endpoint()));
        assert_eq!(record.supervisor_endpoint_ref, Some(endpoint.id));
        assert_eq!(store.get_endpoint(endpoint.id).await.unwrap().unwrap().loads, 1);
    }

    #[tokio::test]
    async fn test_bind_rejected_when_endpoint_full() {
        let (store, endpoint) = store_with_endpoint().await;
        let first = pending(&store, 1).await;
        let second = pending(&store, 2).await;
        let reserve = LoadReservation::Reserve { limit: Some(1) };

        store
            .bind_endpoint(first, AllocateState::Preparing, &endpoint, reserve)
            .await
            .unwrap();
        let outcome = store
            .bind_endpoint(second, AllocateState::Preparing, &endpoint, reserve)
            .await
            .unwrap();

        assert_eq!(outcome, BindOutcome::EndpointRejected);
        let record = store.get_allocation(second).await.unwrap().unwrap();
        assert_eq!(record.allocate_state, AllocateState::Preparing);
        assert!(record.supervisor_endpoint.is_none());
        assert_eq!(store.get_endpoint(endpoint.id).await.unwrap().unwrap().loads, 1);
    }

    #[tokio::test]
    async fn test_bind_requires_expected_state() {
        let (store, endpoint) = store_with_endpoint().await;
        let task_id = pending(&store, 1).await;

        let outcome = store
            .bind_endpoint(
                task_id,
                AllocateState::CreatingResource,
                &endpoint,
                LoadReservation::Reserve { limit: None },
            )
            .await
            .unwrap();

        assert_eq!(outcome, BindOutcome::RecordChanged);
        assert_eq!(store.get_endpoint(endpoint.id).await.unwrap().unwrap().loads, 0);
    }

    #[tokio::test]
    async fn test_fail_releases_reservation_once() {
        let (store, endpoint) = store_with_endpoint().await;
        let task_id = pending(&store, 1).await;
        assert!(store.mark_creating_resource(task_id, endpoint.id).await.unwrap());
        assert_eq!(store.get_endpoint(endpoint.id).await.unwrap().unwrap().loads, 1);

        assert!(
            store
                .fail_allocation(task_id, AllocateState::CreatingResource, true)
                .await
                .unwrap()
        );
        assert!(
            !store
                .fail_allocation(task_id, AllocateState::CreatingResource, true)
                .await
                .unwrap()
        );

        assert_eq!(store.get_endpoint(endpoint.id).await.unwrap().unwrap().loads, 0);
        let record = store.get_allocation(task_id).await.unwrap().unwrap();
        assert_eq!(record.allocate_state, AllocateState::Failed);
    }

    #[tokio::test]
    async fn test_release_returns_load_once() {
        let (store, endpoint) = store_with_endpoint().await;
        let task_id = pending(&store, 1).await;
        store
            .bind_endpoint(
                task_id,
                AllocateState::Preparing,
                &endpoint,
                LoadReservation::Reserve { limit: None },
            )
            .await
            .unwrap();

        assert!(store.release_allocation(task_id).await.unwrap());
        assert!(!store.release_allocation(task_id).await.unwrap());

        assert_eq!(store.get_endpoint(endpoint.id).await.unwrap().unwrap().loads, 0);
        let record = store.get_allocation(task_id).await.unwrap().unwrap();
        assert_eq!(record.usage_state, UsageState::Released);
    }

    #[tokio::test]
    async fn test_released_record_cannot_bind() {
        let (store, endpoint) = store_with_endpoint().await;
        let task_id = pending(&store, 1).await;
        store.release_allocation(task_id).await.unwrap();

        let outcome = store
            .bind_endpoint(
                task_id,
                AllocateState::Preparing,
                &endpoint,
                LoadReservation::Reserve { limit: None },
            )
            .await
            .unwrap();

        assert_eq!(outcome, BindOutcome::RecordChanged);
        assert_eq!(store.get_endpoint(endpoint.id).await.unwrap().unwrap().loads, 0);
    }

    #[tokio::test]
    async fn test_available_endpoints_ordered_by_load_then_id() {
        let store = SqliteAllocationStore::in_memory().await.unwrap();
        let busy = store
            .insert_endpoint(&NewSupervisorEndpoint::available("a", 1, location()))
            .await
            .unwrap();
        let idle_late = store
            .insert_endpoint(&NewSupervisorEndpoint::available("b", 1, location()))
            .await
            .unwrap();
        let idle_early_other = store
            .insert_endpoint(&NewSupervisorEndpoint::available(
                "c",
                1,
                ResourceLocation::new("us", "default"),
            ))
            .await
            .unwrap();
        let idle_last = store
            .insert_endpoint(&NewSupervisorEndpoint::available("d", 1, location()))
            .await
            .unwrap();
        let task_id = pending(&store, 1).await;
        store
            .bind_endpoint(
                task_id,
                AllocateState::Preparing,
                &busy,
                LoadReservation::Reserve { limit: None },
            )
            .await
            .unwrap();

        let ids: Vec<i64> = store
            .list_available_endpoints(&location())
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();

        assert_eq!(ids, vec![idle_late.id, idle_last.id, busy.id]);
        assert!(!ids.contains(&idle_early_other.id));
    }

    #[tokio::test]
    async fn test_probe_failures_count_and_reset() {
        let (store, endpoint) = store_with_endpoint().await;

        assert_eq!(store.record_probe_failure(endpoint.id).await.unwrap(), 1);
        assert_eq!(store.record_probe_failure(endpoint.id).await.unwrap(), 2);
        store.reset_probe_failures(endpoint.id).await.unwrap();
        assert_eq!(store.record_probe_failure(endpoint.id).await.unwrap(), 1);
        assert_eq!(store.record_probe_failure(4242).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abandon_requires_zero_load() {
        let (store, endpoint) = store_with_endpoint().await;
        let task_id = pending(&store, 1).await;
        store.mark_creating_resource(task_id, endpoint.id).await.unwrap();

        assert!(!store.abandon_idle_endpoint(endpoint.id).await.unwrap());

        store
            .fail_allocation(task_id, AllocateState::CreatingResource, true)
            .await
            .unwrap();
        assert!(store.abandon_idle_endpoint(endpoint.id).await.unwrap());
        assert!(!store.abandon_idle_endpoint(endpoint.id).await.unwrap());

        assert_eq!(store.purge_abandoned_endpoints().await.unwrap(), 1);
        let record = store.get_allocation(task_id).await.unwrap().unwrap();
        assert_eq!(record.supervisor_endpoint_ref, None);
    }

    #[tokio::test]
    async fn test_purge_released_respects_cutoff() {
        let store = SqliteAllocationStore::in_memory().await.unwrap();
        let released = pending(&store, 1).await;
        let active = pending(&store, 2).await;
        store.release_allocation(released).await.unwrap();

        let purged = store
            .purge_released_allocations(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(purged, 0);

        let purged = store
            .purge_released_allocations(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_allocation(released).await.unwrap().is_none());
        assert!(store.get_allocation(active).await.unwrap().is_some());
    }
}
