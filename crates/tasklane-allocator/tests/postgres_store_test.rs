// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store tests. Run with `TEST_DATABASE_URL` pointing at a
//! scratch database.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tasklane_allocator::{
    AllocateState, AllocationRecord, AllocationStore, BindOutcome, EndpointStatus,
    LoadReservation, NewSupervisorEndpoint, PostgresAllocationStore, StoreError, UsageState,
};
use tasklane_protocol::JobIdentity;
use tasklane_resource::ResourceLocation;

macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// Get a migrated database pool for testing
async fn get_test_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    tasklane_allocator::migrations::run_postgres(&pool).await.ok()?;
    Some(pool)
}

/// Task ids unique across test runs sharing one database.
fn unique_job() -> JobIdentity {
    static COUNTER: AtomicI64 = AtomicI64::new(0);
    let base = Utc::now().timestamp_micros() * 100;
    JobIdentity::new(base + COUNTER.fetch_add(1, Ordering::SeqCst) % 100)
}

fn unique_location() -> ResourceLocation {
    ResourceLocation::new(format!("region-{}", unique_job()), "default")
}

#[tokio::test]
async fn test_bind_and_release_round_trip() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        return;
    };
    let store = PostgresAllocationStore::new(pool);
    let location = unique_location();
    let job = unique_job();

    store
        .insert_allocation(&AllocationRecord::new(job, location.clone(), "pg-test"))
        .await
        .unwrap();
    let endpoint = store
        .insert_endpoint(&NewSupervisorEndpoint::available("10.1.0.1", 9100, location.clone()))
        .await
        .unwrap();

    let outcome = store
        .bind_endpoint(
            job,
            AllocateState::Preparing,
            &endpoint,
            LoadReservation::Reserve { limit: Some(1) },
        )
        .await
        .unwrap();
    assert_eq!(outcome, BindOutcome::Bound);

    let record = store.get_allocation(job).await.unwrap().unwrap();
    assert_eq!(record.allocate_state, AllocateState::Available);
    assert_eq!(record.supervisor_endpoint, Some(endpoint.endpoint()));
    assert_eq!(store.get_endpoint(endpoint.id).await.unwrap().unwrap().loads, 1);

    assert!(store.release_allocation(job).await.unwrap());
    assert!(!store.release_allocation(job).await.unwrap());

    let record = store.get_allocation(job).await.unwrap().unwrap();
    assert_eq!(record.usage_state, UsageState::Released);
    assert_eq!(store.get_endpoint(endpoint.id).await.unwrap().unwrap().loads, 0);
}

#[tokio::test]
async fn test_full_endpoint_rejects_bind() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        return;
    };
    let store = PostgresAllocationStore::new(pool);
    let location = unique_location();
    let first = unique_job();
    let second = unique_job();
    for job in [first, second] {
        store
            .insert_allocation(&AllocationRecord::new(job, location.clone(), "pg-test"))
            .await
            .unwrap();
    }
    let endpoint = store
        .insert_endpoint(&NewSupervisorEndpoint::available("10.1.0.2", 9100, location.clone()))
        .await
        .unwrap();
    let reservation = LoadReservation::Reserve { limit: Some(1) };

    let bound = store
        .bind_endpoint(first, AllocateState::Preparing, &endpoint, reservation)
        .await
        .unwrap();
    let rejected = store
        .bind_endpoint(second, AllocateState::Preparing, &endpoint, reservation)
        .await
        .unwrap();

    assert_eq!(bound, BindOutcome::Bound);
    assert_eq!(rejected, BindOutcome::EndpointRejected);
    let second = store.get_allocation(second).await.unwrap().unwrap();
    assert_eq!(second.allocate_state, AllocateState::Preparing);
    assert!(second.supervisor_endpoint.is_none());
}

#[tokio::test]
async fn test_duplicate_allocation() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        return;
    };
    let store = PostgresAllocationStore::new(pool);
    let record = AllocationRecord::new(unique_job(), unique_location(), "pg-test");

    store.insert_allocation(&record).await.unwrap();
    let err = store.insert_allocation(&record).await.unwrap_err();

    assert!(matches!(err, StoreError::Duplicate(id) if id == record.task_id));
}

#[tokio::test]
async fn test_row_lock_times_out() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        return;
    };
    let store =
        PostgresAllocationStore::new(pool.clone()).with_lock_timeout(Duration::from_millis(100));
    let job = unique_job();
    store
        .insert_allocation(&AllocationRecord::new(job, unique_location(), "pg-test"))
        .await
        .unwrap();

    let mut holder = pool.begin().await.unwrap();
    sqlx::query("SELECT task_id FROM resource_allocation WHERE task_id = $1 FOR UPDATE")
        .bind(job.get())
        .execute(&mut *holder)
        .await
        .unwrap();

    let err = store
        .fail_allocation(job, AllocateState::Preparing, false)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LockTimeout));

    holder.rollback().await.unwrap();
    assert!(
        store
            .fail_allocation(job, AllocateState::Preparing, false)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_connect_applies_lock_timeout() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        return;
    };
    let database_url = std::env::var("TEST_DATABASE_URL").unwrap();
    let store = tasklane_allocator::store::connect(&database_url, Duration::from_millis(100))
        .await
        .unwrap();
    let job = unique_job();
    store
        .insert_allocation(&AllocationRecord::new(job, unique_location(), "pg-test"))
        .await
        .unwrap();

    let mut holder = pool.begin().await.unwrap();
    sqlx::query("SELECT task_id FROM resource_allocation WHERE task_id = $1 FOR UPDATE")
        .bind(job.get())
        .execute(&mut *holder)
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let err = store
        .fail_allocation(job, AllocateState::Preparing, false)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LockTimeout));
    assert!(started.elapsed() < Duration::from_secs(2));

    holder.rollback().await.unwrap();
}

#[tokio::test]
async fn test_abandon_and_purge_idle_endpoint() {
    skip_if_no_db!();
    let Some(pool) = get_test_pool().await else {
        return;
    };
    let store = PostgresAllocationStore::new(pool);
    let endpoint = store
        .insert_endpoint(&NewSupervisorEndpoint {
            host: "10.1.0.3".to_string(),
            port: 9100,
            status: EndpointStatus::Preparing,
            location: unique_location(),
            resource_id: Some("pod:pg-test".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(store.record_probe_failure(endpoint.id).await.unwrap(), 1);
    assert!(store.abandon_idle_endpoint(endpoint.id).await.unwrap());
    assert!(!store.abandon_idle_endpoint(endpoint.id).await.unwrap());
    assert!(store.purge_abandoned_endpoints().await.unwrap() >= 1);
    assert!(store.get_endpoint(endpoint.id).await.unwrap().is_none());
}
