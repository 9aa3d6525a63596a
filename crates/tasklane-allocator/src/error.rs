// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the allocator.

use tasklane_protocol::{ClientError, JobIdentity};
use tasklane_resource::ResourceError;
use thiserror::Error;

/// Errors raised by an [`AllocationStore`](crate::store::AllocationStore).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("allocation for job {0} already exists")]
    Duplicate(JobIdentity),

    /// PostgreSQL `lock_timeout` expired while waiting for a row lock.
    #[error("timed out waiting for a row lock")]
    LockTimeout,

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("unsupported database url: {0}")]
    UnsupportedUrl(String),
}

impl StoreError {
    /// Map a sqlx error, recognising unique and lock-timeout violations.
    pub(crate) fn classify(err: sqlx::Error, task_id: JobIdentity) -> Self {
        if let sqlx::Error::Database(db) = &err
            && db.is_unique_violation()
        {
            return StoreError::Duplicate(task_id);
        }
        Self::locking(err)
    }

    /// Map a sqlx error raised while waiting for a row lock.
    pub(crate) fn locking(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err
            && db.code().as_deref() == Some(LOCK_NOT_AVAILABLE)
        {
            return StoreError::LockTimeout;
        }
        StoreError::Database(err)
    }
}

/// PostgreSQL SQLSTATE `lock_not_available`.
pub(crate) const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Errors raised by the allocation state machine and façade.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AllocationError {
    #[error("no allocation for job {0}")]
    NotFound(JobIdentity),

    #[error("allocation for job {0} already exists")]
    Duplicate(JobIdentity),

    /// The allocation reached `FAILED`; the owner must not wait any longer.
    #[error("allocation for job {0} failed")]
    AllocationFailed(JobIdentity),

    /// The record stayed locked by another transition past the lock timeout.
    #[error("timed out locking allocation for job {0}")]
    LockTimeout(JobIdentity),

    #[error("no supervisor for job {0} before the deadline")]
    WaitTimeout(JobIdentity),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("supervisor client error: {0}")]
    Client(#[from] ClientError),
}

impl From<StoreError> for AllocationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(id) => AllocationError::Duplicate(id),
            other => AllocationError::Store(other),
        }
    }
}

/// Errors raised by processor registration and dispatch.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessorError {
    /// More than one processor claims the job type.
    #[error("{count} {kind} processors are interested in job type '{job_type}'")]
    Ambiguous {
        kind: &'static str,
        job_type: String,
        count: usize,
    },

    #[error("processor failed: {0}")]
    Failed(String),
}

pub type Result<T> = std::result::Result<T, AllocationError>;
