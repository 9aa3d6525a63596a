// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tasklane-supervisor.

use tasklane_protocol::{JobIdentity, ProtocolError, ServerError};
use tasklane_resource::ResourceError;
use thiserror::Error;

/// Failure of a single job command. Sent back to the caller as an error frame.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobError {
    /// No executor is cached for this job.
    #[error("unknown job: {0}")]
    UnknownJob(JobIdentity),

    /// START for a job that is already running here.
    #[error("job {0} is already started")]
    DuplicateJob(JobIdentity),

    /// Command or job descriptor failed validation.
    #[error("malformed command: {0}")]
    Malformed(String),

    /// The resource backend failed.
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    /// JSON serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Supervisor-side failure unrelated to the job.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ProtocolError> for JobError {
    fn from(e: ProtocolError) -> Self {
        JobError::Malformed(e.to_string())
    }
}

/// Supervisor runtime errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// QUIC server failed.
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// Resource backend setup failed.
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// A required builder field is missing.
    #[error("{0} is required")]
    MissingField(&'static str),

    /// Background task panicked.
    #[error("task failed: {0}")]
    Task(String),
}

/// Result type using [`SupervisorError`].
pub type Result<T> = std::result::Result<T, SupervisorError>;
