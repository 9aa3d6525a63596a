// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for resource operators.

use thiserror::Error;

use crate::traits::ResourceKind;

/// Errors from resource operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResourceError {
    /// No registered builder can produce an operator for this kind.
    #[error("no operator available for resource kind {0}")]
    Unsupported(ResourceKind),

    /// The backend refused or failed to create the resource.
    #[error("failed to create resource: {0}")]
    CreateFailed(String),

    /// The resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The resource id does not belong to this backend or cannot be parsed.
    #[error("invalid resource id: {0}")]
    InvalidId(String),

    /// Orchestrator API answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Backend configuration is incomplete or malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Signal delivery failed.
    #[error("signal error: {0}")]
    Signal(#[from] nix::errno::Errno),
}

/// Result type for resource operations.
pub type Result<T> = std::result::Result<T, ResourceError>;
