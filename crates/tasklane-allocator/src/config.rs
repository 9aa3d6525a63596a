// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for tasklane-allocator.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tasklane_resource::{PodOperatorConfig, ProcessOperatorConfig, ResourceKind};

use crate::allocator::AllocatorConfig;
use crate::strategy::StrategyConfig;
use crate::sweeper::{CleanupWorkerConfig, SweeperConfig};

/// Allocator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `postgres://` or `sqlite:` connection string.
    pub database_url: String,
    pub allocate_timeout: Duration,
    pub sweep_interval: Duration,
    pub sweep_batch: i64,
    pub lock_timeout: Duration,
    /// Jobs per supervisor, 0 for unbounded.
    pub max_jobs_per_supervisor: i64,
    pub probe_failure_threshold: i64,
    /// Heartbeat probe timeout.
    pub probe_timeout: Duration,
    pub released_retention: Duration,
    pub idle_supervisor_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Port created supervisors listen on.
    pub supervisor_port: u16,
    /// Backend used to create supervisors.
    pub resource_kind: ResourceKind,
    /// Supervisor program for the process backend.
    pub supervisor_program: PathBuf,
    pub pod: Option<PodOperatorConfig>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TASKLANE_DATABASE_URL` (required)
    /// - `TASKLANE_ALLOCATE_TIMEOUT_SECS` (default: 300)
    /// - `TASKLANE_SWEEP_INTERVAL_MS` (default: 1000)
    /// - `TASKLANE_SWEEP_BATCH` (default: 100)
    /// - `TASKLANE_LOCK_TIMEOUT_MS` (default: 3000)
    /// - `TASKLANE_MAX_JOBS_PER_SUPERVISOR` (default: 1)
    /// - `TASKLANE_PROBE_FAILURE_THRESHOLD` (default: 3)
    /// - `TASKLANE_PROBE_TIMEOUT_MS` (default: 5000)
    /// - `TASKLANE_RELEASED_RETENTION_SECS` (default: 86400)
    /// - `TASKLANE_IDLE_SUPERVISOR_SECS` (default: 600)
    /// - `TASKLANE_CLEANUP_INTERVAL_SECS` (default: 60)
    /// - `TASKLANE_SUPERVISOR_PORT` (default: 9100)
    /// - `TASKLANE_RESOURCE_KIND` (default: pod)
    /// - `TASKLANE_SUPERVISOR_PROGRAM` (default: tasklane-supervisor)
    /// - `TASKLANE_K8S_*` Kubernetes settings
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TASKLANE_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("TASKLANE_DATABASE_URL"))?;

        let resource_kind: ResourceKind = env_or("TASKLANE_RESOURCE_KIND", ResourceKind::Pod)?;
        let pod = PodOperatorConfig::from_env().map_err(|e| ConfigError::Kubernetes(e.to_string()))?;
        if resource_kind == ResourceKind::Pod && pod.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "TASKLANE_K8S_API_URL or TASKLANE_K8S_CONFIG",
            ));
        }

        Ok(Self {
            database_url,
            allocate_timeout: Duration::from_secs(env_or("TASKLANE_ALLOCATE_TIMEOUT_SECS", 300)?),
            sweep_interval: Duration::from_millis(env_or("TASKLANE_SWEEP_INTERVAL_MS", 1000)?),
            sweep_batch: env_or("TASKLANE_SWEEP_BATCH", 100)?,
            lock_timeout: Duration::from_millis(env_or("TASKLANE_LOCK_TIMEOUT_MS", 3000)?),
            max_jobs_per_supervisor: env_or("TASKLANE_MAX_JOBS_PER_SUPERVISOR", 1)?,
            probe_failure_threshold: env_or("TASKLANE_PROBE_FAILURE_THRESHOLD", 3)?,
            probe_timeout: Duration::from_millis(env_or("TASKLANE_PROBE_TIMEOUT_MS", 5000)?),
            released_retention: Duration::from_secs(env_or(
                "TASKLANE_RELEASED_RETENTION_SECS",
                86_400,
            )?),
            idle_supervisor_timeout: Duration::from_secs(env_or(
                "TASKLANE_IDLE_SUPERVISOR_SECS",
                600,
            )?),
            cleanup_interval: Duration::from_secs(env_or("TASKLANE_CLEANUP_INTERVAL_SECS", 60)?),
            supervisor_port: env_or("TASKLANE_SUPERVISOR_PORT", 9100)?,
            resource_kind,
            supervisor_program: PathBuf::from(
                std::env::var("TASKLANE_SUPERVISOR_PROGRAM")
                    .unwrap_or_else(|_| "tasklane-supervisor".to_string()),
            ),
            pod,
        })
    }

    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            allocate_timeout: self.allocate_timeout,
            lock_timeout: self.lock_timeout,
            sweep_batch: self.sweep_batch,
        }
    }

    pub fn strategy_config(&self) -> StrategyConfig {
        StrategyConfig {
            kind: self.resource_kind,
            max_jobs_per_supervisor: (self.max_jobs_per_supervisor > 0)
                .then_some(self.max_jobs_per_supervisor),
            supervisor_port: self.supervisor_port,
            probe_failure_threshold: self.probe_failure_threshold,
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            poll_interval: self.sweep_interval,
        }
    }

    pub fn cleanup_config(&self) -> CleanupWorkerConfig {
        CleanupWorkerConfig {
            poll_interval: self.cleanup_interval,
            released_retention: self.released_retention,
            idle_timeout: self.idle_supervisor_timeout,
        }
    }

    /// Process backend settings for launching supervisors locally.
    pub fn process_config(&self) -> ProcessOperatorConfig {
        ProcessOperatorConfig {
            program: self.supervisor_program.clone(),
            ..Default::default()
        }
    }
}

fn env_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable could not be parsed.
    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),
    /// Kubernetes settings are malformed.
    #[error("Invalid Kubernetes settings: {0}")]
    Kubernetes(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_uses_default_when_unset() {
        let value: u64 = env_or("TASKLANE_TEST_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_unbounded_supervisor_capacity() {
        let config = Config {
            database_url: "sqlite::memory:".to_string(),
            allocate_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),
            sweep_batch: 100,
            lock_timeout: Duration::from_secs(3),
            max_jobs_per_supervisor: 0,
            probe_failure_threshold: 3,
            probe_timeout: Duration::from_secs(5),
            released_retention: Duration::from_secs(86_400),
            idle_supervisor_timeout: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(60),
            supervisor_port: 9100,
            resource_kind: ResourceKind::Process,
            supervisor_program: PathBuf::from("tasklane-supervisor"),
            pod: None,
        };

        assert_eq!(config.strategy_config().max_jobs_per_supervisor, None);
        assert_eq!(config.allocator_config().lock_timeout, Duration::from_secs(3));
    }
}
