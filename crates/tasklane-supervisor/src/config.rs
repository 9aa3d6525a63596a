// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for tasklane-supervisor.

use std::net::SocketAddr;
use std::path::PathBuf;

use tasklane_resource::{PodOperatorConfig, ProcessOperatorConfig, ResourceKind, ResourceLocation};

/// Supervisor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// QUIC bind address for the command server.
    pub bind_addr: SocketAddr,
    /// Host advertised in executor endpoints.
    pub advertise_host: String,
    /// Backend used to launch executors.
    pub resource_kind: ResourceKind,
    /// Region/group this supervisor serves.
    pub location: ResourceLocation,
    /// Executor program for the process backend.
    pub executor_program: PathBuf,
    pub executor_args: Vec<String>,
    /// Maximum concurrent connection handlers (0 for unlimited).
    pub max_connections: u32,
    /// Kubernetes settings, when configured.
    pub pod: Option<PodOperatorConfig>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A supervisor launched by the process backend listens on the port
        // that backend assigned to it.
        let bind_addr = match std::env::var("TASKLANE_SUPERVISOR_BIND") {
            Ok(addr) => addr
                .parse()
                .map_err(|_| ConfigError::InvalidValue("TASKLANE_SUPERVISOR_BIND"))?,
            Err(_) => {
                let port: u16 = std::env::var(tasklane_resource::process::ENV_EXECUTOR_PORT)
                    .unwrap_or_else(|_| "9100".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("TASKLANE_EXECUTOR_PORT"))?;
                SocketAddr::from(([0, 0, 0, 0], port))
            }
        };

        let advertise_host =
            std::env::var("TASKLANE_SUPERVISOR_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let resource_kind = std::env::var("TASKLANE_RESOURCE_KIND")
            .unwrap_or_else(|_| "process".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("TASKLANE_RESOURCE_KIND"))?;

        let location = ResourceLocation::new(
            std::env::var("TASKLANE_REGION").unwrap_or_else(|_| "default".to_string()),
            std::env::var("TASKLANE_GROUP").unwrap_or_else(|_| "default".to_string()),
        );

        let executor_program = PathBuf::from(
            std::env::var("TASKLANE_EXECUTOR_PROGRAM")
                .unwrap_or_else(|_| "tasklane-executor".to_string()),
        );
        let executor_args = std::env::var("TASKLANE_EXECUTOR_ARGS")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let max_connections = std::env::var("TASKLANE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("TASKLANE_MAX_CONNECTIONS"))?;

        let pod = PodOperatorConfig::from_env().map_err(|e| ConfigError::Kubernetes(e.to_string()))?;
        if resource_kind == ResourceKind::Pod && pod.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "TASKLANE_K8S_API_URL or TASKLANE_K8S_CONFIG",
            ));
        }

        Ok(Self {
            bind_addr,
            advertise_host,
            resource_kind,
            location,
            executor_program,
            executor_args,
            max_connections,
            pod,
        })
    }

    /// Process backend settings derived from this configuration.
    pub fn process_config(&self) -> ProcessOperatorConfig {
        ProcessOperatorConfig {
            program: self.executor_program.clone(),
            args: self.executor_args.clone(),
            advertise_host: self.advertise_host.clone(),
            ..Default::default()
        }
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
