// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable supervisor runtime.
//!
//! ```rust,ignore
//! let runtime = SupervisorRuntime::builder()
//!     .executor(Arc::new(executor))
//!     .bind_addr("0.0.0.0:9100".parse()?)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ... serve commands ...
//!
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tasklane_protocol::{ServerError, SupervisorServer, SupervisorServerConfig};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{Result, SupervisorError};
use crate::executor::TaskCommandExecutor;
use crate::server::{SupervisorHandlerState, run_supervisor_server};

/// Builder for a [`SupervisorRuntime`].
pub struct SupervisorRuntimeBuilder {
    executor: Option<Arc<dyn TaskCommandExecutor>>,
    bind_addr: SocketAddr,
    server_config: SupervisorServerConfig,
}

impl Default for SupervisorRuntimeBuilder {
    fn default() -> Self {
        Self {
            executor: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
            server_config: SupervisorServerConfig::default(),
        }
    }
}

impl SupervisorRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the job command executor (required).
    pub fn executor(mut self, executor: Arc<dyn TaskCommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Default: `0.0.0.0:9100`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// QUIC transport settings. The bind address and certificate are
    /// overridden at start.
    pub fn server_config(mut self, config: SupervisorServerConfig) -> Self {
        self.server_config = config;
        self
    }

    /// Maximum concurrent connection handlers, 0 for unlimited.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.server_config.max_concurrent_handlers = max;
        self
    }

    pub fn build(self) -> Result<SupervisorRuntimeConfig> {
        let executor = self
            .executor
            .ok_or(SupervisorError::MissingField("executor"))?;
        Ok(SupervisorRuntimeConfig {
            executor,
            bind_addr: self.bind_addr,
            server_config: self.server_config,
        })
    }
}

/// Validated runtime configuration.
pub struct SupervisorRuntimeConfig {
    executor: Arc<dyn TaskCommandExecutor>,
    bind_addr: SocketAddr,
    server_config: SupervisorServerConfig,
}

impl SupervisorRuntimeConfig {
    /// Bind the QUIC server (self-signed certificate) and start serving.
    pub async fn start(self) -> Result<SupervisorRuntime> {
        let server = Arc::new(SupervisorServer::with_self_signed_cert(
            self.bind_addr,
            self.server_config,
        )?);
        let local_addr = server.local_addr()?;
        let state = Arc::new(SupervisorHandlerState::new(self.executor));

        let server_handle = tokio::spawn(run_supervisor_server(server.clone(), state.clone()));

        info!(addr = %local_addr, "SupervisorRuntime started");

        Ok(SupervisorRuntime {
            server,
            server_handle,
            state,
            local_addr,
        })
    }
}

/// A running supervisor.
pub struct SupervisorRuntime {
    server: Arc<SupervisorServer>,
    server_handle: JoinHandle<std::result::Result<(), ServerError>>,
    state: Arc<SupervisorHandlerState>,
    local_addr: SocketAddr,
}

impl SupervisorRuntime {
    pub fn builder() -> SupervisorRuntimeBuilder {
        SupervisorRuntimeBuilder::new()
    }

    /// Address the QUIC server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<SupervisorHandlerState> {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }

    /// Stop accepting connections and wait for the server task.
    pub async fn shutdown(self) -> Result<()> {
        info!("SupervisorRuntime shutting down...");
        self.server.close();

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("SupervisorRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("SupervisorRuntime server error during shutdown: {}", e);
                Err(e.into())
            }
            Err(e) => {
                error!("SupervisorRuntime server task panicked: {}", e);
                Err(SupervisorError::Task(e.to_string()))
            }
        }
    }
}
