// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tasklane Supervisor daemon.

use std::sync::Arc;

use tasklane_protocol::SupervisorServerConfig;
use tasklane_resource::{
    PodResourceOperatorBuilder, ProcessResourceOperatorBuilder, ResourceManager,
    ResourceOperatorBuilder,
};
use tasklane_supervisor::{Config, DefaultTaskCommandExecutor, SupervisorRuntime};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasklane_supervisor=info,tasklane_resource=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        bind_addr = %config.bind_addr,
        resource_kind = %config.resource_kind,
        location = %config.location,
        "Starting Tasklane Supervisor"
    );

    let mut builders: Vec<Arc<dyn ResourceOperatorBuilder>> = Vec::new();
    if let Some(pod) = config.pod.clone() {
        builders.push(Arc::new(PodResourceOperatorBuilder::new(pod)));
    }
    builders.push(Arc::new(ProcessResourceOperatorBuilder::new(
        config.process_config(),
    )));

    let manager = Arc::new(ResourceManager::new(builders));
    manager.initialize().await;

    let executor = DefaultTaskCommandExecutor::new(
        manager,
        config.resource_kind,
        config.location.clone(),
        config.bind_addr.port(),
    )
    .with_advertise_host(config.advertise_host.clone());

    let runtime = SupervisorRuntime::builder()
        .executor(Arc::new(executor))
        .bind_addr(config.bind_addr)
        .server_config(SupervisorServerConfig::from_env())
        .max_connections(config.max_connections)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Supervisor ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Tasklane Supervisor shut down");

    Ok(())
}
