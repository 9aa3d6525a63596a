// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tasklane Allocator daemon.

use std::sync::Arc;

use tasklane_allocator::{
    AllocatorRuntime, Config, HeartbeatProbe, OperatorResourceManageStrategy, store,
};
use tasklane_resource::{
    PodResourceOperatorBuilder, ProcessResourceOperatorBuilder, ResourceManager,
    ResourceOperatorBuilder,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tasklane_allocator=info,tasklane_resource=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        resource_kind = %config.resource_kind,
        allocate_timeout_secs = config.allocate_timeout.as_secs(),
        sweep_interval_ms = config.sweep_interval.as_millis() as u64,
        "Starting Tasklane Allocator"
    );

    let store = store::connect(&config.database_url, config.lock_timeout).await?;

    let mut builders: Vec<Arc<dyn ResourceOperatorBuilder>> = Vec::new();
    if let Some(pod) = config.pod.clone() {
        builders.push(Arc::new(PodResourceOperatorBuilder::new(pod)));
    }
    builders.push(Arc::new(ProcessResourceOperatorBuilder::new(
        config.process_config(),
    )));
    let manager = Arc::new(ResourceManager::new(builders));
    manager.initialize().await;

    let probe = Arc::new(HeartbeatProbe::insecure(config.probe_timeout)?);
    let strategy = Arc::new(OperatorResourceManageStrategy::new(
        store.clone(),
        manager,
        probe,
        config.strategy_config(),
    ));

    let runtime = AllocatorRuntime::builder()
        .store(store)
        .strategy(strategy)
        .allocator_config(config.allocator_config())
        .sweeper_config(config.sweeper_config())
        .cleanup_config(config.cleanup_config())
        .build()?
        .start();

    info!("Allocator ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await;

    info!("Tasklane Allocator shut down");

    Ok(())
}
