// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource management strategies.
//!
//! The state machine asks a [`ResourceManageStrategy`] whether an existing
//! supervisor can take another job, creates a new supervisor when none can,
//! and polls that supervisor until it answers heartbeats.

use std::sync::Arc;

use async_trait::async_trait;
use tasklane_resource::{
    ResourceId, ResourceKind, ResourceManager, ResourceSpec, ResourceState,
};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{
    AllocationRecord, EndpointStatus, NewSupervisorEndpoint, SupervisorEndpointRecord,
};
use crate::probe::SupervisorProbe;
use crate::store::AllocationStore;

/// Environment variables handed to created supervisors.
pub const ENV_REGION: &str = "TASKLANE_REGION";
pub const ENV_GROUP: &str = "TASKLANE_GROUP";

/// Readiness of the supervisor a `CREATING_RESOURCE` record waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointReadiness {
    /// Answers heartbeats and is `AVAILABLE`.
    Ready(SupervisorEndpointRecord),
    /// Still starting; ask again later.
    Pending,
    /// Gone or failed; the waiting record should fail.
    Unavailable,
}

/// Policy plugged into the allocation state machine.
#[async_trait]
pub trait ResourceManageStrategy: Send + Sync {
    /// Upper bound on jobs per supervisor, `None` for unbounded.
    fn max_loads(&self) -> Option<i64>;

    fn has_capacity(&self, endpoint: &SupervisorEndpointRecord) -> bool {
        self.max_loads().is_none_or(|max| endpoint.loads < max)
    }

    /// Probe a candidate supervisor.
    async fn is_alive(&self, endpoint: &SupervisorEndpointRecord) -> Result<bool>;

    /// Create a supervisor for `record`. `Ok(None)` means nothing could be
    /// created right now and the record should wait for the next pass.
    async fn handle_no_resource_available(
        &self,
        record: &AllocationRecord,
    ) -> Result<Option<SupervisorEndpointRecord>>;

    /// Check the supervisor a `CREATING_RESOURCE` record is waiting for.
    async fn detect_if_endpoint_is_available(
        &self,
        record: &AllocationRecord,
    ) -> Result<EndpointReadiness>;

    /// Abandon an idle supervisor and reclaim its resource. Returns false if
    /// the supervisor picked up load in the meantime.
    async fn release_endpoint(&self, endpoint: &SupervisorEndpointRecord) -> Result<bool>;
}

/// Settings for [`OperatorResourceManageStrategy`].
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Backend used for new supervisors.
    pub kind: ResourceKind,
    /// Jobs per supervisor, `None` for unbounded.
    pub max_jobs_per_supervisor: Option<i64>,
    /// Port supervisors listen on when the backend does not pick one.
    pub supervisor_port: u16,
    /// Consecutive failed probes before a supervisor is taken out of rotation.
    pub probe_failure_threshold: i64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: ResourceKind::Pod,
            max_jobs_per_supervisor: Some(1),
            supervisor_port: 9100,
            probe_failure_threshold: 3,
        }
    }
}

/// Strategy creating supervisors through a [`ResourceManager`].
pub struct OperatorResourceManageStrategy {
    store: Arc<dyn AllocationStore>,
    manager: Arc<ResourceManager>,
    probe: Arc<dyn SupervisorProbe>,
    config: StrategyConfig,
}

impl OperatorResourceManageStrategy {
    pub fn new(
        store: Arc<dyn AllocationStore>,
        manager: Arc<ResourceManager>,
        probe: Arc<dyn SupervisorProbe>,
        config: StrategyConfig,
    ) -> Self {
        Self {
            store,
            manager,
            probe,
            config,
        }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    fn supervisor_spec(&self, record: &AllocationRecord) -> ResourceSpec {
        let spec = ResourceSpec::new(
            self.config.kind,
            record.location.clone(),
            format!("supervisor-{}", record.task_id),
        )
        .with_env(ENV_REGION, record.location.region.clone())
        .with_env(ENV_GROUP, record.location.group.clone());

        match self.config.kind {
            ResourceKind::Pod => spec.with_port(self.config.supervisor_port),
            ResourceKind::Process => spec,
        }
    }

    /// Mark `endpoint` unavailable and report the waiting record as failed.
    async fn give_up(&self, endpoint: &SupervisorEndpointRecord, reason: &str) -> Result<EndpointReadiness> {
        warn!(
            endpoint_id = endpoint.id,
            resource = ?endpoint.resource_id,
            reason,
            "Supervisor will not become available"
        );
        self.store
            .update_endpoint_status(endpoint.id, EndpointStatus::Unavailable)
            .await?;
        Ok(EndpointReadiness::Unavailable)
    }
}

#[async_trait]
impl ResourceManageStrategy for OperatorResourceManageStrategy {
    fn max_loads(&self) -> Option<i64> {
        self.config.max_jobs_per_supervisor
    }

    async fn is_alive(&self, endpoint: &SupervisorEndpointRecord) -> Result<bool> {
        if self.probe.is_alive(&endpoint.endpoint()).await {
            if endpoint.probe_failures > 0 {
                self.store.reset_probe_failures(endpoint.id).await?;
            }
            return Ok(true);
        }

        let failures = self.store.record_probe_failure(endpoint.id).await?;
        if failures >= self.config.probe_failure_threshold {
            warn!(
                endpoint_id = endpoint.id,
                endpoint = %endpoint.endpoint(),
                failures,
                "Supervisor stopped answering heartbeats, marking unavailable"
            );
            self.store
                .update_endpoint_status(endpoint.id, EndpointStatus::Unavailable)
                .await?;
        } else {
            debug!(endpoint_id = endpoint.id, failures, "Supervisor heartbeat failed");
        }
        Ok(false)
    }

    async fn handle_no_resource_available(
        &self,
        record: &AllocationRecord,
    ) -> Result<Option<SupervisorEndpointRecord>> {
        let spec = self.supervisor_spec(record);
        let resource = match self.manager.create(&spec).await {
            Ok(resource) => resource,
            Err(e) => {
                warn!(
                    job_id = %record.task_id,
                    kind = %self.config.kind,
                    error = %e,
                    "Could not create supervisor resource"
                );
                return Ok(None);
            }
        };

        let endpoint = NewSupervisorEndpoint {
            host: resource.host.clone().unwrap_or_default(),
            port: resource.port.unwrap_or(self.config.supervisor_port),
            status: EndpointStatus::Preparing,
            location: record.location.clone(),
            resource_id: Some(resource.id.to_string()),
        };

        match self.store.insert_endpoint(&endpoint).await {
            Ok(saved) => {
                info!(
                    job_id = %record.task_id,
                    endpoint_id = saved.id,
                    resource = %resource.id,
                    "Supervisor resource created"
                );
                Ok(Some(saved))
            }
            Err(e) => {
                self.manager.release(&resource.id).await;
                Err(e.into())
            }
        }
    }

    async fn detect_if_endpoint_is_available(
        &self,
        record: &AllocationRecord,
    ) -> Result<EndpointReadiness> {
        let Some(endpoint_id) = record.supervisor_endpoint_ref else {
            return Ok(EndpointReadiness::Unavailable);
        };
        let Some(mut endpoint) = self.store.get_endpoint(endpoint_id).await? else {
            return Ok(EndpointReadiness::Unavailable);
        };

        match endpoint.status {
            EndpointStatus::Available => return Ok(EndpointReadiness::Ready(endpoint)),
            EndpointStatus::Unavailable | EndpointStatus::Abandoned => {
                return Ok(EndpointReadiness::Unavailable);
            }
            EndpointStatus::Preparing => {}
        }

        if let Some(resource_id) = endpoint.resource_id.as_deref() {
            let id: ResourceId = resource_id.parse()?;
            let resource = match self.manager.query(&id).await? {
                Some(resource) => resource,
                None => return self.give_up(&endpoint, "resource disappeared").await,
            };
            match resource.state {
                ResourceState::Exited | ResourceState::Failed => {
                    return self.give_up(&endpoint, "resource terminated").await;
                }
                ResourceState::Creating | ResourceState::Unknown => {
                    return Ok(EndpointReadiness::Pending);
                }
                ResourceState::Running => {}
            }

            if let Some(host) = resource.host.filter(|h| *h != endpoint.host) {
                let port = resource.port.unwrap_or(endpoint.port);
                self.store.set_endpoint_address(endpoint.id, &host, port).await?;
                endpoint.host = host;
                endpoint.port = port;
            }
        }

        if !endpoint.has_address() || !self.probe.is_alive(&endpoint.endpoint()).await {
            debug!(endpoint_id = endpoint.id, "Supervisor not ready yet");
            return Ok(EndpointReadiness::Pending);
        }

        self.store
            .update_endpoint_status(endpoint.id, EndpointStatus::Available)
            .await?;
        endpoint.status = EndpointStatus::Available;
        info!(
            endpoint_id = endpoint.id,
            endpoint = %endpoint.endpoint(),
            "Supervisor is available"
        );
        Ok(EndpointReadiness::Ready(endpoint))
    }

    async fn release_endpoint(&self, endpoint: &SupervisorEndpointRecord) -> Result<bool> {
        if !self.store.abandon_idle_endpoint(endpoint.id).await? {
            return Ok(false);
        }

        if let Some(resource_id) = endpoint.resource_id.as_deref() {
            match resource_id.parse::<ResourceId>() {
                Ok(id) => {
                    if let Err(e) = self.manager.destroy(&id).await {
                        // Keep it visible to the next cleanup pass.
                        self.store
                            .update_endpoint_status(endpoint.id, EndpointStatus::Unavailable)
                            .await?;
                        return Err(e.into());
                    }
                }
                Err(e) => warn!(endpoint_id = endpoint.id, error = %e, "Unparseable resource id"),
            }
        }

        info!(endpoint_id = endpoint.id, "Supervisor released");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteAllocationStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tasklane_protocol::{JobIdentity, SupervisorEndpoint};
    use tasklane_resource::{
        MockResourceOperator, MockResourceOperatorBuilder, ResourceLocation,
        ResourceOperatorBuilder,
    };

    struct FlagProbe(AtomicBool);

    #[async_trait]
    impl SupervisorProbe for FlagProbe {
        async fn is_alive(&self, _endpoint: &SupervisorEndpoint) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Fixture {
        store: Arc<SqliteAllocationStore>,
        operator: Arc<MockResourceOperator>,
        probe: Arc<FlagProbe>,
        strategy: OperatorResourceManageStrategy,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteAllocationStore::in_memory().await.unwrap());
        let operator = Arc::new(MockResourceOperator::new(ResourceKind::Pod));
        let builder: Arc<dyn ResourceOperatorBuilder> = Arc::new(MockResourceOperatorBuilder::new(
            ResourceKind::Pod,
            operator.clone(),
        ));
        let manager = Arc::new(ResourceManager::new(vec![builder]));
        let probe = Arc::new(FlagProbe(AtomicBool::new(true)));
        let strategy = OperatorResourceManageStrategy::new(
            store.clone(),
            manager,
            probe.clone(),
            StrategyConfig::default(),
        );
        Fixture {
            store,
            operator,
            probe,
            strategy,
        }
    }

    fn record(id: i64) -> AllocationRecord {
        AllocationRecord::new(
            JobIdentity::new(id),
            ResourceLocation::new("eu", "default"),
            "test",
        )
    }

    #[tokio::test]
    async fn test_capacity_uses_max_loads() {
        let f = fixture().await;
        let mut endpoint = f
            .store
            .insert_endpoint(&NewSupervisorEndpoint::available(
                "h",
                1,
                ResourceLocation::new("eu", "default"),
            ))
            .await
            .unwrap();

        assert!(f.strategy.has_capacity(&endpoint));
        endpoint.loads = 1;
        assert!(!f.strategy.has_capacity(&endpoint));
    }

    #[tokio::test]
    async fn test_created_supervisor_is_saved_preparing() {
        let f = fixture().await;

        let endpoint = f
            .strategy
            .handle_no_resource_available(&record(1))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(f.operator.create_count(), 1);
        assert_eq!(endpoint.status, EndpointStatus::Preparing);
        assert_eq!(endpoint.loads, 0);
        assert!(endpoint.resource_id.as_deref().unwrap().starts_with("pod:"));
    }

    #[tokio::test]
    async fn test_backend_failure_yields_nothing() {
        let f = fixture().await;
        f.operator.set_failing(true);

        let created = f.strategy.handle_no_resource_available(&record(1)).await.unwrap();

        assert!(created.is_none());
        assert!(f.store.list_endpoints(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_probe_threshold_marks_unavailable() {
        let f = fixture().await;
        let endpoint = f
            .store
            .insert_endpoint(&NewSupervisorEndpoint::available(
                "h",
                1,
                ResourceLocation::new("eu", "default"),
            ))
            .await
            .unwrap();
        f.probe.0.store(false, Ordering::SeqCst);

        for _ in 0..3 {
            assert!(!f.strategy.is_alive(&endpoint).await.unwrap());
        }

        let endpoint = f.store.get_endpoint(endpoint.id).await.unwrap().unwrap();
        assert_eq!(endpoint.status, EndpointStatus::Unavailable);
        assert_eq!(endpoint.probe_failures, 3);
    }

    #[tokio::test]
    async fn test_detect_waits_for_heartbeat() {
        let f = fixture().await;
        let endpoint = f
            .strategy
            .handle_no_resource_available(&record(1))
            .await
            .unwrap()
            .unwrap();
        let mut waiting = record(1);
        waiting.supervisor_endpoint_ref = Some(endpoint.id);

        f.probe.0.store(false, Ordering::SeqCst);
        assert_eq!(
            f.strategy.detect_if_endpoint_is_available(&waiting).await.unwrap(),
            EndpointReadiness::Pending
        );

        f.probe.0.store(true, Ordering::SeqCst);
        let ready = f.strategy.detect_if_endpoint_is_available(&waiting).await.unwrap();
        assert!(matches!(ready, EndpointReadiness::Ready(e) if e.status == EndpointStatus::Available));
    }

    #[tokio::test]
    async fn test_detect_reports_terminated_resource() {
        let f = fixture().await;
        let endpoint = f
            .strategy
            .handle_no_resource_available(&record(1))
            .await
            .unwrap()
            .unwrap();
        let id: ResourceId = endpoint.resource_id.as_deref().unwrap().parse().unwrap();
        assert!(f.operator.set_state(&id, ResourceState::Failed).await);
        let mut waiting = record(1);
        waiting.supervisor_endpoint_ref = Some(endpoint.id);

        assert_eq!(
            f.strategy.detect_if_endpoint_is_available(&waiting).await.unwrap(),
            EndpointReadiness::Unavailable
        );
        let endpoint = f.store.get_endpoint(endpoint.id).await.unwrap().unwrap();
        assert_eq!(endpoint.status, EndpointStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_release_destroys_idle_supervisor() {
        let f = fixture().await;
        let endpoint = f
            .strategy
            .handle_no_resource_available(&record(1))
            .await
            .unwrap()
            .unwrap();

        assert!(f.strategy.release_endpoint(&endpoint).await.unwrap());
        assert!(!f.strategy.release_endpoint(&endpoint).await.unwrap());

        assert_eq!(f.operator.delete_count(), 1);
        assert_eq!(f.operator.live_count().await, 0);
    }
}
