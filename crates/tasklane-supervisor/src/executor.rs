// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job command execution.
//!
//! The server hands every job command (everything but HEARTBEAT and MEM_INFO)
//! to one [`TaskCommandExecutor`]. [`DefaultTaskCommandExecutor`] launches each
//! job as a resource through the [`ResourceManager`] and keeps the created
//! executor cached by job identity for the later lifecycle commands.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tasklane_protocol::{
    Command, CommandPayload, CommandType, ExecutorEndpoint, ExecutorStatus, JobDescriptor,
    JobIdentity, ProcessConfig,
};
use tasklane_resource::{ResourceId, ResourceKind, ResourceLocation, ResourceManager, ResourceSpec};
use tracing::{debug, info};

use crate::error::JobError;

/// Environment variable carrying the job descriptor as JSON.
pub const ENV_JOB_DESCRIPTOR: &str = "TASKLANE_JOB_DESCRIPTOR";
/// Environment variable carrying the job identity.
pub const ENV_JOB_ID: &str = "TASKLANE_JOB_ID";

/// Protocol tag advertised in executor endpoints.
pub const EXECUTOR_PROTOCOL: &str = "tcp";

/// Executes job commands routed by the supervisor server.
#[async_trait]
pub trait TaskCommandExecutor: Send + Sync {
    /// Handle one command and return the response body.
    async fn on_command(&self, command: Command) -> Result<String, JobError>;

    /// Number of jobs currently tracked, reported through MEM_INFO.
    fn running_jobs(&self) -> usize {
        0
    }
}

/// A launched executor.
#[derive(Debug, Clone)]
struct CachedExecutor {
    endpoint: ExecutorEndpoint,
    resource_id: ResourceId,
}

/// Default executor backed by a resource operator.
pub struct DefaultTaskCommandExecutor {
    manager: Arc<ResourceManager>,
    kind: ResourceKind,
    location: ResourceLocation,
    supervisor_port: u16,
    advertise_host: String,
    executors: DashMap<JobIdentity, CachedExecutor>,
    starting: DashSet<JobIdentity>,
}

impl DefaultTaskCommandExecutor {
    pub fn new(
        manager: Arc<ResourceManager>,
        kind: ResourceKind,
        location: ResourceLocation,
        supervisor_port: u16,
    ) -> Self {
        Self {
            manager,
            kind,
            location,
            supervisor_port,
            advertise_host: "127.0.0.1".to_string(),
            executors: DashMap::new(),
            starting: DashSet::new(),
        }
    }

    /// Host reported when the backend does not assign one.
    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = host.into();
        self
    }

    /// Endpoint of a cached executor.
    pub fn executor(&self, job: JobIdentity) -> Option<ExecutorEndpoint> {
        self.executors.get(&job).map(|e| e.endpoint.clone())
    }

    fn cached(&self, job: JobIdentity) -> Result<CachedExecutor, JobError> {
        self.executors
            .get(&job)
            .map(|e| e.value().clone())
            .ok_or(JobError::UnknownJob(job))
    }

    async fn start(&self, job: &JobDescriptor, process: &ProcessConfig) -> Result<String, JobError> {
        job.validate()?;
        process.validate()?;

        let identity = job.identity;
        if self.executors.contains_key(&identity) || !self.starting.insert(identity) {
            return Err(JobError::DuplicateJob(identity));
        }

        let launched = self.launch(job, process).await;
        self.starting.remove(&identity);
        let executor = launched?;

        info!(
            job_id = %identity,
            implementation = %job.implementation_ref,
            executor = %executor.resource_id,
            "Job executor started"
        );
        self.executors.insert(identity, executor);
        Ok(CommandType::Start.ack())
    }

    async fn launch(
        &self,
        job: &JobDescriptor,
        process: &ProcessConfig,
    ) -> Result<CachedExecutor, JobError> {
        let spec = ResourceSpec::new(self.kind, self.location.clone(), format!("job-{}", job.identity))
            .with_envs(process.environment.clone())
            .with_env(ENV_JOB_ID, job.identity.to_string())
            .with_env(ENV_JOB_DESCRIPTOR, serde_json::to_string(job)?)
            .with_heap(process.heap_min_mb, process.heap_max_mb);

        let resource = self.manager.create(&spec).await?;
        let endpoint = ExecutorEndpoint {
            protocol: EXECUTOR_PROTOCOL.to_string(),
            host: resource
                .host
                .clone()
                .unwrap_or_else(|| self.advertise_host.clone()),
            supervisor_port: self.supervisor_port,
            executor_port: resource.port.unwrap_or_default(),
            identifier: resource.id.to_string(),
        };

        Ok(CachedExecutor {
            endpoint,
            resource_id: resource.id,
        })
    }

    async fn query(&self, job: JobIdentity) -> Result<String, JobError> {
        let executor = self.cached(job)?;
        let alive = self
            .manager
            .query(&executor.resource_id)
            .await?
            .is_some_and(|r| r.state.is_alive());

        debug!(job_id = %job, alive, "Queried job executor");
        Ok(serde_json::to_string(&ExecutorStatus {
            endpoint: executor.endpoint,
            alive,
        })?)
    }

    async fn stop(&self, job: JobIdentity) -> Result<String, JobError> {
        let executor = self.cached(job)?;
        self.manager.destroy(&executor.resource_id).await?;
        info!(job_id = %job, "Job executor stopped");
        Ok(CommandType::Stop.ack())
    }

    async fn finish(&self, job: JobIdentity) -> Result<String, JobError> {
        let (_, executor) = self.executors.remove(&job).ok_or(JobError::UnknownJob(job))?;

        // Released even when already exited so the backend forgets the executor.
        self.manager.release(&executor.resource_id).await;

        info!(job_id = %job, "Job finished");
        Ok(CommandType::Finish.ack())
    }
}

#[async_trait]
impl TaskCommandExecutor for DefaultTaskCommandExecutor {
    async fn on_command(&self, command: Command) -> Result<String, JobError> {
        let job = command.job_identity();
        match (command.command_type(), command.payload()) {
            (CommandType::Start, CommandPayload::Start { job, process }) => {
                self.start(job, process).await
            }
            (CommandType::Query, _) => self.query(job).await,
            (CommandType::Stop, _) => self.stop(job).await,
            (CommandType::Finish, _) => self.finish(job).await,
            (other, _) => Err(JobError::Malformed(format!(
                "{other} is not handled by the job executor"
            ))),
        }
    }

    fn running_jobs(&self) -> usize {
        self.executors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasklane_resource::{
        MockResourceOperator, MockResourceOperatorBuilder, ResourceOperatorBuilder, ResourceState,
    };

    fn executor() -> (DefaultTaskCommandExecutor, Arc<MockResourceOperator>) {
        let operator = Arc::new(MockResourceOperator::new(ResourceKind::Process));
        let builder: Arc<dyn ResourceOperatorBuilder> = Arc::new(MockResourceOperatorBuilder::new(
            ResourceKind::Process,
            operator.clone(),
        ));
        let manager = Arc::new(ResourceManager::new(vec![builder]));
        let executor = DefaultTaskCommandExecutor::new(
            manager,
            ResourceKind::Process,
            ResourceLocation::new("local", "default"),
            9100,
        );
        (executor, operator)
    }

    fn job(id: i64) -> JobDescriptor {
        JobDescriptor::new(JobIdentity::new(id), "DataTransferJob").with_parameter("table", "t1")
    }

    #[tokio::test]
    async fn test_start_caches_executor() {
        let (executor, operator) = executor();

        let ack = executor
            .on_command(Command::start(job(1), ProcessConfig::default()))
            .await
            .unwrap();

        assert_eq!(ack, "start");
        assert_eq!(operator.create_count(), 1);
        assert_eq!(executor.running_jobs(), 1);
        let endpoint = executor.executor(JobIdentity::new(1)).unwrap();
        assert_eq!(endpoint.supervisor_port, 9100);
        assert_eq!(endpoint.executor_port, 9100);
    }

    #[tokio::test]
    async fn test_duplicate_start_is_rejected() {
        let (executor, operator) = executor();
        executor
            .on_command(Command::start(job(1), ProcessConfig::default()))
            .await
            .unwrap();

        let second = executor
            .on_command(Command::start(job(1), ProcessConfig::default()))
            .await;

        assert!(matches!(second, Err(JobError::DuplicateJob(_))));
        assert_eq!(operator.create_count(), 1);
    }

    #[tokio::test]
    async fn test_query_reports_liveness() {
        let (executor, _) = executor();
        executor
            .on_command(Command::start(job(2), ProcessConfig::default()))
            .await
            .unwrap();

        let body = executor
            .on_command(Command::query(JobIdentity::new(2), None))
            .await
            .unwrap();
        let status: ExecutorStatus = serde_json::from_str(&body).unwrap();
        assert!(status.alive);

        executor
            .on_command(Command::stop(JobIdentity::new(2), None))
            .await
            .unwrap();
        let body = executor
            .on_command(Command::query(JobIdentity::new(2), None))
            .await
            .unwrap();
        let status: ExecutorStatus = serde_json::from_str(&body).unwrap();
        assert!(!status.alive);
    }

    #[tokio::test]
    async fn test_finish_evicts_and_destroys() {
        let (executor, operator) = executor();
        executor
            .on_command(Command::start(job(3), ProcessConfig::default()))
            .await
            .unwrap();

        let ack = executor
            .on_command(Command::finish(JobIdentity::new(3), None))
            .await
            .unwrap();

        assert_eq!(ack, "finish");
        assert_eq!(operator.delete_count(), 1);
        assert_eq!(executor.running_jobs(), 0);
        assert!(matches!(
            executor
                .on_command(Command::query(JobIdentity::new(3), None))
                .await,
            Err(JobError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_finish_releases_exited_executor() {
        let (executor, operator) = executor();
        executor
            .on_command(Command::start(job(6), ProcessConfig::default()))
            .await
            .unwrap();
        let id: ResourceId = executor
            .executor(JobIdentity::new(6))
            .unwrap()
            .identifier
            .parse()
            .unwrap();
        assert!(operator.set_state(&id, ResourceState::Exited).await);

        executor
            .on_command(Command::finish(JobIdentity::new(6), None))
            .await
            .unwrap();

        assert_eq!(operator.delete_count(), 1);
        assert_eq!(operator.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_lifecycle_command_for_unknown_job() {
        let (executor, _) = executor();
        for command in [
            Command::stop(JobIdentity::new(9), None),
            Command::query(JobIdentity::new(9), None),
            Command::finish(JobIdentity::new(9), None),
        ] {
            assert!(matches!(
                executor.on_command(command).await,
                Err(JobError::UnknownJob(id)) if id == JobIdentity::new(9)
            ));
        }
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_cached() {
        let (executor, operator) = executor();
        operator.set_failing(true);

        let result = executor
            .on_command(Command::start(job(4), ProcessConfig::default()))
            .await;

        assert!(matches!(result, Err(JobError::Resource(_))));
        assert_eq!(executor.running_jobs(), 0);

        operator.set_failing(false);
        executor
            .on_command(Command::start(job(4), ProcessConfig::default()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_job_is_rejected() {
        let (executor, operator) = executor();
        let result = executor
            .on_command(Command::start(
                JobDescriptor::new(JobIdentity::new(5), ""),
                ProcessConfig::default(),
            ))
            .await;

        assert!(matches!(result, Err(JobError::Malformed(_))));
        assert_eq!(operator.create_count(), 0);
    }
}
