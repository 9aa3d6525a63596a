// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-job-type result and termination hooks.
//!
//! Processors are selected by [`ResultProcessor::interested`] /
//! [`TerminateProcessor::interested`]. At most one processor of each kind may
//! claim a job type; a job type nobody claims passes through untouched.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tasklane_protocol::{JobDescriptor, JobIdentity};
use tracing::debug;

use crate::error::ProcessorError;

/// Lifecycle status of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Preparing,
    Running,
    Done,
    Failed,
    Canceled,
    Abnormal,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::Abnormal
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Preparing => "PREPARING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::Abnormal => "ABNORMAL",
        };
        f.write_str(s)
    }
}

/// A scheduled task owning one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTask {
    pub id: i64,
    pub job: JobIdentity,
    pub status: TaskStatus,
}

/// A result reported by a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub job: JobIdentity,
    pub status: TaskStatus,
    /// Job-specific result body.
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait ResultProcessor: Send + Sync {
    fn interested(&self, job_type: &str) -> bool;

    async fn process(&self, result: &TaskResult) -> Result<(), ProcessorError>;
}

#[async_trait]
pub trait TerminateProcessor: Send + Sync {
    fn interested(&self, job_type: &str) -> bool;

    /// Side effects of the job reaching a terminal status.
    async fn process(&self, task: &ScheduleTask, job: &JobDescriptor) -> Result<(), ProcessorError>;

    /// Reinterpret the final status. Unchanged by default.
    fn correct_task_status(
        &self,
        _task: &ScheduleTask,
        _job: &JobDescriptor,
        status: TaskStatus,
    ) -> TaskStatus {
        status
    }
}

/// Registered processors, resolved by job type.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    result_processors: Vec<Arc<dyn ResultProcessor>>,
    terminate_processors: Vec<Arc<dyn TerminateProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_result_processor(&mut self, processor: Arc<dyn ResultProcessor>) {
        self.result_processors.push(processor);
    }

    pub fn register_terminate_processor(&mut self, processor: Arc<dyn TerminateProcessor>) {
        self.terminate_processors.push(processor);
    }

    pub fn result_processor(&self, job_type: &str) -> Result<Option<Arc<dyn ResultProcessor>>, ProcessorError> {
        pick(
            "result",
            job_type,
            self.result_processors
                .iter()
                .filter(|p| p.interested(job_type))
                .cloned()
                .collect(),
        )
    }

    pub fn terminate_processor(
        &self,
        job_type: &str,
    ) -> Result<Option<Arc<dyn TerminateProcessor>>, ProcessorError> {
        pick(
            "terminate",
            job_type,
            self.terminate_processors
                .iter()
                .filter(|p| p.interested(job_type))
                .cloned()
                .collect(),
        )
    }

    /// Fail if any of `job_types` is claimed by more than one processor.
    pub fn validate<'a>(
        &self,
        job_types: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ProcessorError> {
        for job_type in job_types {
            self.result_processor(job_type)?;
            self.terminate_processor(job_type)?;
        }
        Ok(())
    }

    /// Dispatch `result` for `job` and return the task's final status.
    ///
    /// Terminal results also run the terminate processor, which may correct
    /// the status.
    pub async fn handle_result(
        &self,
        task: &ScheduleTask,
        job: &JobDescriptor,
        result: &TaskResult,
    ) -> Result<TaskStatus, ProcessorError> {
        let Some(job_type) = job.job_type() else {
            debug!(job_id = %job.identity, "Job has no type, result passes through");
            return Ok(result.status);
        };

        // Both lookups go first so an ambiguous job type fails before any side effect.
        let result_processor = self.result_processor(job_type)?;
        let terminate_processor = if result.status.is_terminal() {
            self.terminate_processor(job_type)?
        } else {
            None
        };

        if let Some(processor) = result_processor {
            processor.process(result).await?;
        }

        if !result.status.is_terminal() {
            return Ok(result.status);
        }

        match terminate_processor {
            Some(processor) => {
                processor.process(task, job).await?;
                let status = processor.correct_task_status(task, job, result.status);
                if status != result.status {
                    debug!(
                        job_id = %job.identity,
                        from = %result.status,
                        to = %status,
                        "Task status corrected"
                    );
                }
                Ok(status)
            }
            None => Ok(result.status),
        }
    }
}

fn pick<P: ?Sized>(
    kind: &'static str,
    job_type: &str,
    mut matches: Vec<Arc<P>>,
) -> Result<Option<Arc<P>>, ProcessorError> {
    match matches.len() {
        0 | 1 => Ok(matches.pop()),
        count => Err(ProcessorError::Ambiguous {
            kind,
            job_type: job_type.to_string(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tasklane_protocol::model::JOB_TYPE_PROPERTY;

    struct CountingResult {
        job_type: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResultProcessor for CountingResult {
        fn interested(&self, job_type: &str) -> bool {
            job_type == self.job_type
        }

        async fn process(&self, _result: &TaskResult) -> Result<(), ProcessorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Reports failed runs as abnormal.
    struct AbnormalOnFailure {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TerminateProcessor for AbnormalOnFailure {
        fn interested(&self, job_type: &str) -> bool {
            job_type == "DLM"
        }

        async fn process(&self, _task: &ScheduleTask, _job: &JobDescriptor) -> Result<(), ProcessorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn correct_task_status(
            &self,
            _task: &ScheduleTask,
            _job: &JobDescriptor,
            status: TaskStatus,
        ) -> TaskStatus {
            match status {
                TaskStatus::Failed => TaskStatus::Abnormal,
                other => other,
            }
        }
    }

    fn dlm_job() -> JobDescriptor {
        JobDescriptor::new(JobIdentity::new(1), "DataLifecycleJob")
            .with_property(JOB_TYPE_PROPERTY, "DLM")
    }

    fn task() -> ScheduleTask {
        ScheduleTask {
            id: 10,
            job: JobIdentity::new(1),
            status: TaskStatus::Running,
        }
    }

    fn result(status: TaskStatus) -> TaskResult {
        TaskResult {
            job: JobIdentity::new(1),
            status,
            payload: serde_json::json!({"rows": 42}),
        }
    }

    fn counting(job_type: &'static str) -> Arc<CountingResult> {
        Arc::new(CountingResult {
            job_type,
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_two_interested_processors_are_ambiguous() {
        let mut registry = ProcessorRegistry::new();
        registry.register_result_processor(counting("DLM"));
        registry.register_result_processor(counting("DLM"));

        let err = registry.validate(["DLM"]).unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::Ambiguous { ref job_type, count: 2, .. } if job_type == "DLM"
        ));
        assert!(registry.validate(["OTHER"]).is_ok());
    }

    #[tokio::test]
    async fn test_ambiguity_is_raised_at_dispatch() {
        let mut registry = ProcessorRegistry::new();
        registry.register_result_processor(counting("DLM"));
        registry.register_result_processor(counting("DLM"));

        let outcome = registry
            .handle_result(&task(), &dlm_job(), &result(TaskStatus::Done))
            .await;

        assert!(matches!(outcome, Err(ProcessorError::Ambiguous { .. })));
    }

    #[tokio::test]
    async fn test_ambiguous_terminate_processors_fail_before_result_processing() {
        let processor = counting("DLM");
        let mut registry = ProcessorRegistry::new();
        registry.register_result_processor(processor.clone());
        for _ in 0..2 {
            registry.register_terminate_processor(Arc::new(AbnormalOnFailure {
                calls: AtomicUsize::new(0),
            }));
        }

        let outcome = registry
            .handle_result(&task(), &dlm_job(), &result(TaskStatus::Done))
            .await;

        assert!(matches!(
            outcome,
            Err(ProcessorError::Ambiguous { kind: "terminate", .. })
        ));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unclaimed_job_type_is_noop() {
        let registry = ProcessorRegistry::new();

        let status = registry
            .handle_result(&task(), &dlm_job(), &result(TaskStatus::Failed))
            .await
            .unwrap();

        assert_eq!(status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_terminal_result_runs_terminate_processor() {
        let processor = counting("DLM");
        let terminate = Arc::new(AbnormalOnFailure {
            calls: AtomicUsize::new(0),
        });
        let mut registry = ProcessorRegistry::new();
        registry.register_result_processor(processor.clone());
        registry.register_terminate_processor(terminate.clone());

        let running = registry
            .handle_result(&task(), &dlm_job(), &result(TaskStatus::Running))
            .await
            .unwrap();
        assert_eq!(running, TaskStatus::Running);
        assert_eq!(terminate.calls.load(Ordering::SeqCst), 0);

        let failed = registry
            .handle_result(&task(), &dlm_job(), &result(TaskStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed, TaskStatus::Abnormal);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(terminate.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Preparing.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        for status in [
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Canceled,
            TaskStatus::Abnormal,
        ] {
            assert!(status.is_terminal());
        }
    }
}
