// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for the supervisor command server over QUIC loopback.

mod common;

use std::sync::Arc;

use common::{RecordingExecutor, client, start_supervisor};
use tasklane_protocol::{ClientError, Command, JobDescriptor, JobIdentity, ProcessConfig};
use tasklane_resource::{
    MockResourceOperator, MockResourceOperatorBuilder, ResourceKind, ResourceLocation,
    ResourceManager,
};
use tasklane_supervisor::DefaultTaskCommandExecutor;

fn job(id: i64) -> JobDescriptor {
    JobDescriptor::new(JobIdentity::new(id), "DataTransferJob")
        .with_parameter("source", "pg://orders")
        .with_parameter("target", "s3://archive")
        .with_property("jobType", "DLM")
        .with_candidate_host("10.0.0.5")
}

// ========== Built-in Command Tests ==========

#[tokio::test]
async fn test_heartbeat_does_not_reach_executor() {
    let executor = Arc::new(RecordingExecutor::default());
    let (runtime, endpoint) = start_supervisor(executor.clone()).await;

    let body = client()
        .send_command(&endpoint, &Command::heartbeat())
        .await
        .unwrap();

    assert_eq!(body, "true");
    assert!(client().is_supervisor_alive(&endpoint).await);
    assert_eq!(executor.count().await, 0);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mem_info_is_parseable() {
    let executor = Arc::new(RecordingExecutor::default());
    let (runtime, endpoint) = start_supervisor(executor.clone()).await;

    let info = client().mem_info(&endpoint).await.unwrap();

    assert!(info.total_memory_mb > 0);
    assert!(info.cpu_count > 0);
    assert_eq!(executor.count().await, 0);
    runtime.shutdown().await.unwrap();
}

// ========== Job Command Tests ==========

#[tokio::test]
async fn test_start_ack_and_job_arrives_intact() {
    let executor = Arc::new(RecordingExecutor::default());
    let (runtime, endpoint) = start_supervisor(executor.clone()).await;
    let sent = job(42);

    let ack = client()
        .send_command(&endpoint, &Command::start(sent.clone(), ProcessConfig::default()))
        .await
        .unwrap();

    assert_eq!(ack, "start");
    assert_eq!(executor.received_jobs().await, vec![sent]);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_executor_error_becomes_error_frame() {
    let executor = Arc::new(RecordingExecutor::failing("job class not found"));
    let (runtime, endpoint) = start_supervisor(executor).await;

    let result = client()
        .send_command(&endpoint, &Command::start(job(1), ProcessConfig::default()))
        .await;

    match result {
        Err(ClientError::Remote(message)) => assert!(message.contains("job class not found")),
        other => panic!("expected remote error, got {:?}", other),
    }

    // The server keeps serving after a failed command.
    assert!(client().is_supervisor_alive(&endpoint).await);
    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_callers_are_served_independently() {
    let executor = Arc::new(RecordingExecutor::default());
    let (runtime, endpoint) = start_supervisor(executor.clone()).await;
    let client = Arc::new(client());

    let calls = (0..10).map(|i| {
        let client = client.clone();
        let endpoint = endpoint.clone();
        async move {
            client
                .send_command(&endpoint, &Command::start(job(i), ProcessConfig::default()))
                .await
        }
    });
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(|r| matches!(r, Ok(body) if body == "start")));
    assert_eq!(executor.count().await, 10);
    runtime.shutdown().await.unwrap();
}

// ========== Default Executor Tests ==========

#[tokio::test]
async fn test_full_lifecycle_with_default_executor() {
    let operator =
        Arc::new(MockResourceOperator::new(ResourceKind::Process).with_endpoint("10.0.0.9", 7000));
    let manager = Arc::new(ResourceManager::new(vec![Arc::new(
        MockResourceOperatorBuilder::new(ResourceKind::Process, operator.clone()),
    )]));
    let executor = Arc::new(DefaultTaskCommandExecutor::new(
        manager,
        ResourceKind::Process,
        ResourceLocation::new("local", "default"),
        9100,
    ));
    let (runtime, endpoint) = start_supervisor(executor).await;
    let client = client();
    let id = JobIdentity::new(77);

    let executor_endpoint = client
        .start_task(&endpoint, &job(77), &ProcessConfig::default())
        .await
        .unwrap();
    assert_eq!(executor_endpoint.host, "10.0.0.9");
    assert_eq!(executor_endpoint.executor_port, 7000);
    assert!(client.is_task_alive(&endpoint, id, Some(&executor_endpoint)).await.unwrap());

    assert!(matches!(
        client.send_command(&endpoint, &Command::start(job(77), ProcessConfig::default())).await,
        Err(ClientError::Remote(_))
    ));

    assert_eq!(client.stop_task(&endpoint, id, Some(&executor_endpoint)).await.unwrap(), "stop");
    assert!(!client.is_task_alive(&endpoint, id, None).await.unwrap());
    assert_eq!(client.finish_task(&endpoint, id, None).await.unwrap(), "finish");

    match client.query_task(&endpoint, id, None).await {
        Err(ClientError::Remote(message)) => assert!(message.contains("unknown job")),
        other => panic!("expected unknown job, got {:?}", other),
    }
    assert_eq!(operator.create_count(), 1);
    runtime.shutdown().await.unwrap();
}
