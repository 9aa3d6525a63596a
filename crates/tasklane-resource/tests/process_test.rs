// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process backend tests against real child processes.

use std::path::PathBuf;
use std::time::Duration;

use tasklane_resource::{
    ProcessOperatorConfig, ProcessResourceOperatorBuilder, ResourceKind, ResourceLocation,
    ResourceManager, ResourceSpec, ResourceState,
};

macro_rules! skip_if_no_program {
    ($program:expr) => {
        if !program_available($program) {
            eprintln!("Skipping test: {} not available", $program);
            return;
        }
    };
}

fn program_available(program: &str) -> bool {
    std::process::Command::new("which")
        .arg(program)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn manager(program: &str, args: &[&str]) -> ResourceManager {
    let config = ProcessOperatorConfig {
        program: PathBuf::from(program),
        args: args.iter().map(|a| a.to_string()).collect(),
        stop_grace: Duration::from_secs(2),
        ..Default::default()
    };
    ResourceManager::new(vec![std::sync::Arc::new(ProcessResourceOperatorBuilder::new(
        config,
    ))])
}

fn spec(name: &str) -> ResourceSpec {
    ResourceSpec::new(
        ResourceKind::Process,
        ResourceLocation::new("local", "default"),
        name,
    )
    .with_heap(64, 128)
}

// ========== Lifecycle Tests ==========

#[tokio::test]
async fn test_create_query_destroy() {
    skip_if_no_program!("sleep");
    let manager = manager("sleep", &["30"]);

    let resource = manager.create(&spec("executor-1")).await.unwrap();
    assert_eq!(resource.state, ResourceState::Running);
    assert_eq!(resource.host.as_deref(), Some("127.0.0.1"));
    assert!(resource.port.is_some());
    assert!(resource.id.name.parse::<i32>().unwrap() > 0);

    let seen = manager.query(&resource.id).await.unwrap().unwrap();
    assert_eq!(seen.state, ResourceState::Running);

    manager.destroy(&resource.id).await.unwrap();
    assert!(manager.query(&resource.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_destroy_twice_is_ok() {
    skip_if_no_program!("sleep");
    let manager = manager("sleep", &["30"]);

    let resource = manager.create(&spec("executor-2")).await.unwrap();
    manager.destroy(&resource.id).await.unwrap();
    assert!(manager.release(&resource.id).await);
}

#[tokio::test]
async fn test_exit_status_maps_to_state() {
    skip_if_no_program!("sh");
    let ok = manager("sh", &["-c", "exit 0"]);
    let failing = manager("sh", &["-c", "exit 3"]);

    let exited = ok.create(&spec("ok")).await.unwrap();
    let failed = failing.create(&spec("bad")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        ok.query(&exited.id).await.unwrap().unwrap().state,
        ResourceState::Exited
    );
    assert_eq!(
        failing.query(&failed.id).await.unwrap().unwrap().state,
        ResourceState::Failed
    );
}

#[tokio::test]
async fn test_query_reports_spawn_time() {
    skip_if_no_program!("sleep");
    let manager = manager("sleep", &["30"]);

    let resource = manager.create(&spec("executor-3")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen = manager.query(&resource.id).await.unwrap().unwrap();

    assert_eq!(seen.created_at, resource.created_at);
    manager.destroy(&resource.id).await.unwrap();
}

#[tokio::test]
async fn test_release_forgets_exited_process() {
    skip_if_no_program!("sh");
    let manager = manager("sh", &["-c", "exit 0"]);

    let resource = manager.create(&spec("short-lived")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        manager.query(&resource.id).await.unwrap().unwrap().state,
        ResourceState::Exited
    );

    assert!(manager.release(&resource.id).await);
    assert!(manager.query(&resource.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_program_fails_creation() {
    let manager = manager("/nonexistent/tasklane-executor", &[]);
    let result = manager.create(&spec("nothing")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_pod_kind_is_unsupported() {
    let manager = manager("sleep", &["1"]);
    let spec = ResourceSpec::new(
        ResourceKind::Pod,
        ResourceLocation::new("local", "default"),
        "pod",
    );
    assert!(manager.create(&spec).await.is_err());
    assert_eq!(manager.supported_kinds(), vec![ResourceKind::Process]);
}
