// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for supervisor integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tasklane_protocol::{
    Command, CommandPayload, CommandType, JobDescriptor, SupervisorClient, SupervisorClientConfig,
    SupervisorEndpoint,
};
use tasklane_supervisor::{JobError, SupervisorRuntime, TaskCommandExecutor};
use tokio::sync::Mutex;

/// Executor that records every command it receives.
#[derive(Default)]
pub struct RecordingExecutor {
    pub commands: Mutex<Vec<Command>>,
    pub fail_with: Option<String>,
}

impl RecordingExecutor {
    pub fn failing(message: &str) -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            fail_with: Some(message.to_string()),
        }
    }

    pub async fn received_jobs(&self) -> Vec<JobDescriptor> {
        self.commands
            .lock()
            .await
            .iter()
            .filter_map(|c| match c.payload() {
                CommandPayload::Start { job, .. } => Some(job.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.commands.lock().await.len()
    }
}

#[async_trait]
impl TaskCommandExecutor for RecordingExecutor {
    async fn on_command(&self, command: Command) -> Result<String, JobError> {
        let command_type = command.command_type();
        self.commands.lock().await.push(command);
        if let Some(message) = &self.fail_with {
            return Err(JobError::Malformed(message.clone()));
        }
        Ok(match command_type {
            CommandType::Query => "{}".to_string(),
            other => other.ack(),
        })
    }
}

/// Start a supervisor on an ephemeral loopback port.
pub async fn start_supervisor(
    executor: Arc<dyn TaskCommandExecutor>,
) -> (SupervisorRuntime, SupervisorEndpoint) {
    let runtime = SupervisorRuntime::builder()
        .executor(executor)
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    let endpoint = SupervisorEndpoint::new("127.0.0.1", runtime.local_addr().port());
    (runtime, endpoint)
}

pub fn client() -> SupervisorClient {
    SupervisorClient::new(SupervisorClientConfig {
        dangerous_skip_cert_verification: true,
        request_timeout_ms: 10_000,
        ..Default::default()
    })
    .unwrap()
}
