// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor command server.
//!
//! Reads the one command a connection carries, answers HEARTBEAT and MEM_INFO itself and
//! routes everything else to the [`TaskCommandExecutor`]. Failures go back to
//! the caller as error frames.

use std::sync::Arc;

use tasklane_protocol::{
    Command, CommandType, ConnectionHandler, ServerError, StreamHandler, SupervisorServer,
};
use tracing::{debug, error, warn};

use crate::error::JobError;
use crate::executor::TaskCommandExecutor;
use crate::mem_info::collect_memory_info;

/// Body returned for HEARTBEAT.
pub const HEARTBEAT_RESPONSE: &str = "true";

/// Shared state for connection handlers.
pub struct SupervisorHandlerState {
    executor: Arc<dyn TaskCommandExecutor>,
}

impl SupervisorHandlerState {
    pub fn new(executor: Arc<dyn TaskCommandExecutor>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Arc<dyn TaskCommandExecutor> {
        &self.executor
    }
}

/// Serve connections until the server is closed.
pub async fn run_supervisor_server(
    server: Arc<SupervisorServer>,
    state: Arc<SupervisorHandlerState>,
) -> Result<(), ServerError> {
    server
        .run(move |conn: ConnectionHandler| {
            let state = state.clone();
            async move {
                handle_connection(conn, state).await;
            }
        })
        .await
}

/// Handle a single connection.
pub async fn handle_connection(conn: ConnectionHandler, state: Arc<SupervisorHandlerState>) {
    debug!(remote = %conn.remote_address(), "New supervisor connection accepted");

    conn.serve(|stream: StreamHandler| async move {
        if let Err(e) = handle_stream(stream, state).await {
            error!("Stream error: {}", e);
        }
    })
    .await;

    debug!("Supervisor connection closed");
}

/// Handle the command stream (one command, one response).
async fn handle_stream(
    mut stream: StreamHandler,
    state: Arc<SupervisorHandlerState>,
) -> Result<(), ServerError> {
    let outcome = match stream.read_command().await? {
        Ok(command) => {
            let command_type = command.command_type();
            let job_id = command.job_identity();
            debug!(command = %command_type, job_id = %job_id, "Received command");

            dispatch(&state, command).await.map_err(|e| {
                warn!(command = %command_type, job_id = %job_id, error = %e, "Command failed");
                e.to_string()
            })
        }
        Err(e) => {
            warn!(error = %e, "Rejected malformed command");
            Err(e.to_string())
        }
    };

    stream.respond(outcome).await
}

/// Route one decoded command.
pub async fn dispatch(state: &SupervisorHandlerState, command: Command) -> Result<String, JobError> {
    match command.command_type() {
        CommandType::Heartbeat => Ok(HEARTBEAT_RESPONSE.to_string()),
        CommandType::MemInfo => {
            let running_jobs = state.executor.running_jobs();
            let info = tokio::task::spawn_blocking(move || collect_memory_info(running_jobs))
                .await
                .map_err(|e| JobError::Internal(format!("memory snapshot failed: {e}")))?;
            Ok(serde_json::to_string(&info)?)
        }
        _ => state.executor.on_command(command).await,
    }
}
