// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor liveness probes.

use std::time::Duration;

use async_trait::async_trait;
use tasklane_protocol::{ClientError, SupervisorClient, SupervisorClientConfig, SupervisorEndpoint};

/// Answers whether a supervisor responds to heartbeats.
#[async_trait]
pub trait SupervisorProbe: Send + Sync {
    async fn is_alive(&self, endpoint: &SupervisorEndpoint) -> bool;
}

/// Probe sending a HEARTBEAT command over the supervisor protocol.
pub struct HeartbeatProbe {
    client: SupervisorClient,
}

impl HeartbeatProbe {
    pub fn new(client: SupervisorClient) -> Self {
        Self { client }
    }

    /// A probe trusting self-signed supervisor certificates, with each
    /// heartbeat bounded by `timeout`.
    pub fn insecure(timeout: Duration) -> Result<Self, ClientError> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let client = SupervisorClient::new(SupervisorClientConfig {
            dangerous_skip_cert_verification: true,
            connect_timeout_ms: timeout_ms,
            request_timeout_ms: timeout_ms,
            ..Default::default()
        })?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl SupervisorProbe for HeartbeatProbe {
    async fn is_alive(&self, endpoint: &SupervisorEndpoint) -> bool {
        self.client.is_supervisor_alive(endpoint).await
    }
}
