// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process backend.
//!
//! Spawns the configured executor program as a child process. The process id is
//! the resource name, so a restarted supervisor can still signal processes it
//! launched earlier.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ResourceError, Result};
use crate::traits::{
    Resource, ResourceId, ResourceKind, ResourceLocation, ResourceOperator,
    ResourceOperatorBuilder, ResourceSpec, ResourceState,
};

/// Namespace recorded in process resource ids.
pub const PROCESS_NAMESPACE: &str = "local";

/// Environment variables handed to every spawned executor.
pub const ENV_HEAP_MIN_MB: &str = "TASKLANE_HEAP_MIN_MB";
pub const ENV_HEAP_MAX_MB: &str = "TASKLANE_HEAP_MAX_MB";
pub const ENV_EXECUTOR_PORT: &str = "TASKLANE_EXECUTOR_PORT";
pub const ENV_RESOURCE_NAME: &str = "TASKLANE_RESOURCE_NAME";

/// Configuration for the process backend.
#[derive(Debug, Clone)]
pub struct ProcessOperatorConfig {
    /// Executable to launch.
    pub program: PathBuf,
    /// Arguments passed before anything job-specific.
    pub args: Vec<String>,
    /// Host reported for spawned processes.
    pub advertise_host: String,
    /// Working directory (inherits the supervisor's when `None`).
    pub working_dir: Option<PathBuf>,
    /// Time between SIGTERM and SIGKILL on delete.
    pub stop_grace: Duration,
}

impl Default for ProcessOperatorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("tasklane-executor"),
            args: Vec::new(),
            advertise_host: "127.0.0.1".to_string(),
            working_dir: None,
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// A spawned child and the time it was launched.
struct TrackedChild {
    child: Child,
    created_at: DateTime<Utc>,
}

type ChildTable = Arc<Mutex<HashMap<i32, TrackedChild>>>;

/// Builder for [`ProcessResourceOperator`]. Always supported.
pub struct ProcessResourceOperatorBuilder {
    config: ProcessOperatorConfig,
    children: ChildTable,
}

impl ProcessResourceOperatorBuilder {
    pub fn new(config: ProcessOperatorConfig) -> Self {
        Self {
            config,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl ResourceOperatorBuilder for ProcessResourceOperatorBuilder {
    fn name(&self) -> &'static str {
        "process"
    }

    fn supports(&self, kind: ResourceKind) -> bool {
        kind == ResourceKind::Process
    }

    fn build(&self, location: &ResourceLocation) -> Result<Arc<dyn ResourceOperator>> {
        Ok(Arc::new(ProcessResourceOperator {
            config: self.config.clone(),
            location: location.clone(),
            children: self.children.clone(),
        }))
    }
}

/// Operator that manages local child processes.
pub struct ProcessResourceOperator {
    config: ProcessOperatorConfig,
    location: ResourceLocation,
    children: ChildTable,
}

impl ProcessResourceOperator {
    fn resource_id(&self, pid: i32) -> ResourceId {
        ResourceId::new(
            ResourceKind::Process,
            self.location.clone(),
            PROCESS_NAMESPACE,
            pid.to_string(),
        )
    }

    fn parse_pid(id: &ResourceId) -> Result<i32> {
        if id.kind != ResourceKind::Process {
            return Err(ResourceError::InvalidId(id.to_string()));
        }
        id.name
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| ResourceError::InvalidId(id.to_string()))
    }

    /// Ask the kernel whether `pid` still exists (signal 0).
    fn pid_exists(pid: i32) -> bool {
        match signal::kill(Pid::from_raw(pid), None::<Signal>) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Reserve a free TCP port for the executor by binding port 0.
    fn free_port() -> Result<u16> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        Ok(listener.local_addr()?.port())
    }
}

#[async_trait]
impl ResourceOperator for ProcessResourceOperator {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Process
    }

    async fn create(&self, spec: &ResourceSpec) -> Result<Resource> {
        let port = match spec.port {
            Some(port) => port,
            None => Self::free_port()?,
        };

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .envs(&spec.env)
            .env(ENV_EXECUTOR_PORT, port.to_string())
            .env(ENV_RESOURCE_NAME, &spec.name)
            .stdin(Stdio::null())
            .kill_on_drop(false);
        if let Some(min) = spec.heap_min_mb {
            command.env(ENV_HEAP_MIN_MB, min.to_string());
        }
        if let Some(max) = spec.heap_max_mb {
            command.env(ENV_HEAP_MAX_MB, max.to_string());
        }
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            ResourceError::CreateFailed(format!(
                "failed to spawn {}: {}",
                self.config.program.display(),
                e
            ))
        })?;
        let pid = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .ok_or_else(|| ResourceError::CreateFailed("spawned process has no pid".to_string()))?;

        let created_at = Utc::now();
        self.children
            .lock()
            .await
            .insert(pid, TrackedChild { child, created_at });
        info!(pid, name = %spec.name, port, "Spawned executor process");

        Ok(Resource {
            id: self.resource_id(pid),
            state: ResourceState::Running,
            host: Some(self.config.advertise_host.clone()),
            port: Some(port),
            created_at,
        })
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<Resource>> {
        let pid = Self::parse_pid(id)?;

        // Processes from an earlier supervisor run have no recorded spawn time.
        let (state, created_at) = {
            let mut children = self.children.lock().await;
            match children.get_mut(&pid) {
                Some(tracked) => {
                    let state = match tracked.child.try_wait()? {
                        None => ResourceState::Running,
                        Some(status) if status.success() => ResourceState::Exited,
                        Some(_) => ResourceState::Failed,
                    };
                    (state, tracked.created_at)
                }
                None if Self::pid_exists(pid) => (ResourceState::Running, Utc::now()),
                None => return Ok(None),
            }
        };

        Ok(Some(Resource {
            id: id.clone(),
            state,
            host: Some(self.config.advertise_host.clone()),
            port: None,
            created_at,
        }))
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let pid = Self::parse_pid(id)?;
        let child = self.children.lock().await.remove(&pid).map(|t| t.child);

        match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => debug!(pid, "Sent SIGTERM to executor process"),
            Err(nix::errno::Errno::ESRCH) => {
                debug!(pid, "Process already gone");
                if let Some(mut child) = child {
                    let _ = child.wait().await;
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let exited = match child {
            Some(mut child) => tokio::time::timeout(self.config.stop_grace, child.wait())
                .await
                .is_ok_and(|status| status.is_ok()),
            None => {
                let deadline = tokio::time::Instant::now() + self.config.stop_grace;
                while Self::pid_exists(pid) && tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                !Self::pid_exists(pid)
            }
        };

        if !exited {
            warn!(pid, "Process ignored SIGTERM, sending SIGKILL");
            match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(pid, "Executor process stopped");
        Ok(())
    }
}
