// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain types carried by the command protocol.
//!
//! These are the types callers and supervisors work with; the [`crate::proto`]
//! messages are only the wire encoding.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proto;
pub use crate::proto::CommandType;

/// Errors raised while turning wire messages into commands.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("unknown command type: {0}")]
    UnknownCommandType(i32),

    #[error("missing payload for {0} command")]
    MissingPayload(&'static str),

    #[error("malformed command: {0}")]
    MalformedCommand(String),
}

/// Unique identity of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobIdentity(i64);

impl JobIdentity {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobIdentity {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Immutable description of a runnable unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub identity: JobIdentity,
    /// Name of the job implementation the executor should run.
    pub implementation_ref: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Hosts the job may run on, in order of preference.
    #[serde(default)]
    pub candidate_hosts: Vec<String>,
}

/// Property key holding the job type used for processor dispatch.
pub const JOB_TYPE_PROPERTY: &str = "jobType";

impl JobDescriptor {
    pub fn new(identity: JobIdentity, implementation_ref: impl Into<String>) -> Self {
        Self {
            identity,
            implementation_ref: implementation_ref.into(),
            parameters: BTreeMap::new(),
            properties: BTreeMap::new(),
            candidate_hosts: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_candidate_host(mut self, host: impl Into<String>) -> Self {
        self.candidate_hosts.push(host.into());
        self
    }

    /// The job type, read from the `jobType` property.
    pub fn job_type(&self) -> Option<&str> {
        self.properties.get(JOB_TYPE_PROPERTY).map(String::as_str)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.implementation_ref.trim().is_empty() {
            return Err(ProtocolError::MalformedCommand(format!(
                "job {} has no implementation reference",
                self.identity
            )));
        }
        Ok(())
    }
}

/// Sizing hints for process-backed executors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    pub heap_min_mb: u32,
    pub heap_max_mb: u32,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            heap_min_mb: 256,
            heap_max_mb: 1024,
            environment: BTreeMap::new(),
        }
    }
}

impl ProcessConfig {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.heap_min_mb > self.heap_max_mb {
            return Err(ProtocolError::MalformedCommand(format!(
                "heap min {}MB exceeds heap max {}MB",
                self.heap_min_mb, self.heap_max_mb
            )));
        }
        Ok(())
    }
}

/// Address of a concrete running executor, distinct from its supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorEndpoint {
    pub protocol: String,
    pub host: String,
    pub supervisor_port: u16,
    pub executor_port: u16,
    /// Backend-specific handle (process id, pod name).
    pub identifier: String,
}

/// Address of a long-lived supervisor process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SupervisorEndpoint {
    pub host: String,
    pub port: u16,
}

impl SupervisorEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SupervisorEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// QUERY response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStatus {
    pub endpoint: ExecutorEndpoint,
    pub alive: bool,
}

/// MEM_INFO response body: resource utilization on the supervisor host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub free_memory_mb: u64,
    pub process_memory_mb: u64,
    pub cpu_count: usize,
    pub running_jobs: usize,
}

impl CommandType {
    /// Symbolic upper-case name.
    pub fn name(&self) -> &'static str {
        match self {
            CommandType::Unspecified => "UNSPECIFIED",
            CommandType::Start => "START",
            CommandType::Stop => "STOP",
            CommandType::Query => "QUERY",
            CommandType::Finish => "FINISH",
            CommandType::Heartbeat => "HEARTBEAT",
            CommandType::MemInfo => "MEM_INFO",
        }
    }

    /// Acknowledgement token returned when a command succeeds: the name in lower case.
    pub fn ack(&self) -> String {
        self.name().to_lowercase()
    }

    /// Commands that address a job (everything but HEARTBEAT and MEM_INFO).
    pub fn is_job_command(&self) -> bool {
        !matches!(
            self,
            CommandType::Heartbeat | CommandType::MemInfo | CommandType::Unspecified
        )
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type-specific command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPayload {
    Start {
        job: JobDescriptor,
        process: ProcessConfig,
    },
    Executor(ExecutorEndpoint),
    Empty,
}

/// One command sent to a supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    command_type: CommandType,
    job_identity: JobIdentity,
    payload: CommandPayload,
}

impl Command {
    pub fn start(job: JobDescriptor, process: ProcessConfig) -> Self {
        Self {
            command_type: CommandType::Start,
            job_identity: job.identity,
            payload: CommandPayload::Start { job, process },
        }
    }

    pub fn stop(job_identity: JobIdentity, executor: Option<ExecutorEndpoint>) -> Self {
        Self::lifecycle(CommandType::Stop, job_identity, executor)
    }

    pub fn query(job_identity: JobIdentity, executor: Option<ExecutorEndpoint>) -> Self {
        Self::lifecycle(CommandType::Query, job_identity, executor)
    }

    pub fn finish(job_identity: JobIdentity, executor: Option<ExecutorEndpoint>) -> Self {
        Self::lifecycle(CommandType::Finish, job_identity, executor)
    }

    pub fn heartbeat() -> Self {
        Self {
            command_type: CommandType::Heartbeat,
            job_identity: JobIdentity::new(0),
            payload: CommandPayload::Empty,
        }
    }

    pub fn mem_info() -> Self {
        Self {
            command_type: CommandType::MemInfo,
            job_identity: JobIdentity::new(0),
            payload: CommandPayload::Empty,
        }
    }

    fn lifecycle(
        command_type: CommandType,
        job_identity: JobIdentity,
        executor: Option<ExecutorEndpoint>,
    ) -> Self {
        Self {
            command_type,
            job_identity,
            payload: executor.map_or(CommandPayload::Empty, CommandPayload::Executor),
        }
    }

    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    pub fn job_identity(&self) -> JobIdentity {
        self.job_identity
    }

    pub fn payload(&self) -> &CommandPayload {
        &self.payload
    }

    pub fn executor(&self) -> Option<&ExecutorEndpoint> {
        match &self.payload {
            CommandPayload::Executor(endpoint) => Some(endpoint),
            _ => None,
        }
    }
}

// ========== Wire conversions ==========

impl From<&JobDescriptor> for proto::JobDescriptor {
    fn from(job: &JobDescriptor) -> Self {
        Self {
            identity: job.identity.get(),
            implementation_ref: job.implementation_ref.clone(),
            parameters: job.parameters.clone(),
            properties: job.properties.clone(),
            candidate_hosts: job.candidate_hosts.clone(),
        }
    }
}

impl From<proto::JobDescriptor> for JobDescriptor {
    fn from(job: proto::JobDescriptor) -> Self {
        Self {
            identity: JobIdentity::new(job.identity),
            implementation_ref: job.implementation_ref,
            parameters: job.parameters,
            properties: job.properties,
            candidate_hosts: job.candidate_hosts,
        }
    }
}

impl From<&ProcessConfig> for proto::ProcessConfig {
    fn from(config: &ProcessConfig) -> Self {
        Self {
            heap_min_mb: config.heap_min_mb,
            heap_max_mb: config.heap_max_mb,
            environment: config.environment.clone(),
        }
    }
}

impl From<proto::ProcessConfig> for ProcessConfig {
    fn from(config: proto::ProcessConfig) -> Self {
        Self {
            heap_min_mb: config.heap_min_mb,
            heap_max_mb: config.heap_max_mb,
            environment: config.environment,
        }
    }
}

impl From<&ExecutorEndpoint> for proto::ExecutorEndpoint {
    fn from(endpoint: &ExecutorEndpoint) -> Self {
        Self {
            protocol: endpoint.protocol.clone(),
            host: endpoint.host.clone(),
            supervisor_port: endpoint.supervisor_port.into(),
            executor_port: endpoint.executor_port.into(),
            identifier: endpoint.identifier.clone(),
        }
    }
}

impl TryFrom<proto::ExecutorEndpoint> for ExecutorEndpoint {
    type Error = ProtocolError;

    fn try_from(endpoint: proto::ExecutorEndpoint) -> Result<Self, Self::Error> {
        let port = |value: u32, field: &str| {
            u16::try_from(value).map_err(|_| {
                ProtocolError::MalformedCommand(format!("{field} {value} is not a valid port"))
            })
        };
        Ok(Self {
            supervisor_port: port(endpoint.supervisor_port, "supervisor port")?,
            executor_port: port(endpoint.executor_port, "executor port")?,
            protocol: endpoint.protocol,
            host: endpoint.host,
            identifier: endpoint.identifier,
        })
    }
}

impl From<&Command> for proto::CommandRequest {
    fn from(command: &Command) -> Self {
        use proto::command_request::Payload;

        let payload = match &command.payload {
            CommandPayload::Start { job, process } => Some(Payload::Start(proto::StartPayload {
                job: Some(job.into()),
                process: Some(process.into()),
            })),
            CommandPayload::Executor(endpoint) => Some(Payload::Executor(endpoint.into())),
            CommandPayload::Empty => None,
        };

        Self {
            command_type: command.command_type as i32,
            job_identity: command.job_identity.get(),
            payload,
        }
    }
}

impl TryFrom<proto::CommandRequest> for Command {
    type Error = ProtocolError;

    fn try_from(request: proto::CommandRequest) -> Result<Self, Self::Error> {
        use proto::command_request::Payload;

        let command_type = CommandType::try_from(request.command_type)
            .map_err(|_| ProtocolError::UnknownCommandType(request.command_type))?;
        let job_identity = JobIdentity::new(request.job_identity);

        let payload = match (command_type, request.payload) {
            (CommandType::Unspecified, _) => {
                return Err(ProtocolError::UnknownCommandType(request.command_type));
            }
            (CommandType::Start, Some(Payload::Start(start))) => {
                let job: JobDescriptor = start
                    .job
                    .ok_or(ProtocolError::MissingPayload("START"))?
                    .into();
                if job.identity != job_identity {
                    return Err(ProtocolError::MalformedCommand(format!(
                        "job descriptor identity {} does not match command identity {}",
                        job.identity, job_identity
                    )));
                }
                let process = start.process.map(ProcessConfig::from).unwrap_or_default();
                CommandPayload::Start { job, process }
            }
            (CommandType::Start, _) => return Err(ProtocolError::MissingPayload("START")),
            (CommandType::Heartbeat | CommandType::MemInfo, _) => CommandPayload::Empty,
            (_, Some(Payload::Executor(endpoint))) => {
                CommandPayload::Executor(endpoint.try_into()?)
            }
            (other, Some(Payload::Start(_))) => {
                return Err(ProtocolError::MalformedCommand(format!(
                    "{other} command cannot carry a start payload"
                )));
            }
            (_, None) => CommandPayload::Empty,
        };

        Ok(Self {
            command_type,
            job_identity,
            payload,
        })
    }
}
