// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf messages of the supervisor command protocol.
//!
//! Equivalent `.proto` definition (package `tasklane.command`):
//!
//! ```text
//! enum CommandType {
//!   COMMAND_TYPE_UNSPECIFIED = 0; START = 1; STOP = 2; QUERY = 3;
//!   FINISH = 4; HEARTBEAT = 5; MEM_INFO = 6;
//! }
//! message JobDescriptor {
//!   int64 identity = 1; string implementation_ref = 2;
//!   map<string, string> parameters = 3; map<string, string> properties = 4;
//!   repeated string candidate_hosts = 5;
//! }
//! message ProcessConfig {
//!   uint32 heap_min_mb = 1; uint32 heap_max_mb = 2; map<string, string> environment = 3;
//! }
//! message ExecutorEndpoint {
//!   string protocol = 1; string host = 2; uint32 supervisor_port = 3;
//!   uint32 executor_port = 4; string identifier = 5;
//! }
//! message StartPayload { JobDescriptor job = 1; ProcessConfig process = 2; }
//! message CommandRequest {
//!   CommandType command_type = 1; int64 job_identity = 2;
//!   oneof payload { StartPayload start = 3; ExecutorEndpoint executor = 4; }
//! }
//! message CommandResponse { string body = 1; }
//! ```

use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CommandType {
    Unspecified = 0,
    Start = 1,
    Stop = 2,
    Query = 3,
    Finish = 4,
    Heartbeat = 5,
    MemInfo = 6,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobDescriptor {
    #[prost(int64, tag = "1")]
    pub identity: i64,
    #[prost(string, tag = "2")]
    pub implementation_ref: String,
    #[prost(btree_map = "string, string", tag = "3")]
    pub parameters: BTreeMap<String, String>,
    #[prost(btree_map = "string, string", tag = "4")]
    pub properties: BTreeMap<String, String>,
    #[prost(string, repeated, tag = "5")]
    pub candidate_hosts: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProcessConfig {
    #[prost(uint32, tag = "1")]
    pub heap_min_mb: u32,
    #[prost(uint32, tag = "2")]
    pub heap_max_mb: u32,
    #[prost(btree_map = "string, string", tag = "3")]
    pub environment: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutorEndpoint {
    #[prost(string, tag = "1")]
    pub protocol: String,
    #[prost(string, tag = "2")]
    pub host: String,
    #[prost(uint32, tag = "3")]
    pub supervisor_port: u32,
    #[prost(uint32, tag = "4")]
    pub executor_port: u32,
    #[prost(string, tag = "5")]
    pub identifier: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartPayload {
    #[prost(message, optional, tag = "1")]
    pub job: Option<JobDescriptor>,
    #[prost(message, optional, tag = "2")]
    pub process: Option<ProcessConfig>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandRequest {
    #[prost(enumeration = "CommandType", tag = "1")]
    pub command_type: i32,
    #[prost(int64, tag = "2")]
    pub job_identity: i64,
    #[prost(oneof = "command_request::Payload", tags = "3, 4")]
    pub payload: Option<command_request::Payload>,
}

pub mod command_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "3")]
        Start(super::StartPayload),
        #[prost(message, tag = "4")]
        Executor(super::ExecutorEndpoint),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandResponse {
    #[prost(string, tag = "1")]
    pub body: String,
}
