// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tasklane Protocol - supervisor command protocol
//!
//! Callers talk to supervisors with a strict one-command-per-connection exchange:
//! open a QUIC connection, send one `CommandRequest` frame, read one
//! `CommandResponse` frame, close.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    tasklane-protocol                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Model: JobDescriptor, Command, ExecutorEndpoint, ...       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost) inside length frames       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: QUIC (quinn)                                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Responses
//!
//! | Command      | Response body                               |
//! |--------------|---------------------------------------------|
//! | `START`      | `"start"`                                   |
//! | `QUERY`      | JSON [`model::ExecutorStatus`]              |
//! | `STOP`       | `"stop"`                                    |
//! | `FINISH`     | `"finish"`                                  |
//! | `HEARTBEAT`  | `"true"`                                    |
//! | `MEM_INFO`   | JSON [`model::MemoryInfo`]                  |
//!
//! Failures come back as an error frame whose body is the error message.
//!
//! # Usage
//!
//! ```ignore
//! use tasklane_protocol::{SupervisorClient, SupervisorEndpoint};
//!
//! let client = SupervisorClient::insecure()?;
//! let target = SupervisorEndpoint::new("10.0.0.7", 9100);
//! if client.is_supervisor_alive(&target).await {
//!     let executor = client.start_task(&target, &job, &ProcessConfig::default()).await?;
//! }
//! ```

pub mod client;
pub mod frame;
pub mod model;
pub mod proto;
pub mod server;

pub use client::{ClientError, SupervisorClient, SupervisorClientConfig};
pub use frame::{Frame, FrameError, MessageType};
pub use model::{
    Command, CommandPayload, CommandType, ExecutorEndpoint, ExecutorStatus, JobDescriptor,
    JobIdentity, MemoryInfo, ProcessConfig, ProtocolError, SupervisorEndpoint,
};
pub use server::{
    ConnectionHandler, EXTRA_STREAM_ERROR_CODE, ServerError, StreamHandler, SupervisorServer,
    SupervisorServerConfig,
};
