// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tasklane Supervisor
//!
//! A long-lived daemon on an execution host. It accepts commands over the
//! tasklane QUIC protocol and launches job executors through a resource
//! operator (local process or Kubernetes pod).
//!
//! - `HEARTBEAT` and `MEM_INFO` are answered by the server itself.
//! - `START`, `QUERY`, `STOP` and `FINISH` go to a [`TaskCommandExecutor`].
//!
//! The default executor, [`DefaultTaskCommandExecutor`], caches launched
//! executors by job identity.

pub mod config;
pub mod error;
pub mod executor;
pub mod mem_info;
pub mod runtime;
pub mod server;

pub use config::{Config, ConfigError};
pub use error::{JobError, Result, SupervisorError};
pub use executor::{DefaultTaskCommandExecutor, TaskCommandExecutor};
pub use runtime::{SupervisorRuntime, SupervisorRuntimeBuilder};
pub use server::SupervisorHandlerState;
