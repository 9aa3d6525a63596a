// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tasklane Allocator
//!
//! Binds jobs to supervisors. Producers file a request through the
//! [`SupervisorAgentAllocator`] façade; the [`ResourceAllocator`] state
//! machine, driven by the [`AllocationSweeper`], either reserves capacity on
//! a live supervisor or has the [`ResourceManageStrategy`] create one, and
//! the producer picks up the bound [`SupervisorEndpoint`](tasklane_protocol::SupervisorEndpoint).
//!
//! State lives in an [`AllocationStore`] (PostgreSQL or SQLite). Results and
//! terminations of finished jobs are routed through the [`ProcessorRegistry`].

pub mod allocator;
pub mod config;
pub mod error;
pub mod facade;
pub mod migrations;
pub mod model;
pub mod probe;
pub mod processor;
pub mod runtime;
pub mod store;
pub mod strategy;
pub mod sweeper;

pub use allocator::{AllocatorConfig, ResourceAllocator, SweepReport};
pub use config::{Config, ConfigError};
pub use error::{AllocationError, ProcessorError, Result, StoreError};
pub use facade::SupervisorAgentAllocator;
pub use model::{
    AllocateState, AllocationRecord, BindOutcome, EndpointStatus, LoadReservation,
    NewSupervisorEndpoint, SupervisorEndpointRecord, UsageState,
};
pub use probe::{HeartbeatProbe, SupervisorProbe};
pub use processor::{
    ProcessorRegistry, ResultProcessor, ScheduleTask, TaskResult, TaskStatus, TerminateProcessor,
};
pub use runtime::{AllocatorRuntime, AllocatorRuntimeBuilder};
pub use store::{AllocationStore, PostgresAllocationStore, SqliteAllocationStore};
pub use strategy::{
    EndpointReadiness, OperatorResourceManageStrategy, ResourceManageStrategy, StrategyConfig,
};
pub use sweeper::{AllocationSweeper, CleanupReport, CleanupWorker, CleanupWorkerConfig, SweeperConfig};
