// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tasklane Resource - compute resources behind one operator interface
//!
//! Job executors and supervisors run either as local OS processes or as
//! Kubernetes pods. Each backend provides a [`ResourceOperatorBuilder`];
//! the [`ResourceManager`] picks the first builder that supports a kind.
//!
//! | Backend   | Builder                           | Resource name |
//! |-----------|-----------------------------------|---------------|
//! | Process   | [`ProcessResourceOperatorBuilder`] | process id    |
//! | Pod       | [`PodResourceOperatorBuilder`]     | pod name      |
//!
//! The pod builder is only supported once [`ResourceManager::initialize`] has
//! reached the Kubernetes API.

pub mod error;
pub mod manager;
pub mod mock;
pub mod pod;
pub mod process;
pub mod traits;

pub use error::{ResourceError, Result};
pub use manager::ResourceManager;
pub use mock::{MockResourceOperator, MockResourceOperatorBuilder};
pub use pod::{PodOperatorConfig, PodResourceOperator, PodResourceOperatorBuilder};
pub use process::{ProcessOperatorConfig, ProcessResourceOperator, ProcessResourceOperatorBuilder};
pub use traits::{
    Resource, ResourceId, ResourceKind, ResourceLocation, ResourceOperator,
    ResourceOperatorBuilder, ResourceSpec, ResourceState,
};
