// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of operator builders.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ResourceError, Result};
use crate::traits::{
    Resource, ResourceId, ResourceKind, ResourceLocation, ResourceOperator,
    ResourceOperatorBuilder, ResourceSpec,
};

/// Holds the registered [`ResourceOperatorBuilder`]s and routes resource calls
/// to the first builder that supports the requested kind.
#[derive(Clone, Default)]
pub struct ResourceManager {
    builders: Vec<Arc<dyn ResourceOperatorBuilder>>,
}

impl ResourceManager {
    pub fn new(builders: Vec<Arc<dyn ResourceOperatorBuilder>>) -> Self {
        Self { builders }
    }

    /// Append a builder. Earlier registrations win when two support a kind.
    pub fn register(&mut self, builder: Arc<dyn ResourceOperatorBuilder>) {
        self.builders.push(builder);
    }

    /// Initialize every builder. Failures are logged and leave that builder
    /// unsupported; they never abort startup.
    pub async fn initialize(&self) {
        for builder in &self.builders {
            match builder.initialize().await {
                Ok(()) => debug!(builder = builder.name(), "Resource operator builder ready"),
                Err(e) => warn!(
                    builder = builder.name(),
                    error = %e,
                    "Resource operator builder failed to initialize"
                ),
            }
        }
        info!(kinds = ?self.supported_kinds(), "Resource manager initialized");
    }

    pub fn operator_builder(&self, kind: ResourceKind) -> Option<&Arc<dyn ResourceOperatorBuilder>> {
        self.builders.iter().find(|b| b.supports(kind))
    }

    /// Build an operator for `kind` at `location`.
    pub fn operator_for(
        &self,
        kind: ResourceKind,
        location: &ResourceLocation,
    ) -> Result<Arc<dyn ResourceOperator>> {
        self.operator_builder(kind)
            .ok_or(ResourceError::Unsupported(kind))?
            .build(location)
    }

    pub fn supported_kinds(&self) -> Vec<ResourceKind> {
        [ResourceKind::Process, ResourceKind::Pod]
            .into_iter()
            .filter(|kind| self.operator_builder(*kind).is_some())
            .collect()
    }

    pub async fn create(&self, spec: &ResourceSpec) -> Result<Resource> {
        self.operator_for(spec.kind, &spec.location)?
            .create(spec)
            .await
    }

    pub async fn query(&self, id: &ResourceId) -> Result<Option<Resource>> {
        self.operator_for(id.kind, &id.location)?.get(id).await
    }

    /// Destroy a resource, propagating failures.
    pub async fn destroy(&self, id: &ResourceId) -> Result<()> {
        self.operator_for(id.kind, &id.location)?.delete(id).await
    }

    /// Best-effort destroy. Returns whether the resource is known to be gone.
    pub async fn release(&self, id: &ResourceId) -> bool {
        match self.destroy(id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(resource = %id, error = %e, "Failed to release resource");
                false
            }
        }
    }
}
