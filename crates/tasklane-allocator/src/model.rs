// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted allocation types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tasklane_protocol::{JobIdentity, SupervisorEndpoint};
use tasklane_resource::ResourceLocation;

use crate::error::StoreError;

/// Declares a state enum stored by its upper-case symbolic name.
macro_rules! symbolic_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::Corrupt(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

symbolic_enum! {
    /// Progress of binding a job to a supervisor.
    ///
    /// `PREPARING -> CREATING_RESOURCE -> AVAILABLE`; `FAILED` from any
    /// non-terminal state.
    AllocateState {
        Preparing => "PREPARING",
        CreatingResource => "CREATING_RESOURCE",
        Available => "AVAILABLE",
        Failed => "FAILED",
    }
}

impl AllocateState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AllocateState::Available | AllocateState::Failed)
    }
}

symbolic_enum! {
    /// Whether the owner is using the bound supervisor.
    UsageState {
        Preparing => "PREPARING",
        Using => "USING",
        Released => "RELEASED",
    }
}

symbolic_enum! {
    /// Health of a supervisor endpoint as seen by the allocator.
    EndpointStatus {
        Preparing => "PREPARING",
        Available => "AVAILABLE",
        Unavailable => "UNAVAILABLE",
        Abandoned => "ABANDONED",
    }
}

/// One allocation request, keyed by the job identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub task_id: JobIdentity,
    pub location: ResourceLocation,
    /// Tag of the component that requested the allocation.
    pub owner_tag: String,
    pub allocate_state: AllocateState,
    pub usage_state: UsageState,
    /// Bound supervisor address; set iff `allocate_state` is `AVAILABLE`.
    pub supervisor_endpoint: Option<SupervisorEndpoint>,
    /// Supervisor holding this record's load reservation.
    pub supervisor_endpoint_ref: Option<i64>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl AllocationRecord {
    /// A fresh `PREPARING`/`PREPARING` record.
    pub fn new(task_id: JobIdentity, location: ResourceLocation, owner_tag: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            location,
            owner_tag: owner_tag.into(),
            allocate_state: AllocateState::Preparing,
            usage_state: UsageState::Preparing,
            supervisor_endpoint: None,
            supervisor_endpoint_ref: None,
            create_time: now,
            update_time: now,
        }
    }

    /// Time since the last state change, zero if the clock went backwards.
    pub fn idle_for(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.update_time).to_std().unwrap_or_default()
    }
}

/// A supervisor the allocator can bind jobs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorEndpointRecord {
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub status: EndpointStatus,
    pub location: ResourceLocation,
    /// String form of the backing `ResourceId`, when the allocator created it.
    pub resource_id: Option<String>,
    /// Allocations currently bound to or reserved on this supervisor.
    pub loads: i64,
    /// Consecutive failed heartbeat probes.
    pub probe_failures: i64,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl SupervisorEndpointRecord {
    pub fn endpoint(&self) -> SupervisorEndpoint {
        SupervisorEndpoint::new(self.host.clone(), self.port)
    }

    /// Whether the address is known yet (pods get theirs after scheduling).
    pub fn has_address(&self) -> bool {
        !self.host.is_empty()
    }
}

/// Fields of a supervisor endpoint before it is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSupervisorEndpoint {
    pub host: String,
    pub port: u16,
    pub status: EndpointStatus,
    pub location: ResourceLocation,
    pub resource_id: Option<String>,
}

impl NewSupervisorEndpoint {
    /// A pre-provisioned supervisor registered as `AVAILABLE`.
    pub fn available(host: impl Into<String>, port: u16, location: ResourceLocation) -> Self {
        Self {
            host: host.into(),
            port,
            status: EndpointStatus::Available,
            location,
            resource_id: None,
        }
    }
}

/// How a bind treats the supervisor's load counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadReservation {
    /// Add one load, refusing when the supervisor already has `limit` or more.
    Reserve { limit: Option<i64> },
    /// The load was reserved earlier (e.g. when the supervisor was created).
    AlreadyReserved,
}

/// Outcome of a bind attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// The record was no longer in the expected state.
    RecordChanged,
    /// The supervisor is not `AVAILABLE` or has no spare capacity.
    EndpointRejected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbolic_names() {
        assert_eq!(AllocateState::CreatingResource.as_str(), "CREATING_RESOURCE");
        assert_eq!(
            "CREATING_RESOURCE".parse::<AllocateState>().unwrap(),
            AllocateState::CreatingResource
        );
        assert_eq!("RELEASED".parse::<UsageState>().unwrap(), UsageState::Released);
        assert!("creating".parse::<AllocateState>().is_err());
        assert_eq!(
            serde_json::to_string(&EndpointStatus::Unavailable).unwrap(),
            "\"UNAVAILABLE\""
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(AllocateState::Available.is_terminal());
        assert!(AllocateState::Failed.is_terminal());
        assert!(!AllocateState::Preparing.is_terminal());
        assert!(!AllocateState::CreatingResource.is_terminal());
    }

    #[test]
    fn test_new_record() {
        let record = AllocationRecord::new(
            JobIdentity::new(5),
            ResourceLocation::new("eu", "default"),
            "scheduler",
        );
        assert_eq!(record.allocate_state, AllocateState::Preparing);
        assert_eq!(record.usage_state, UsageState::Preparing);
        assert!(record.supervisor_endpoint.is_none());
        assert_eq!(record.create_time, record.update_time);
    }
}
