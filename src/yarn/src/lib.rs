// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! Client for the cluster resource-manager allocation protocol.
//!
//! The protocol itself (registering an application master, asking for
//! containers by capability, polling for acquisitions and completions) is
//! an external collaborator reached through the [`ResourceManager`] trait.
//! [`RmClient`] wraps a trait object and adds the request-table bookkeeping
//! the raw protocol lacks: asks are recorded under opaque [`RequestId`]s so
//! that fully matched requests can be explicitly forgotten instead of
//! lingering as phantom asks.
//!
//! Two implementations ship here: [`LocalResourceManager`], which grants
//! synthetic containers on the local host and backs the single-host dev
//! mode, and [`testing::MockResourceManager`], a scripted backend for
//! integration tests.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

mod client;
mod local;

pub mod testing;

pub use client::{RequestId, RmClient};
pub use local::{LocalResourceManager, LocalRmHandle};

/// A container capability: what one instance needs.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Resource {
    /// Virtual cores.
    pub virtual_cores: u32,
    /// Memory in megabytes.
    pub memory_mb: u32,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} vcores, {} MB", self.virtual_cores, self.memory_mb)
    }
}

/// A cluster-assigned container identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Wraps a raw container id string.
    pub fn new<S: Into<String>>(id: S) -> ContainerId {
        ContainerId(id.into())
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cluster-assigned application identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApplicationId {
    /// The resource manager's start time, which scopes `id`.
    pub cluster_time: u64,
    /// The sequence number within `cluster_time`.
    pub id: u32,
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "application_{}_{:04}", self.cluster_time, self.id)
    }
}

/// A granted container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RmContainer {
    /// The container id.
    pub id: ContainerId,
    /// The host the container was granted on.
    pub host: String,
    /// The granted capability.
    pub resource: Resource,
}

/// The terminal report for a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerStatus {
    /// The container id.
    pub container_id: ContainerId,
    /// The exit status of the container process.
    pub exit_status: i32,
}

impl ContainerStatus {
    /// Whether the container terminated abnormally.
    pub fn is_abnormal(&self) -> bool {
        self.exit_status != 0
    }
}

/// The outcome of one [`ResourceManager::allocate`] poll cycle.
#[derive(Clone, Debug, Default)]
pub struct Allocation {
    /// Containers granted since the previous cycle.
    pub acquired: Vec<RmContainer>,
    /// Containers that terminated since the previous cycle.
    pub completed: Vec<ContainerStatus>,
}

impl Allocation {
    /// Whether the cycle produced no events.
    pub fn is_empty(&self) -> bool {
        self.acquired.is_empty() && self.completed.is_empty()
    }
}

/// The final status reported on deregistration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalStatus {
    /// The application completed successfully.
    Succeeded,
    /// The application failed.
    Failed,
    /// The application was killed.
    Killed,
}

/// The cluster-side allocation protocol.
///
/// There is no ordering guarantee between outstanding asks and grants; a
/// caller that interleaves asks of different capabilities must match grants
/// back to asks by capability.
#[async_trait]
pub trait ResourceManager: fmt::Debug + Send + Sync {
    /// Registers the application master, making the tracking URL visible in
    /// the resource manager UI.
    async fn register_application_master(
        &self,
        host: &str,
        tracking_url: Option<&str>,
    ) -> Result<(), anyhow::Error>;

    /// Asks for `count` containers of the given capability.
    async fn request_containers(&self, capability: Resource, count: u32)
        -> Result<(), anyhow::Error>;

    /// Forgets up to `count` outstanding asks of the given capability.
    async fn release_requests(&self, capability: Resource, count: u32)
        -> Result<(), anyhow::Error>;

    /// One poll cycle: reports progress and collects grants and completions
    /// that arrived since the previous cycle.
    async fn allocate(&self, progress: f32) -> Result<Allocation, anyhow::Error>;

    /// Deregisters the application master with a final status.
    async fn deregister_application_master(
        &self,
        status: FinalStatus,
        message: &str,
    ) -> Result<(), anyhow::Error>;
}
