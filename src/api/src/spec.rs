// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The application specification.
//!
//! The launcher stages `weave.spec.json` alongside the application's
//! artifacts; the application master reads it exactly once at startup. The
//! specification is immutable for the lifetime of the application; desired
//! instance counts change at runtime, but only through control messages.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// A complete application: named runnables plus an optional startup
/// ordering and timeout event handler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    /// The application name.
    pub name: String,
    /// The runnables that make up the application, keyed by name.
    pub runnables: BTreeMap<String, RuntimeSpec>,
    /// Startup groups. Runnables within a group are requested in parallel;
    /// groups are requested sequentially. Runnables absent from every group
    /// are requested last.
    #[serde(default)]
    pub orders: Vec<Order>,
    /// The timeout event handler to install, if any.
    #[serde(default)]
    pub event_handler: Option<EventHandlerSpec>,
}

impl ApplicationSpec {
    /// Parses a specification from its JSON encoding.
    pub fn from_json(bytes: &[u8]) -> Result<ApplicationSpec, anyhow::Error> {
        let spec: ApplicationSpec =
            serde_json::from_slice(bytes).context("parsing application spec")?;
        spec.validate()?;
        Ok(spec)
    }

    /// Checks internal consistency: orders must name declared runnables and
    /// must not name any runnable twice.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.runnables.is_empty() {
            bail!("application spec declares no runnables");
        }
        let mut ordered = BTreeSet::new();
        for order in &self.orders {
            for name in &order.names {
                if !self.runnables.contains_key(name) {
                    bail!("order names undeclared runnable {name}");
                }
                if !ordered.insert(name.clone()) {
                    bail!("runnable {name} appears in more than one order");
                }
            }
        }
        Ok(())
    }
}

/// A single runnable: what to execute and with which resources.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    /// What to execute.
    pub runnable: RunnableSpec,
    /// The per-instance resource profile and desired instance count.
    pub resource: ResourceSpec,
    /// Files to localize into each container before launch.
    #[serde(default)]
    pub local_files: Vec<LocalFile>,
}

/// The executable portion of a runnable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableSpec {
    /// The runnable name. Matches the key in [`ApplicationSpec::runnables`].
    pub name: String,
    /// The command to execute inside the container.
    pub command: String,
    /// Arguments to the command.
    #[serde(default)]
    pub args: Vec<String>,
}

/// A per-instance resource profile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Virtual cores per instance.
    #[serde(rename = "vcores")]
    pub virtual_cores: u32,
    /// Memory per instance, in megabytes.
    #[serde(rename = "memoryMB")]
    pub memory_mb: u32,
    /// The initial desired instance count.
    pub instances: u32,
}

/// A file to localize into a container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFile {
    /// The name the file takes inside the container.
    pub name: String,
    /// The staged location of the file.
    pub uri: String,
    /// Whether to expand the file as an archive.
    #[serde(default)]
    pub archive: bool,
    /// An optional pattern for selective archive expansion.
    #[serde(default)]
    pub pattern: Option<String>,
}

/// A startup group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// The runnables in the group.
    pub names: BTreeSet<String>,
    /// How completion of the group is judged before the next group starts.
    #[serde(rename = "type")]
    pub order_type: OrderType,
}

/// The completion criterion of a startup group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// The group is complete once its containers have started.
    Started,
    /// The group is complete once its runnables have run to completion.
    Completed,
}

/// Names a timeout event handler and its configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHandlerSpec {
    /// The handler name, resolved against the built-in handler registry.
    pub name: String,
    /// Opaque handler configuration.
    #[serde(default)]
    pub configs: BTreeMap<String, String>,
}
