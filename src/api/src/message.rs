// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! Control messages.
//!
//! External controllers post messages as JSON under the application's
//! metadata namespace; the application master consumes them in sequence
//! order and acknowledges each one by deleting its node. Delivery is
//! at-least-once, so commands must be idempotent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The command that adjusts a runnable's desired instance count.
pub const CMD_INSTANCES: &str = "instances";

/// The option carrying the new instance count for [`CMD_INSTANCES`].
pub const OPT_COUNT: &str = "count";

/// The command announcing that the shared credential store was updated.
pub const CMD_SECURE_STORE_UPDATED: &str = "secureStoreUpdated";

/// A control message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Whether the message originates from the framework or from user code.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// The dispatch scope.
    pub scope: MessageScope,
    /// The target runnable, for [`MessageScope::Runnable`] messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runnable_name: Option<String>,
    /// The command to execute.
    pub command: Command,
}

impl Message {
    /// Constructs the system message that sets a runnable's desired
    /// instance count.
    pub fn set_instances(runnable: &str, count: u32) -> Message {
        Message {
            kind: MessageKind::System,
            scope: MessageScope::Runnable,
            runnable_name: Some(runnable.to_string()),
            command: Command {
                command: CMD_INSTANCES.to_string(),
                options: BTreeMap::from([(OPT_COUNT.to_string(), count.to_string())]),
            },
        }
    }

    /// Constructs the system message that announces a credential store
    /// update.
    pub fn secure_store_updated() -> Message {
        Message {
            kind: MessageKind::System,
            scope: MessageScope::Application,
            runnable_name: None,
            command: Command {
                command: CMD_SECURE_STORE_UPDATED.to_string(),
                options: BTreeMap::new(),
            },
        }
    }
}

/// The origin of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Posted by user code.
    User,
    /// Posted by the framework.
    System,
}

/// The dispatch scope of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageScope {
    /// Handled by the application master itself.
    Application,
    /// Fanned out to every container of every runnable.
    AllRunnable,
    /// Fanned out to every container of one runnable.
    Runnable,
}

/// A named command with string options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// The command name.
    pub command: String,
    /// Command options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}
