// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The log-broker sidecar lifecycle.
//!
//! The application master starts the log broker early (containers ship
//! their logs through it) and stops it late in shutdown, after its own
//! logs have drained. The broker is an external process; the logging
//! protocol itself is out of scope here. When no broker command is
//! configured both ends of the lifecycle are no-ops.

use anyhow::Context;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Configures the log broker.
#[derive(Clone, Debug, Default)]
pub struct LogBrokerConfig {
    /// The command that runs the broker, if one is configured.
    pub command: Option<String>,
    /// Arguments to the command.
    pub args: Vec<String>,
    /// The connect string injected into every container's environment.
    pub connect: Option<String>,
}

/// A running (or absent) log broker.
#[derive(Debug)]
pub struct LogBroker {
    child: Option<Child>,
    connect: Option<String>,
}

impl LogBroker {
    /// Starts the broker process, if one is configured.
    pub fn start(config: &LogBrokerConfig) -> Result<LogBroker, anyhow::Error> {
        let child = match &config.command {
            None => None,
            Some(command) => {
                info!("starting log broker: {command}");
                let child = Command::new(command)
                    .args(&config.args)
                    .kill_on_drop(true)
                    .spawn()
                    .with_context(|| format!("starting log broker {command}"))?;
                Some(child)
            }
        };
        Ok(LogBroker {
            child,
            connect: config.connect.clone(),
        })
    }

    /// The connect string containers ship logs to, if a broker is
    /// configured.
    pub fn connect_string(&self) -> Option<&str> {
        self.connect.as_deref()
    }

    /// Stops the broker process, if one is running.
    pub async fn stop(mut self) {
        if let Some(mut child) = self.child.take() {
            info!("stopping log broker");
            if let Err(e) = child.kill().await {
                warn!("failed to stop log broker: {e}");
            }
        }
    }
}
