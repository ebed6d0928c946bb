// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! Provisioning-timeout event handlers.
//!
//! The application specification names a handler; the name is resolved
//! against a registry of built-in handlers rather than loading code from
//! the application's artifacts. The contract is unchanged: the handler is
//! initialized once, consulted whenever a provisioning timeout fires, and
//! destroyed at shutdown.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::bail;
use tracing::{error, warn};

use weave_api::spec::EventHandlerSpec;
use weave_ore::now::EpochMillis;

/// The name of the default handler.
pub const LOG_ONLY: &str = "log-only";

/// The name of the handler that shuts the application down on the first
/// timeout.
pub const ABORT_ON_TIMEOUT: &str = "abort-on-timeout";

/// One runnable whose running count has not reached its desired count
/// within the provisioning timeout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeoutEvent {
    /// The runnable.
    pub runnable: String,
    /// The desired instance count.
    pub expected: u32,
    /// The running instance count.
    pub actual: u32,
    /// When containers were last requested for the runnable.
    pub requested_at: EpochMillis,
}

/// What to do about a provisioning timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Check again after the given interval.
    Recheck(Duration),
    /// Shut the application down.
    Abort,
}

/// Context handed to a handler at initialization.
#[derive(Clone, Debug)]
pub struct EventHandlerContext<'a> {
    /// The application name.
    pub application: &'a str,
    /// The handler configuration from the specification.
    pub configs: &'a BTreeMap<String, String>,
}

/// A pluggable provisioning-timeout handler.
pub trait EventHandler: fmt::Debug + Send + Sync {
    /// Called once before the provisioning loop starts.
    fn initialize(&mut self, _ctx: &EventHandlerContext) {}

    /// Called when at least one runnable misses its provisioning deadline.
    fn launch_timeout(&mut self, events: &[TimeoutEvent]) -> Result<TimeoutAction, anyhow::Error>;

    /// Called once at shutdown. Errors are logged by the caller.
    fn destroy(&mut self) {}
}

/// Resolves a handler specification against the built-in registry.
///
/// `None` resolves to [`LOG_ONLY`]; unknown names fail startup.
pub fn create_handler(
    spec: Option<&EventHandlerSpec>,
    default_recheck: Duration,
) -> Result<Box<dyn EventHandler>, anyhow::Error> {
    match spec.map(|spec| spec.name.as_str()) {
        None | Some(LOG_ONLY) => Ok(Box::new(LogOnlyHandler {
            recheck: default_recheck,
        })),
        Some(ABORT_ON_TIMEOUT) => Ok(Box::new(AbortOnTimeoutHandler)),
        Some(other) => bail!("unknown event handler: {other}"),
    }
}

/// Logs timed-out runnables and keeps waiting.
#[derive(Debug)]
pub struct LogOnlyHandler {
    recheck: Duration,
}

impl EventHandler for LogOnlyHandler {
    fn initialize(&mut self, ctx: &EventHandlerContext) {
        if let Some(millis) = ctx.configs.get("recheckMillis") {
            match millis.parse::<u64>() {
                Ok(millis) => self.recheck = Duration::from_millis(millis),
                Err(_) => warn!("ignoring unparseable recheckMillis: {millis}"),
            }
        }
    }

    fn launch_timeout(&mut self, events: &[TimeoutEvent]) -> Result<TimeoutAction, anyhow::Error> {
        for event in events {
            warn!(
                "provisioning timeout: {} has {} of {} desired instances",
                event.runnable, event.actual, event.expected
            );
        }
        Ok(TimeoutAction::Recheck(self.recheck))
    }
}

/// Shuts the application down on the first timeout.
#[derive(Debug)]
pub struct AbortOnTimeoutHandler;

impl EventHandler for AbortOnTimeoutHandler {
    fn launch_timeout(&mut self, events: &[TimeoutEvent]) -> Result<TimeoutAction, anyhow::Error> {
        for event in events {
            error!(
                "provisioning timeout: {} has {} of {} desired instances; aborting",
                event.runnable, event.actual, event.expected
            );
        }
        Ok(TimeoutAction::Abort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolution() {
        let recheck = Duration::from_secs(30);
        assert!(create_handler(None, recheck).is_ok());
        let spec = EventHandlerSpec {
            name: ABORT_ON_TIMEOUT.to_string(),
            configs: BTreeMap::new(),
        };
        assert!(create_handler(Some(&spec), recheck).is_ok());
        let spec = EventHandlerSpec {
            name: "com.example.Missing".to_string(),
            configs: BTreeMap::new(),
        };
        assert!(create_handler(Some(&spec), recheck).is_err());
    }

    #[test]
    fn test_log_only_recheck_configurable() {
        let configs = BTreeMap::from([("recheckMillis".to_string(), "1500".to_string())]);
        let mut handler = create_handler(None, Duration::from_secs(30)).unwrap();
        handler.initialize(&EventHandlerContext {
            application: "app",
            configs: &configs,
        });
        let action = handler
            .launch_timeout(&[TimeoutEvent {
                runnable: "echo".to_string(),
                expected: 2,
                actual: 0,
                requested_at: 0,
            }])
            .unwrap();
        assert_eq!(action, TimeoutAction::Recheck(Duration::from_millis(1500)));
    }
}
