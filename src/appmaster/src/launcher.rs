// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! Launching runnable instances into containers.
//!
//! The in-container runnable host is an external collaborator; the
//! application master reaches it through the [`ContainerLauncher`] and
//! [`InstanceController`] traits. [`ProcessLauncher`] is the local-mode
//! implementation: each container is a child process on this host, control
//! messages are JSON lines on the child's stdin, and exits are reported
//! back to the [`LocalResourceManager`](weave_yarn::LocalResourceManager)
//! so they surface through the normal completion path.

use std::collections::BTreeMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, warn};

use weave_api::id::RunId;
use weave_api::message::Message;
use weave_api::spec::{LocalFile, RuntimeSpec};
use weave_ore::task;
use weave_yarn::{ContainerStatus, LocalRmHandle, RmContainer};

/// Everything needed to start one runnable instance in a granted container.
#[derive(Clone, Debug)]
pub struct LaunchContext {
    /// The runnable to start.
    pub runtime: RuntimeSpec,
    /// Extra runtime arguments for this runnable, from `arguments.json`.
    pub arguments: Vec<String>,
    /// Application-wide files to localize, from `localizeFiles.json`,
    /// in addition to the runnable's own.
    pub localize_files: Vec<LocalFile>,
    /// The environment to launch with.
    pub env: BTreeMap<String, String>,
    /// Forwardable credential tokens, by kind.
    pub credentials: BTreeMap<String, String>,
    /// Extra JVM options from `jvm.opts`, for hosts that run JVM runnables.
    pub jvm_opts: Option<String>,
    /// The logging configuration template from `logback-template.xml`,
    /// rendered by the in-container host.
    pub logging_template: Option<String>,
    /// The instance number assigned to this launch.
    pub instance_id: u32,
    /// The run id assigned to this launch.
    pub run_id: RunId,
    /// The granted container.
    pub container: RmContainer,
}

/// The provisioner-side portion of a [`LaunchContext`], before the registry
/// assigns an instance number and run id.
#[derive(Clone, Debug)]
pub struct LaunchRequest {
    /// The runnable to start.
    pub runtime: RuntimeSpec,
    /// Extra runtime arguments for this runnable.
    pub arguments: Vec<String>,
    /// Application-wide files to localize.
    pub localize_files: Vec<LocalFile>,
    /// The environment to launch with.
    pub env: BTreeMap<String, String>,
    /// Forwardable credential tokens, by kind.
    pub credentials: BTreeMap<String, String>,
    /// Extra JVM options.
    pub jvm_opts: Option<String>,
    /// The logging configuration template.
    pub logging_template: Option<String>,
}

impl LaunchRequest {
    /// Completes the request into a [`LaunchContext`].
    pub fn into_context(
        self,
        instance_id: u32,
        run_id: RunId,
        container: RmContainer,
    ) -> LaunchContext {
        LaunchContext {
            runtime: self.runtime,
            arguments: self.arguments,
            localize_files: self.localize_files,
            env: self.env,
            credentials: self.credentials,
            jvm_opts: self.jvm_opts,
            logging_template: self.logging_template,
            instance_id,
            run_id,
            container,
        }
    }
}

/// The handle through which messages and stop requests reach a running
/// container process.
#[async_trait]
pub trait InstanceController: fmt::Debug + Send + Sync {
    /// Delivers a control message to the container process.
    async fn send_message(&self, message: &Message) -> Result<(), anyhow::Error>;

    /// Stops the container process and waits for it to exit.
    async fn stop(&self) -> Result<(), anyhow::Error>;

    /// Informs the controller that the cluster reported its container
    /// complete.
    fn handle_completed(&self, status: &ContainerStatus);
}

/// Spawns the in-container process for a runnable instance.
#[async_trait]
pub trait ContainerLauncher: fmt::Debug + Send + Sync {
    /// Launches the instance described by `ctx`, returning its controller.
    async fn launch(&self, ctx: LaunchContext) -> Result<Arc<dyn InstanceController>, anyhow::Error>;
}

/// A [`ContainerLauncher`] that runs containers as local child processes.
#[derive(Debug)]
pub struct ProcessLauncher {
    rm: LocalRmHandle,
}

impl ProcessLauncher {
    /// Creates a launcher that reports exits to the given local resource
    /// manager.
    pub fn new(rm: LocalRmHandle) -> ProcessLauncher {
        ProcessLauncher { rm }
    }
}

#[async_trait]
impl ContainerLauncher for ProcessLauncher {
    async fn launch(&self, ctx: LaunchContext) -> Result<Arc<dyn InstanceController>, anyhow::Error> {
        let name = format!("{}-{}", ctx.runtime.runnable.name, ctx.instance_id);
        let mut command = Command::new(&ctx.runtime.runnable.command);
        command
            .args(&ctx.runtime.runnable.args)
            .args(&ctx.arguments)
            .envs(&ctx.env)
            .stdin(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .with_context(|| format!("spawning {name} ({})", ctx.runtime.runnable.command))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("child process has no stdin"))?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None::<i32>);
        let rm = self.rm.clone();
        let container_id = ctx.container.id.clone();
        let supervise_name = name.clone();
        let task_name = supervise_name.clone();
        task::spawn(
            || format!("supervise-{task_name}"),
            async move {
                let exit_status = tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => status.code().unwrap_or(-1),
                        Err(e) => {
                            warn!("failed to wait for {supervise_name}: {e}");
                            -1
                        }
                    },
                    _ = stop_rx => {
                        if let Err(e) = child.kill().await {
                            warn!("failed to kill {supervise_name}: {e}");
                        }
                        match child.wait().await {
                            Ok(status) => status.code().unwrap_or(-1),
                            Err(_) => -1,
                        }
                    }
                };
                debug!("{supervise_name} exited with status {exit_status}");
                let _ = exit_tx.send(Some(exit_status));
                rm.report_completion(ContainerStatus {
                    container_id,
                    exit_status,
                });
            },
        );

        Ok(Arc::new(ProcessController {
            name,
            stdin: Mutex::new(Some(stdin)),
            stop: std::sync::Mutex::new(Some(stop_tx)),
            exit: exit_rx,
        }))
    }
}

/// Controller for a container process spawned by [`ProcessLauncher`].
struct ProcessController {
    name: String,
    stdin: Mutex<Option<ChildStdin>>,
    stop: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    exit: watch::Receiver<Option<i32>>,
}

impl fmt::Debug for ProcessController {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProcessController")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl InstanceController for ProcessController {
    async fn send_message(&self, message: &Message) -> Result<(), anyhow::Error> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        match stdin.as_mut() {
            Some(stdin) => {
                stdin.write_all(&line).await?;
                stdin.flush().await?;
                Ok(())
            }
            None => bail!("stdin of {} is closed", self.name),
        }
    }

    async fn stop(&self) -> Result<(), anyhow::Error> {
        if let Some(stop) = self
            .stop
            .lock()
            .expect("process controller poisoned")
            .take()
        {
            let _ = stop.send(());
        }
        // Closing stdin lets well-behaved children notice the hangup even
        // before the kill lands.
        self.stdin.lock().await.take();
        let mut exit = self.exit.clone();
        loop {
            if exit.borrow().is_some() {
                return Ok(());
            }
            if exit.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    fn handle_completed(&self, status: &ContainerStatus) {
        debug!(
            "{} reported complete with exit status {}",
            self.name, status.exit_status
        );
    }
}
