// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The provisioning loop.
//!
//! One tick per second: poll the resource manager, match acquisitions
//! against the head of the provisioning queue, feed completions to the
//! registry, re-request containers for abnormal exits, dispatch the next
//! capability group once the current one is fully provisioned, and evaluate
//! provisioning timeouts against a monotonic deadline.
//!
//! The request and provisioning queues are owned by the loop; the only
//! cross-task writer is the instance-change worker, whose scale-up requests
//! arrive over a channel drained at the top of each tick.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use weave_api::env;
use weave_api::spec::{ApplicationSpec, LocalFile, OrderType, RuntimeSpec};
use weave_ore::now::{EpochMillis, NowFn};
use weave_yarn::{ContainerId, Resource, RequestId, RmClient, RmContainer};

use crate::credentials::CredentialsCache;
use crate::events::{EventHandler, TimeoutAction, TimeoutEvent};
use crate::expect::ExpectedCounts;
use crate::launcher::{ContainerLauncher, LaunchRequest};
use crate::registry::ContainerRegistry;

/// The container capability a runnable asks for.
pub fn capability(spec: &RuntimeSpec) -> Resource {
    Resource {
        virtual_cores: spec.resource.virtual_cores,
        memory_mb: spec.resource.memory_mb,
    }
}

/// The order type a runnable was declared with, defaulting to
/// [`OrderType::Started`] for runnables outside every order.
pub fn order_type_of(spec: &ApplicationSpec, runnable: &str) -> OrderType {
    spec.orders
        .iter()
        .find(|order| order.names.contains(runnable))
        .map(|order| order.order_type)
        .unwrap_or(OrderType::Started)
}

/// A queued ask for containers: one startup group, grouped by capability so
/// runnables with identical capabilities fill from a single set of
/// acquisitions, consumed in capability order.
#[derive(Debug)]
pub struct RunnableContainerRequest {
    order_type: OrderType,
    groups: VecDeque<(Resource, Vec<RuntimeSpec>)>,
}

impl RunnableContainerRequest {
    /// Builds a request for a startup group.
    pub fn from_group(order_type: OrderType, specs: Vec<RuntimeSpec>) -> RunnableContainerRequest {
        let mut by_capability: BTreeMap<Resource, Vec<RuntimeSpec>> = BTreeMap::new();
        for spec in specs {
            by_capability.entry(capability(&spec)).or_default().push(spec);
        }
        RunnableContainerRequest {
            order_type,
            groups: by_capability.into_iter().collect(),
        }
    }

    /// Builds a request for a single runnable, as used for restarts and
    /// scale-ups.
    pub fn single(spec: RuntimeSpec, order_type: OrderType) -> RunnableContainerRequest {
        RunnableContainerRequest::from_group(order_type, vec![spec])
    }

    /// The order type the request was derived from.
    pub fn order_type(&self) -> OrderType {
        self.order_type
    }

    fn next_group(&mut self) -> Option<(Resource, Vec<RuntimeSpec>)> {
        self.groups.pop_front()
    }
}

/// Builds the ordered startup queue: the declared orders first, then one
/// trailing group of the runnables no order names.
pub fn build_request_queue(spec: &ApplicationSpec) -> VecDeque<RunnableContainerRequest> {
    let mut queue = VecDeque::new();
    let mut covered = BTreeSet::new();
    for order in &spec.orders {
        let specs = order
            .names
            .iter()
            .filter_map(|name| spec.runnables.get(name).cloned())
            .collect();
        covered.extend(order.names.iter().cloned());
        queue.push_back(RunnableContainerRequest::from_group(order.order_type, specs));
    }
    let rest: Vec<RuntimeSpec> = spec
        .runnables
        .iter()
        .filter(|(name, _)| !covered.contains(*name))
        .map(|(_, spec)| spec.clone())
        .collect();
    if !rest.is_empty() {
        queue.push_back(RunnableContainerRequest::from_group(OrderType::Started, rest));
    }
    queue
}

/// An ask submitted to the resource manager, awaiting containers.
#[derive(Debug)]
struct ProvisionRequest {
    spec: RuntimeSpec,
    request_id: RequestId,
    remaining: u32,
}

/// The outcome of one tick.
#[derive(Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep ticking.
    Continue,
    /// Nothing left to provision and no containers running.
    Finished,
    /// The event handler requested shutdown.
    Abort,
}

/// The provisioning state machine. [`ApplicationMasterService`] drives
/// [`Provisioner::tick`] at 1 Hz.
///
/// [`ApplicationMasterService`]: crate::service::ApplicationMasterService
pub struct Provisioner {
    rm: RmClient,
    registry: Arc<ContainerRegistry>,
    expected: Arc<ExpectedCounts>,
    launcher: Arc<dyn ContainerLauncher>,
    handler: Box<dyn EventHandler>,
    spec: Arc<ApplicationSpec>,
    credentials: Arc<CredentialsCache>,
    now: NowFn,
    provision_timeout: Duration,

    /// The environment every container launch starts from.
    base_env: BTreeMap<String, String>,
    /// Extra runtime arguments per runnable, from `arguments.json`.
    arguments: BTreeMap<String, Vec<String>>,
    /// Application-wide files to localize, from `localizeFiles.json`.
    localize_files: Vec<LocalFile>,
    /// Extra JVM options, from `jvm.opts`.
    jvm_opts: Option<String>,
    /// The logging template, from `logback-template.xml`.
    logging_template: Option<String>,

    requests: VecDeque<RunnableContainerRequest>,
    provisioning: VecDeque<ProvisionRequest>,
    inflight_rx: UnboundedReceiver<RunnableContainerRequest>,
    next_timeout_check: EpochMillis,
}

impl Provisioner {
    /// Creates a provisioner with the startup queue built from the
    /// specification.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rm: RmClient,
        registry: Arc<ContainerRegistry>,
        expected: Arc<ExpectedCounts>,
        launcher: Arc<dyn ContainerLauncher>,
        handler: Box<dyn EventHandler>,
        spec: Arc<ApplicationSpec>,
        credentials: Arc<CredentialsCache>,
        now: NowFn,
        provision_timeout: Duration,
        base_env: BTreeMap<String, String>,
        arguments: BTreeMap<String, Vec<String>>,
        localize_files: Vec<LocalFile>,
        jvm_opts: Option<String>,
        logging_template: Option<String>,
        inflight_rx: UnboundedReceiver<RunnableContainerRequest>,
    ) -> Provisioner {
        let requests = build_request_queue(&spec);
        let next_timeout_check = now.now() + duration_millis(provision_timeout);
        Provisioner {
            rm,
            registry,
            expected,
            launcher,
            handler,
            spec,
            credentials,
            now,
            provision_timeout,
            base_env,
            arguments,
            localize_files,
            jvm_opts,
            logging_template,
            requests,
            provisioning: VecDeque::new(),
            inflight_rx,
            next_timeout_check,
        }
    }

    /// Runs one provisioning cycle.
    pub async fn tick(&mut self) -> Result<TickOutcome, anyhow::Error> {
        // Scale-up requests enqueued by the instance-change worker.
        while let Ok(request) = self.inflight_rx.try_recv() {
            self.requests.push_back(request);
        }

        let progress = self.progress().await;
        let allocation = self.rm.allocate(progress).await.context("allocate")?;
        let mut restarts = Vec::new();
        for container in allocation.acquired {
            self.handle_acquired(container, &mut restarts).await;
        }
        for status in allocation.completed {
            if let Some(runnable) = self.registry.handle_completed(&status).await {
                restarts.push(runnable);
            }
        }
        for runnable in restarts {
            self.request_restart(&runnable);
        }

        if self.requests.is_empty()
            && self.provisioning.is_empty()
            && self.registry.is_empty().await
        {
            info!("nothing left to provision and no containers running");
            return Ok(TickOutcome::Finished);
        }

        if self.provisioning.is_empty() {
            if let Some((capability, specs)) = self.take_next_group() {
                self.dispatch_group(capability, specs).await?;
            }
        }

        if self.now.now() >= self.next_timeout_check {
            if let Some(outcome) = self.check_timeouts().await {
                return Ok(outcome);
            }
        }

        Ok(TickOutcome::Continue)
    }

    async fn progress(&self) -> f32 {
        let desired: u32 = self
            .expected
            .snapshot()
            .values()
            .map(|count| count.desired)
            .sum();
        if desired == 0 {
            return 0.0;
        }
        let running = self.registry.count_all().await;
        (running as f32 / desired as f32).clamp(0.0, 1.0)
    }

    /// Matches one acquired container against the head of the provisioning
    /// queue and launches it. Speculative containers (nothing in
    /// provisioning) are dropped; a failed launch consumes the ask and
    /// routes the runnable through the restart path, the same as an
    /// abnormal completion would.
    async fn handle_acquired(&mut self, container: RmContainer, restarts: &mut Vec<String>) {
        let spec = match self.provisioning.front() {
            Some(request) => request.spec.clone(),
            None => {
                warn!(
                    "acquired container {} with nothing in provisioning; dropping",
                    container.id
                );
                return;
            }
        };
        let runnable = spec.runnable.name.clone();
        let mut launch_env = self.base_env.clone();
        launch_env.insert(
            env::INSTANCE_COUNT.to_string(),
            self.expected.desired(&runnable).to_string(),
        );
        let request = LaunchRequest {
            runtime: spec,
            arguments: self.arguments.get(&runnable).cloned().unwrap_or_default(),
            localize_files: self.localize_files.clone(),
            env: launch_env,
            credentials: self.credentials.tokens(),
            jvm_opts: self.jvm_opts.clone(),
            logging_template: self.logging_template.clone(),
        };
        if let Err(e) = self.registry.start(request, container, &*self.launcher).await {
            error!("failed to launch {runnable}: {e:#}");
            restarts.push(runnable);
        }

        let fulfilled = match self.provisioning.front_mut() {
            Some(front) => {
                front.remaining -= 1;
                front.remaining == 0
            }
            None => false,
        };
        if fulfilled {
            if let Some(done) = self.provisioning.pop_front() {
                if let Err(e) = self.rm.complete_container_request(done.request_id).await {
                    warn!("failed to complete container request: {e:#}");
                }
            }
        }
    }

    fn request_restart(&mut self, runnable: &str) {
        let Some(runtime) = self.spec.runnables.get(runnable) else {
            warn!("not restarting undeclared runnable {runnable}");
            return;
        };
        self.expected.bump_requested(runnable);
        info!("re-requesting one container for {runnable}");
        self.requests.push_back(RunnableContainerRequest::single(
            runtime.clone(),
            order_type_of(&self.spec, runnable),
        ));
    }

    fn take_next_group(&mut self) -> Option<(Resource, Vec<RuntimeSpec>)> {
        while let Some(front) = self.requests.front_mut() {
            match front.next_group() {
                Some(group) => return Some(group),
                None => {
                    self.requests.pop_front();
                }
            }
        }
        None
    }

    async fn dispatch_group(
        &mut self,
        capability: Resource,
        specs: Vec<RuntimeSpec>,
    ) -> Result<(), anyhow::Error> {
        for spec in specs {
            let runnable = spec.runnable.name.clone();
            let running = u32::try_from(self.registry.count(&runnable).await)
                .expect("container count fits in u32");
            let desired = self.expected.desired(&runnable);
            let new_containers = desired.saturating_sub(running);
            if new_containers == 0 {
                debug!("{runnable} already at desired count {desired}");
                continue;
            }
            info!("requesting {new_containers} containers for {runnable} ({capability})");
            let request_id = self
                .rm
                .add_container_request(capability, new_containers)
                .await
                .context("requesting containers")?;
            self.expected.bump_requested(&runnable);
            self.provisioning.push_back(ProvisionRequest {
                spec,
                request_id,
                remaining: new_containers,
            });
        }
        Ok(())
    }

    /// Evaluates provisioning timeouts and consults the event handler.
    /// Returns `Some(Abort)` when the handler requests shutdown.
    async fn check_timeouts(&mut self) -> Option<TickOutcome> {
        let now = self.now.now();
        let mut events = Vec::new();
        for (runnable, count) in self.expected.snapshot() {
            let running = u32::try_from(self.registry.count(&runnable).await)
                .expect("container count fits in u32");
            if running != count.desired {
                events.push(TimeoutEvent {
                    runnable,
                    expected: count.desired,
                    actual: running,
                    requested_at: count.requested_at,
                });
            }
        }
        if events.is_empty() {
            self.next_timeout_check = now + duration_millis(self.provision_timeout);
            return None;
        }
        match self.handler.launch_timeout(&events) {
            Ok(TimeoutAction::Abort) => {
                info!("event handler requested shutdown");
                Some(TickOutcome::Abort)
            }
            Ok(TimeoutAction::Recheck(delay)) => {
                self.next_timeout_check += duration_millis(delay);
                None
            }
            Err(e) => {
                error!("event handler failed: {e:#}; rechecking at the default interval");
                self.next_timeout_check += duration_millis(self.provision_timeout);
                None
            }
        }
    }

    /// Destroys the event handler. Called once at shutdown.
    pub fn destroy_handler(&mut self) {
        self.handler.destroy();
    }

    /// Polls the resource manager until the given containers have reported
    /// completion or the timeout elapses.
    pub async fn drain_completions(&mut self, ids: Vec<ContainerId>, timeout: Duration) {
        let mut ids: BTreeSet<ContainerId> = ids.into_iter().collect();
        let deadline = tokio::time::Instant::now() + timeout;
        while !ids.is_empty() && tokio::time::Instant::now() < deadline {
            match self.rm.allocate(1.0).await {
                Ok(allocation) => {
                    for status in allocation.completed {
                        ids.remove(&status.container_id);
                        self.registry.handle_completed(&status).await;
                    }
                }
                Err(e) => {
                    warn!("allocate failed while draining completions: {e:#}");
                    break;
                }
            }
            if !ids.is_empty() {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
        if !ids.is_empty() {
            debug!("gave up draining {} completion events", ids.len());
        }
    }

    /// Deregisters from the resource manager. Called once at shutdown.
    pub async fn deregister(
        &mut self,
        status: weave_yarn::FinalStatus,
        message: &str,
    ) -> Result<(), anyhow::Error> {
        self.rm.stop(status, message).await
    }
}

fn duration_millis(duration: Duration) -> EpochMillis {
    EpochMillis::try_from(duration.as_millis()).expect("duration fits in u64")
}
