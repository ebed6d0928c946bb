// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The application master service: wiring, startup, the top-level loop,
//! and ordered shutdown.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use weave_api::env;
use weave_api::id::RunId;
use weave_api::node::{ApplicationMasterLiveNodeData, ServiceState, ServiceStateData};
use weave_api::report::ContainerResources;
use weave_api::spec::{ApplicationSpec, LocalFile};
use weave_ore::now::NowFn;
use weave_ore::task::{self, AbortOnDropHandle, JoinHandleExt};
use weave_yarn::{ApplicationId, FinalStatus, ResourceManager, RmClient};
use weave_zk::{CreateMode, MetadataClient, MetadataStore, StoreError};

use crate::broker::{LogBroker, LogBrokerConfig};
use crate::credentials::CredentialsCache;
use crate::events::{create_handler, EventHandlerContext};
use crate::expect::ExpectedCounts;
use crate::instances::{wait_shutdown, InstanceChangeWorker};
use crate::launcher::ContainerLauncher;
use crate::messages::{runnable_messages, MessageBus, APPLICATION_MESSAGES};
use crate::provisioner::{Provisioner, TickOutcome};
use crate::registry::ContainerRegistry;
use crate::storage::ApplicationStorage;
use crate::tracker::{ReportSource, TrackerService};

/// Tunable intervals. None of these are contracts.
#[derive(Clone, Copy, Debug)]
pub struct AmTunables {
    /// How often the provisioning loop polls the resource manager.
    pub allocate_interval: Duration,
    /// How long a runnable may miss its desired count before the event
    /// handler is consulted.
    pub provision_timeout: Duration,
    /// How long to keep polling for completion events after stopping all
    /// containers.
    pub stop_drain: Duration,
    /// How long to let the log shipper drain before stopping the broker.
    pub log_drain: Duration,
}

impl Default for AmTunables {
    fn default() -> Self {
        AmTunables {
            allocate_interval: Duration::from_secs(1),
            provision_timeout: Duration::from_secs(30),
            stop_drain: Duration::from_secs(5),
            log_drain: Duration::from_millis(500),
        }
    }
}

/// Configures an application master.
#[derive(Debug)]
pub struct ApplicationMasterConfig {
    /// The application specification, read from `weave.spec.json`.
    pub spec: ApplicationSpec,
    /// The application's run id.
    pub app_run_id: RunId,
    /// The cluster-assigned application id.
    pub app_id: ApplicationId,
    /// URI of the staged application artifacts.
    pub app_dir: String,
    /// User identity for filesystem access, if any.
    pub fs_user: Option<String>,
    /// Metadata-store connect string, injected into container environments.
    pub zk_connect: String,
    /// Log-broker metadata path, injected into container environments.
    pub kafka_zk_path: Option<String>,
    /// The application master's own container.
    pub am_container: ContainerResources,
    /// Location of the staged credential tokens, if any.
    pub credentials_path: Option<PathBuf>,
    /// Per-runnable runtime arguments, from `arguments.json`.
    pub arguments: BTreeMap<String, Vec<String>>,
    /// Application-wide files to localize, from `localizeFiles.json`.
    pub localize_files: Vec<LocalFile>,
    /// Extra JVM options for containers, from `jvm.opts`.
    pub jvm_opts: Option<String>,
    /// The logging configuration template for containers, from
    /// `logback-template.xml`.
    pub logging_template: Option<String>,
    /// Memory reserved for the container runtime itself, in megabytes.
    pub reserved_memory_mb: u32,
    /// The log broker to run, if any.
    pub broker: LogBrokerConfig,
    /// Tunable intervals.
    pub tunables: AmTunables,
    /// The clock.
    pub now: NowFn,
}

/// The external collaborators an application master is wired to.
#[derive(Debug)]
pub struct Backends {
    /// The metadata store.
    pub store: Arc<dyn MetadataStore>,
    /// The cluster allocation protocol.
    pub resource_manager: Box<dyn ResourceManager>,
    /// Spawns in-container processes.
    pub launcher: Arc<dyn ContainerLauncher>,
    /// Holds the staged artifacts.
    pub storage: Arc<dyn ApplicationStorage>,
}

/// A handle onto a started application master, for observation and
/// shutdown.
#[derive(Clone, Debug)]
pub struct ApplicationMasterHandle {
    /// The container registry.
    pub registry: Arc<ContainerRegistry>,
    /// The desired instance counts.
    pub expected: Arc<ExpectedCounts>,
    shutdown: Arc<watch::Sender<bool>>,
    tracker_url: String,
}

impl ApplicationMasterHandle {
    /// Triggers a clean shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// The tracker URL serving the live resource report.
    pub fn tracker_url(&self) -> &str {
        &self.tracker_url
    }
}

/// A started application master.
///
/// [`ApplicationMasterService::start`] performs the startup sequence;
/// [`ApplicationMasterService::run`] drives the provisioning loop until
/// completion, abort, or an external shutdown, then performs the ordered
/// teardown.
pub struct ApplicationMasterService {
    app_dir: String,
    tunables: AmTunables,
    client: MetadataClient,
    registry: Arc<ContainerRegistry>,
    expected: Arc<ExpectedCounts>,
    provisioner: Provisioner,
    tracker: Option<TrackerService>,
    broker: Option<LogBroker>,
    storage: Arc<dyn ApplicationStorage>,
    shutdown: Arc<watch::Sender<bool>>,
    worker_task: AbortOnDropHandle<()>,
    _bus_task: AbortOnDropHandle<()>,
}

impl ApplicationMasterService {
    /// Performs the startup sequence and returns the started service.
    ///
    /// A failure here is unrecoverable: the caller should exit non-zero.
    pub async fn start(
        config: ApplicationMasterConfig,
        backends: Backends,
    ) -> Result<ApplicationMasterService, anyhow::Error> {
        let spec = Arc::new(config.spec);
        spec.validate()?;

        // Credentials first: the launcher staged them alongside the spec,
        // and the AM-to-RM token must never reach containers.
        let credentials = Arc::new(CredentialsCache::load(config.credentials_path));

        let registry = Arc::new(ContainerRegistry::new());
        let expected = Arc::new(ExpectedCounts::new(
            config.now.clone(),
            spec.runnables
                .iter()
                .map(|(name, runtime)| (name.clone(), runtime.resource.instances)),
        ));
        let mut handler =
            create_handler(spec.event_handler.as_ref(), config.tunables.provision_timeout)?;
        let empty_configs = BTreeMap::new();
        handler.initialize(&EventHandlerContext {
            application: &spec.name,
            configs: spec
                .event_handler
                .as_ref()
                .map_or(&empty_configs, |spec| &spec.configs),
        });

        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);

        let worker = InstanceChangeWorker::new(
            changes_rx,
            Arc::clone(&registry),
            Arc::clone(&expected),
            requests_tx,
            Arc::clone(&spec),
            shutdown_rx,
        );
        let worker_task = task::spawn(|| "instance-changes", worker.run()).abort_on_drop();

        let broker = LogBroker::start(&config.broker)?;

        let tracker = TrackerService::serve(
            ReportSource::new(
                Arc::clone(&registry),
                config.app_id.to_string(),
                config.am_container.clone(),
            ),
            &config.am_container.host,
        )?;

        let mut rm = RmClient::new(backends.resource_manager);
        rm.start(&config.am_container.host, Some(tracker.url()))
            .await
            .context("registering with the resource manager")?;

        // The application's metadata namespace: a persistent node holding
        // the service state, an ephemeral live node, and the directories
        // containers and controllers use.
        let namespace = format!("/{}", config.app_run_id);
        let root = MetadataClient::new(backends.store, "")?;
        root.ensure_path(&namespace).await?;
        let client = root.namespaced(&namespace)?;
        client
            .set_data(
                "",
                &serde_json::to_vec(&ServiceStateData {
                    state: ServiceState::Running,
                })
                .expect("service state serializes"),
            )
            .await?;
        let live = ApplicationMasterLiveNodeData {
            yarn_app_id: config.app_id.to_string(),
            cluster_time: config.app_id.cluster_time,
            container_id: config.am_container.container_id.clone(),
        };
        create_or_replace(&client, "/live", &serde_json::to_vec(&live)?).await?;
        client.ensure_path("/kafka").await?;
        client.ensure_path(APPLICATION_MESSAGES).await?;
        for runnable in spec.runnables.keys() {
            client
                .ensure_path(&format!("/runnables/{runnable}/instances"))
                .await?;
            client.ensure_path(&runnable_messages(runnable)).await?;
        }

        let bus = MessageBus::new(
            client.clone(),
            Arc::clone(&registry),
            changes_tx,
            Arc::clone(&credentials),
            spec.runnables.keys().cloned().collect(),
        );
        let bus_task = task::spawn(|| "message-bus", bus.run()).abort_on_drop();

        let mut base_env = BTreeMap::new();
        base_env.insert(env::APP_DIR.to_string(), config.app_dir.clone());
        base_env.insert(env::APP_RUN_ID.to_string(), config.app_run_id.to_string());
        base_env.insert(env::ZK_CONNECT.to_string(), config.zk_connect);
        base_env.insert(
            env::RESERVED_MEMORY_MB.to_string(),
            config.reserved_memory_mb.to_string(),
        );
        if let Some(fs_user) = config.fs_user {
            base_env.insert(env::FS_USER.to_string(), fs_user);
        }
        if let Some(kafka) = broker
            .connect_string()
            .map(str::to_string)
            .or(config.kafka_zk_path)
        {
            base_env.insert(env::LOG_KAFKA_ZK.to_string(), kafka);
        }

        let provisioner = Provisioner::new(
            rm,
            Arc::clone(&registry),
            Arc::clone(&expected),
            backends.launcher,
            handler,
            Arc::clone(&spec),
            credentials,
            config.now,
            config.tunables.provision_timeout,
            base_env,
            config.arguments,
            config.localize_files,
            config.jvm_opts,
            config.logging_template,
            requests_rx,
        );

        info!(
            "application master started for {} ({})",
            spec.name, config.app_id
        );
        Ok(ApplicationMasterService {
            app_dir: config.app_dir,
            tunables: config.tunables,
            client,
            registry,
            expected,
            provisioner,
            tracker: Some(tracker),
            broker: Some(broker),
            storage: backends.storage,
            shutdown,
            worker_task,
            _bus_task: bus_task,
        })
    }

    /// Returns a handle for observation and shutdown.
    pub fn handle(&self) -> ApplicationMasterHandle {
        ApplicationMasterHandle {
            registry: Arc::clone(&self.registry),
            expected: Arc::clone(&self.expected),
            shutdown: Arc::clone(&self.shutdown),
            tracker_url: self
                .tracker
                .as_ref()
                .map(|tracker| tracker.url().to_string())
                .unwrap_or_default(),
        }
    }

    /// Drives the provisioning loop to completion, then tears everything
    /// down in order.
    pub async fn run(mut self) -> Result<(), anyhow::Error> {
        let mut interval = time::interval(self.tunables.allocate_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut final_message = "application complete";
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                () = wait_shutdown(&mut shutdown_rx) => {
                    final_message = "stopped on request";
                    break;
                }
            }
            match self.provisioner.tick().await {
                Ok(TickOutcome::Continue) => {}
                Ok(TickOutcome::Finished) => break,
                Ok(TickOutcome::Abort) => {
                    final_message = "aborted by event handler";
                    break;
                }
                // The 1 Hz loop re-drives; a transiently failing poll cycle
                // is not fatal.
                Err(e) => error!("provisioning cycle failed: {e:#}"),
            }
            if *shutdown_rx.borrow() {
                final_message = "stopped on request";
                break;
            }
        }
        self.teardown(final_message).await;
        Ok(())
    }

    async fn teardown(&mut self, message: &str) {
        info!("shutting down: {message}");
        self.provisioner.destroy_handler();

        let _ = self.shutdown.send(true);
        if let Err(e) = (&mut *self.worker_task).await {
            warn!("instance-change worker failed: {e}");
        }

        let ids = self.registry.container_ids().await;
        self.registry.stop_all().await;
        self.provisioner
            .drain_completions(ids, self.tunables.stop_drain)
            .await;

        if let Some(tracker) = self.tracker.take() {
            tracker.stop().await;
        }

        if let Err(e) = self.storage.remove_application_dir(&self.app_dir).await {
            warn!("failed to remove application directory: {e:#}");
        }

        let terminated = serde_json::to_vec(&ServiceStateData {
            state: ServiceState::Terminated,
        })
        .expect("service state serializes");
        if let Err(e) = self.client.set_data("", &terminated).await {
            warn!("failed to record terminated state: {e}");
        }
        match self.client.delete("/live").await {
            Ok(()) | Err(StoreError::NoNode(_)) => {}
            Err(e) => warn!("failed to remove live node: {e}"),
        }

        // Give the log shipper a moment to drain before its broker goes
        // away.
        time::sleep(self.tunables.log_drain).await;
        if let Some(broker) = self.broker.take() {
            broker.stop().await;
        }

        if let Err(e) = self
            .provisioner
            .deregister(FinalStatus::Succeeded, message)
            .await
        {
            warn!("failed to deregister from the resource manager: {e:#}");
        }
        info!("application master stopped");
    }
}

async fn create_or_replace(
    client: &MetadataClient,
    path: &str,
    data: &[u8],
) -> Result<(), StoreError> {
    match client.create(path, data, CreateMode::Ephemeral).await {
        Ok(_) => Ok(()),
        Err(StoreError::NodeExists(_)) => client.set_data(path, data).await,
        Err(e) => Err(e),
    }
}
