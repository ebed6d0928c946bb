// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The in-memory source of truth for live containers.
//!
//! One async mutex guards all registry state; one [`Notify`] is signalled on
//! every container add or remove. [`ContainerRegistry::wait_for_count`]
//! re-checks its predicate after every wakeup, so waiters tolerate spurious
//! and unrelated signals.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use futures::future;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use weave_api::env;
use weave_api::id::RunId;
use weave_api::message::Message;
use weave_api::report::{ContainerResources, ResourceReport};
use weave_yarn::{ContainerId, ContainerStatus, RmContainer};

use crate::launcher::{ContainerLauncher, InstanceController, LaunchRequest};

/// A live runnable instance and its controller.
#[derive(Clone, Debug)]
pub struct RunningContainer {
    /// The runnable this instance belongs to.
    pub runnable: String,
    /// The instance number within the runnable.
    pub instance_id: u32,
    /// The instance's run id.
    pub run_id: RunId,
    /// The granted container the instance occupies.
    pub container: RmContainer,
    /// The handle through which messages and stop requests reach the
    /// in-container process.
    pub controller: Arc<dyn InstanceController>,
}

impl RunningContainer {
    fn resources(&self) -> ContainerResources {
        ContainerResources {
            container_id: self.container.id.to_string(),
            instance_id: self.instance_id,
            host: self.container.host.clone(),
            virtual_cores: self.container.resource.virtual_cores,
            memory_mb: self.container.resource.memory_mb,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    /// Live instances per runnable, keyed by instance id. The key set is
    /// the instance-id bitmap: an id is "set" iff it is present.
    runnables: BTreeMap<String, BTreeMap<u32, RunningContainer>>,
    /// Container id → (runnable, instance id). A container id appears in at
    /// most one runnable's row at a time.
    containers: BTreeMap<ContainerId, (String, u32)>,
    /// Runnables in first-start order; stopped in reverse.
    start_sequence: Vec<String>,
}

impl RegistryState {
    fn count(&self, runnable: &str) -> usize {
        self.runnables.get(runnable).map_or(0, BTreeMap::len)
    }
}

/// The thread-safe registry of live containers.
pub struct ContainerRegistry {
    state: Mutex<RegistryState>,
    /// Signalled on every container add or remove.
    changed: Notify,
}

impl Default for ContainerRegistry {
    fn default() -> Self {
        ContainerRegistry::new()
    }
}

impl ContainerRegistry {
    /// Creates an empty registry.
    pub fn new() -> ContainerRegistry {
        ContainerRegistry {
            state: Mutex::new(RegistryState::default()),
            changed: Notify::new(),
        }
    }

    /// Starts one instance of a runnable in the given container.
    ///
    /// Allocates the smallest unused instance id, derives the instance's
    /// run id (reusing the base of any live instance, or rotating to a
    /// fresh base when none is live), invokes the launcher, and records the
    /// returned controller. On launcher failure nothing is recorded.
    pub async fn start(
        &self,
        request: LaunchRequest,
        container: RmContainer,
        launcher: &dyn ContainerLauncher,
    ) -> Result<RunId, anyhow::Error> {
        let runnable = request.runtime.runnable.name.clone();
        let mut state = self.state.lock().await;
        let row = state.runnables.entry(runnable.clone()).or_default();
        let instance_id = (0u32..)
            .find(|id| !row.contains_key(id))
            .expect("fewer than u32::MAX instances");
        let run_id = match row.values().next() {
            Some(live) => live.run_id.derive(instance_id),
            None => RunId::generate().derive(instance_id),
        };

        let mut ctx = request.into_context(instance_id, run_id.clone(), container.clone());
        ctx.env
            .insert(env::RUNNABLE_NAME.to_string(), runnable.clone());
        ctx.env
            .insert(env::INSTANCE_ID.to_string(), instance_id.to_string());
        ctx.env.insert(env::RUN_ID.to_string(), run_id.to_string());

        let controller = launcher.launch(ctx).await?;

        let row = state
            .runnables
            .get_mut(&runnable)
            .expect("row created above");
        row.insert(
            instance_id,
            RunningContainer {
                runnable: runnable.clone(),
                instance_id,
                run_id: run_id.clone(),
                container: container.clone(),
                controller,
            },
        );
        state
            .containers
            .insert(container.id.clone(), (runnable.clone(), instance_id));
        if state.start_sequence.last() != Some(&runnable) {
            state.start_sequence.push(runnable.clone());
        }
        drop(state);
        self.changed.notify_waiters();
        info!(
            "started {runnable} instance {instance_id} in container {} on {}",
            container.id, container.host
        );
        Ok(run_id)
    }

    /// Stops the instance of `runnable` with the highest instance id and
    /// removes it from the registry.
    pub async fn remove_last(&self, runnable: &str) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().await;
        let row = state
            .runnables
            .get_mut(runnable)
            .ok_or_else(|| anyhow!("no running instances of {runnable}"))?;
        let (&instance_id, last) = row
            .iter()
            .next_back()
            .ok_or_else(|| anyhow!("no running instances of {runnable}"))?;
        let controller = Arc::clone(&last.controller);
        info!("stopping {runnable} instance {instance_id}");
        if let Err(e) = controller.stop().await {
            warn!("failed to stop {runnable} instance {instance_id}: {e:#}");
        }
        let removed = row.remove(&instance_id).expect("instance looked up above");
        state.containers.remove(&removed.container.id);
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Blocks until exactly `count` instances of `runnable` are running.
    pub async fn wait_for_count(&self, runnable: &str, count: usize) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().await.count(runnable) == count {
                return;
            }
            notified.await;
        }
    }

    /// The number of running instances of `runnable`.
    pub async fn count(&self, runnable: &str) -> usize {
        self.state.lock().await.count(runnable)
    }

    /// The total number of running containers.
    pub async fn count_all(&self) -> usize {
        let state = self.state.lock().await;
        state.containers.len()
    }

    /// Whether no containers are running.
    pub async fn is_empty(&self) -> bool {
        self.count_all().await == 0
    }

    /// The ids of all running containers.
    pub async fn container_ids(&self) -> Vec<ContainerId> {
        let state = self.state.lock().await;
        state.containers.keys().cloned().collect()
    }

    /// Sends a message to every container of every runnable, returning once
    /// every per-controller send attempt has terminated.
    pub async fn send_to_all(&self, message: &Message) -> usize {
        let targets: Vec<RunningContainer> = {
            let state = self.state.lock().await;
            state
                .runnables
                .values()
                .flat_map(|row| row.values().cloned())
                .collect()
        };
        Self::fan_out(targets, message).await
    }

    /// Sends a message to every container of one runnable, returning once
    /// every per-controller send attempt has terminated.
    pub async fn send_to_runnable(&self, runnable: &str, message: &Message) -> usize {
        let targets: Vec<RunningContainer> = {
            let state = self.state.lock().await;
            state
                .runnables
                .get(runnable)
                .map(|row| row.values().cloned().collect())
                .unwrap_or_default()
        };
        Self::fan_out(targets, message).await
    }

    async fn fan_out(targets: Vec<RunningContainer>, message: &Message) -> usize {
        let sent = targets.len();
        let sends = targets.into_iter().map(|target| async move {
            if let Err(e) = target.controller.send_message(message).await {
                warn!(
                    "failed to deliver message to {} instance {}: {e:#}",
                    target.runnable, target.instance_id
                );
            }
        });
        future::join_all(sends).await;
        sent
    }

    /// Processes a completion reported by the resource manager.
    ///
    /// Frees the instance id and, for an abnormal exit, returns the
    /// runnable name so the caller can re-request a container. A completion
    /// for a container that is no longer registered (it was intentionally
    /// removed) is a no-op.
    pub async fn handle_completed(&self, status: &ContainerStatus) -> Option<String> {
        let removed = {
            let mut state = self.state.lock().await;
            let Some((runnable, instance_id)) = state.containers.remove(&status.container_id)
            else {
                debug!(
                    "completion for unregistered container {}; ignoring",
                    status.container_id
                );
                return None;
            };
            state
                .runnables
                .get_mut(&runnable)
                .and_then(|row| row.remove(&instance_id))
                .expect("registered container has a row entry")
        };
        removed.controller.handle_completed(status);
        self.changed.notify_waiters();
        if status.is_abnormal() {
            warn!(
                "container {} of {} instance {} exited abnormally with status {}",
                status.container_id, removed.runnable, removed.instance_id, status.exit_status
            );
            Some(removed.runnable)
        } else {
            info!(
                "container {} of {} instance {} completed",
                status.container_id, removed.runnable, removed.instance_id
            );
            None
        }
    }

    /// Stops everything, in reverse start order.
    ///
    /// Containers of the same runnable stop in parallel; a failed stop is
    /// logged and does not abort the sequence. All registry state is
    /// cleared at the end.
    pub async fn stop_all(&self) {
        let (sequence, mut rows) = {
            let mut state = self.state.lock().await;
            let sequence = std::mem::take(&mut state.start_sequence);
            let rows = std::mem::take(&mut state.runnables);
            state.containers.clear();
            (sequence, rows)
        };
        for runnable in sequence.iter().rev() {
            let Some(row) = rows.remove(runnable) else {
                continue;
            };
            info!("stopping {} containers of {runnable}", row.len());
            let stops = row.into_values().map(|container| async move {
                if let Err(e) = container.controller.stop().await {
                    warn!(
                        "failed to stop {} instance {}: {e:#}",
                        container.runnable, container.instance_id
                    );
                }
            });
            future::join_all(stops).await;
        }
        self.changed.notify_waiters();
    }

    /// Builds the live resource report.
    pub async fn resource_report(
        &self,
        app_id: &str,
        app_master: ContainerResources,
    ) -> ResourceReport {
        let state = self.state.lock().await;
        let resources = state
            .runnables
            .iter()
            .filter(|(_, row)| !row.is_empty())
            .map(|(runnable, row)| {
                (
                    runnable.clone(),
                    row.values().map(RunningContainer::resources).collect(),
                )
            })
            .collect();
        ResourceReport {
            app_id: app_id.to_string(),
            app_master_resources: app_master,
            resources,
        }
    }

    /// The run id of any live instance of `runnable`, if one exists.
    ///
    /// Exposes the current base epoch of the runnable; used by tests to
    /// observe base rotation.
    pub async fn live_run_id(&self, runnable: &str) -> Option<RunId> {
        let state = self.state.lock().await;
        state
            .runnables
            .get(runnable)
            .and_then(|row| row.values().next())
            .map(|live| live.run_id.clone())
    }
}

impl std::fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ContainerRegistry").finish_non_exhaustive()
    }
}

/// Returns an error if `message` has no valid target; used by dispatchers
/// before fanning out.
pub fn target_runnable(message: &Message) -> Result<&str, anyhow::Error> {
    match message.runnable_name.as_deref() {
        Some(name) => Ok(name),
        None => bail!("runnable-scoped message carries no runnable name"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use proptest::prelude::*;

    use weave_api::spec::{ResourceSpec, RunnableSpec, RuntimeSpec};
    use weave_yarn::Resource;

    use super::*;
    use crate::launcher::LaunchContext;

    /// A controller that records stop order into a shared log.
    #[derive(Debug)]
    struct RecordingController {
        runnable: String,
        instance_id: u32,
        stop_log: Arc<StdMutex<Vec<String>>>,
        fail_stop: bool,
    }

    #[async_trait]
    impl InstanceController for RecordingController {
        async fn send_message(&self, _message: &Message) -> Result<(), anyhow::Error> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), anyhow::Error> {
            self.stop_log
                .lock()
                .unwrap()
                .push(format!("{}-{}", self.runnable, self.instance_id));
            if self.fail_stop {
                bail!("injected stop failure");
            }
            Ok(())
        }

        fn handle_completed(&self, _status: &ContainerStatus) {}
    }

    #[derive(Debug, Default)]
    struct TestLauncher {
        stop_log: Arc<StdMutex<Vec<String>>>,
        fail_stops_of: Option<String>,
    }

    #[async_trait]
    impl ContainerLauncher for TestLauncher {
        async fn launch(
            &self,
            ctx: LaunchContext,
        ) -> Result<Arc<dyn InstanceController>, anyhow::Error> {
            Ok(Arc::new(RecordingController {
                runnable: ctx.runtime.runnable.name.clone(),
                instance_id: ctx.instance_id,
                stop_log: Arc::clone(&self.stop_log),
                fail_stop: self.fail_stops_of.as_deref() == Some(&ctx.runtime.runnable.name),
            }))
        }
    }

    fn runtime_spec(name: &str) -> RuntimeSpec {
        RuntimeSpec {
            runnable: RunnableSpec {
                name: name.to_string(),
                command: "true".to_string(),
                args: vec![],
            },
            resource: ResourceSpec {
                virtual_cores: 1,
                memory_mb: 128,
                instances: 1,
            },
            local_files: vec![],
        }
    }

    fn launch_request(name: &str) -> LaunchRequest {
        LaunchRequest {
            runtime: runtime_spec(name),
            arguments: vec![],
            localize_files: vec![],
            env: BTreeMap::new(),
            credentials: BTreeMap::new(),
            jvm_opts: None,
            logging_template: None,
        }
    }

    fn container(id: u64) -> RmContainer {
        RmContainer {
            id: ContainerId::new(format!("container_{id:06}")),
            host: "host.example.com".to_string(),
            resource: Resource {
                virtual_cores: 1,
                memory_mb: 128,
            },
        }
    }

    async fn start(
        registry: &ContainerRegistry,
        launcher: &TestLauncher,
        name: &str,
        id: u64,
    ) -> RunId {
        registry
            .start(launch_request(name), container(id), launcher)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_instance_ids_lowest_free_first() {
        let registry = ContainerRegistry::new();
        let launcher = TestLauncher::default();
        let a = start(&registry, &launcher, "worker", 1).await;
        let b = start(&registry, &launcher, "worker", 2).await;
        let c = start(&registry, &launcher, "worker", 3).await;
        assert_eq!(
            (a.instance(), b.instance(), c.instance()),
            (Some(0), Some(1), Some(2))
        );

        // Complete instance 1; the freed slot is reused before any higher
        // slot.
        registry
            .handle_completed(&ContainerStatus {
                container_id: ContainerId::new("container_000002"),
                exit_status: 0,
            })
            .await;
        let d = start(&registry, &launcher, "worker", 4).await;
        assert_eq!(d.instance(), Some(1));
    }

    #[tokio::test]
    async fn test_remove_last_stops_highest_instance() {
        let registry = ContainerRegistry::new();
        let launcher = TestLauncher::default();
        for id in 1..=3 {
            start(&registry, &launcher, "worker", id).await;
        }
        registry.remove_last("worker").await.unwrap();
        assert_eq!(
            launcher.stop_log.lock().unwrap().clone(),
            vec!["worker-2".to_string()]
        );
        assert_eq!(registry.count("worker").await, 2);

        // The next start reuses the freed slot.
        let next = start(&registry, &launcher, "worker", 4).await;
        assert_eq!(next.instance(), Some(2));
    }

    #[tokio::test]
    async fn test_base_rotates_when_runnable_empties() {
        let registry = ContainerRegistry::new();
        let launcher = TestLauncher::default();
        let first = start(&registry, &launcher, "worker", 1).await;
        let second = start(&registry, &launcher, "worker", 2).await;
        assert_eq!(first.base(), second.base());

        for id in ["container_000001", "container_000002"] {
            registry
                .handle_completed(&ContainerStatus {
                    container_id: ContainerId::new(id),
                    exit_status: 0,
                })
                .await;
        }
        assert!(registry.is_empty().await);
        let fresh = start(&registry, &launcher, "worker", 3).await;
        assert_ne!(fresh.base(), first.base());
    }

    #[tokio::test]
    async fn test_abnormal_exit_flags_restart() {
        let registry = ContainerRegistry::new();
        let launcher = TestLauncher::default();
        start(&registry, &launcher, "worker", 1).await;
        let restart = registry
            .handle_completed(&ContainerStatus {
                container_id: ContainerId::new("container_000001"),
                exit_status: 137,
            })
            .await;
        assert_eq!(restart.as_deref(), Some("worker"));

        // A completion for a container removed on purpose is a no-op.
        let restart = registry
            .handle_completed(&ContainerStatus {
                container_id: ContainerId::new("container_000001"),
                exit_status: 137,
            })
            .await;
        assert_eq!(restart, None);
    }

    #[tokio::test]
    async fn test_stop_all_reverse_start_order() {
        let registry = ContainerRegistry::new();
        let launcher = TestLauncher {
            fail_stops_of: Some("b".to_string()),
            ..Default::default()
        };
        start(&registry, &launcher, "a", 1).await;
        start(&registry, &launcher, "a", 2).await;
        start(&registry, &launcher, "b", 3).await;
        registry.stop_all().await;

        let log = launcher.stop_log.lock().unwrap().clone();
        // Every b stop precedes every a stop, even though b's stops fail.
        let first_a = log.iter().position(|e| e.starts_with("a-")).unwrap();
        let last_b = log.iter().rposition(|e| e.starts_with("b-")).unwrap();
        assert!(last_b < first_a, "stop order was {log:?}");
        assert!(registry.is_empty().await);
        assert_eq!(registry.container_ids().await, vec![]);
    }

    #[tokio::test]
    async fn test_wait_for_count_observes_changes() {
        let registry = Arc::new(ContainerRegistry::new());
        let launcher = TestLauncher::default();
        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_for_count("worker", 2).await })
        };
        start(&registry, &launcher, "worker", 1).await;
        start(&registry, &launcher, "worker", 2).await;
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_report_lists_only_registered_containers() {
        let registry = ContainerRegistry::new();
        let launcher = TestLauncher::default();
        start(&registry, &launcher, "worker", 1).await;
        start(&registry, &launcher, "api", 2).await;
        let report = registry
            .resource_report(
                "application_1_0001",
                ContainerResources {
                    container_id: "container_000000".into(),
                    instance_id: 0,
                    host: "am.example.com".into(),
                    virtual_cores: 1,
                    memory_mb: 512,
                },
            )
            .await;
        let ids: BTreeSet<String> = report
            .resources
            .values()
            .flatten()
            .map(|c| c.container_id.clone())
            .collect();
        let registered: BTreeSet<String> = registry
            .container_ids()
            .await
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(ids, registered);
    }

    /// One step of the model-checked operation sequence.
    #[derive(Clone, Debug)]
    enum Op {
        Start(u8),
        RemoveLast(u8),
        Complete { runnable: u8, abnormal: bool },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..3).prop_map(Op::Start),
            (0u8..3).prop_map(Op::RemoveLast),
            ((0u8..3), any::<bool>())
                .prop_map(|(runnable, abnormal)| Op::Complete { runnable, abnormal }),
        ]
    }

    proptest! {
        /// Drives random operation sequences and checks the §bitmap
        /// invariants: instance ids are always the lowest free, counts
        /// match the id set, and the report never lists an unregistered
        /// container.
        #[test]
        fn test_registry_invariants(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("building runtime");
            runtime.block_on(async move {
                let registry = ContainerRegistry::new();
                let launcher = TestLauncher::default();
                // Model: per runnable, live (instance_id, container_id).
                let mut model: BTreeMap<String, BTreeMap<u32, String>> = BTreeMap::new();
                let mut next_container = 0u64;

                for op in ops {
                    match op {
                        Op::Start(r) => {
                            let name = format!("r{r}");
                            next_container += 1;
                            let run_id = start(&registry, &launcher, &name, next_container).await;
                            let row = model.entry(name.clone()).or_default();
                            let expected_id = (0u32..)
                                .find(|id| !row.contains_key(id))
                                .unwrap();
                            prop_assert_eq!(run_id.instance(), Some(expected_id));
                            row.insert(expected_id, format!("container_{next_container:06}"));
                        }
                        Op::RemoveLast(r) => {
                            let name = format!("r{r}");
                            let row = model.entry(name.clone()).or_default();
                            match row.iter().next_back().map(|(id, _)| *id) {
                                Some(highest) => {
                                    registry.remove_last(&name).await.unwrap();
                                    row.remove(&highest);
                                }
                                None => {
                                    prop_assert!(registry.remove_last(&name).await.is_err());
                                }
                            }
                        }
                        Op::Complete { runnable, abnormal } => {
                            let name = format!("r{runnable}");
                            let row = model.entry(name.clone()).or_default();
                            if let Some((&id, container_id)) = row.iter().next() {
                                let container_id = container_id.clone();
                                let restart = registry
                                    .handle_completed(&ContainerStatus {
                                        container_id: ContainerId::new(container_id),
                                        exit_status: if abnormal { 1 } else { 0 },
                                    })
                                    .await;
                                prop_assert_eq!(
                                    restart.is_some(),
                                    abnormal,
                                    "restart flag mismatch"
                                );
                                row.remove(&id);
                            }
                        }
                    }

                    // Counts match the model after every step.
                    for (name, row) in &model {
                        prop_assert_eq!(registry.count(name).await, row.len());
                    }
                    let model_ids: BTreeSet<String> = model
                        .values()
                        .flat_map(|row| row.values().cloned())
                        .collect();
                    let registered: BTreeSet<String> = registry
                        .container_ids()
                        .await
                        .into_iter()
                        .map(|id| id.to_string())
                        .collect();
                    prop_assert_eq!(&model_ids, &registered);
                }
                Ok(())
            })?;
        }
    }
}
