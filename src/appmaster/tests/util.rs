// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! Test harness for end-to-end application master scenarios: a scripted
//! resource manager, an in-memory metadata store, and a launcher that
//! records starts, stops, and delivered messages instead of spawning
//! processes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use weave_api::id::RunId;
use weave_api::message::Message;
use weave_api::report::ContainerResources;
use weave_api::spec::{
    ApplicationSpec, EventHandlerSpec, Order, OrderType, ResourceSpec, RunnableSpec, RuntimeSpec,
};
use weave_appmaster::broker::LogBrokerConfig;
use weave_appmaster::launcher::{ContainerLauncher, InstanceController, LaunchContext};
use weave_appmaster::messages::{runnable_messages, MESSAGE_PREFIX};
use weave_appmaster::service::{
    AmTunables, ApplicationMasterConfig, ApplicationMasterHandle, ApplicationMasterService,
    Backends,
};
use weave_appmaster::storage::LocalStorage;
use weave_ore::now::NowFn;
use weave_yarn::testing::MockResourceManager;
use weave_yarn::{ApplicationId, ContainerStatus};
use weave_zk::{CreateMode, MemoryStore, MetadataClient};

/// The run id every test application runs under.
pub const TEST_RUN_ID: &str = "test-app-run";

/// A record of one launch.
#[derive(Clone, Debug)]
pub struct StartRecord {
    pub runnable: String,
    pub instance_id: u32,
    pub container_id: String,
    pub env: BTreeMap<String, String>,
    pub credentials: BTreeMap<String, String>,
}

/// A [`ContainerLauncher`] that records everything and runs nothing.
#[derive(Clone, Debug, Default)]
pub struct TestLauncher {
    pub starts: Arc<Mutex<Vec<StartRecord>>>,
    pub stop_log: Arc<Mutex<Vec<String>>>,
    pub messages: Arc<Mutex<Vec<(String, Message)>>>,
    /// Stops of this runnable's controllers fail (but still get recorded).
    pub fail_stops_of: Option<String>,
}

impl TestLauncher {
    pub fn starts(&self) -> Vec<StartRecord> {
        self.starts.lock().unwrap().clone()
    }

    pub fn stop_log(&self) -> Vec<String> {
        self.stop_log.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<(String, Message)> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerLauncher for TestLauncher {
    async fn launch(
        &self,
        ctx: LaunchContext,
    ) -> Result<Arc<dyn InstanceController>, anyhow::Error> {
        let runnable = ctx.runtime.runnable.name.clone();
        self.starts.lock().unwrap().push(StartRecord {
            runnable: runnable.clone(),
            instance_id: ctx.instance_id,
            container_id: ctx.container.id.to_string(),
            env: ctx.env.clone(),
            credentials: ctx.credentials.clone(),
        });
        Ok(Arc::new(TestController {
            key: format!("{runnable}-{}", ctx.instance_id),
            stop_log: Arc::clone(&self.stop_log),
            messages: Arc::clone(&self.messages),
            fail_stop: self.fail_stops_of.as_deref() == Some(&runnable),
        }))
    }
}

#[derive(Debug)]
struct TestController {
    key: String,
    stop_log: Arc<Mutex<Vec<String>>>,
    messages: Arc<Mutex<Vec<(String, Message)>>>,
    fail_stop: bool,
}

#[async_trait]
impl InstanceController for TestController {
    async fn send_message(&self, message: &Message) -> Result<(), anyhow::Error> {
        self.messages
            .lock()
            .unwrap()
            .push((self.key.clone(), message.clone()));
        Ok(())
    }

    async fn stop(&self) -> Result<(), anyhow::Error> {
        self.stop_log.lock().unwrap().push(self.key.clone());
        if self.fail_stop {
            anyhow::bail!("injected stop failure for {}", self.key);
        }
        Ok(())
    }

    fn handle_completed(&self, _status: &ContainerStatus) {}
}

/// A runnable with the given resource profile.
pub fn runtime_spec(name: &str, vcores: u32, memory_mb: u32, instances: u32) -> RuntimeSpec {
    RuntimeSpec {
        runnable: RunnableSpec {
            name: name.to_string(),
            command: "/bin/true".to_string(),
            args: vec![],
        },
        resource: ResourceSpec {
            virtual_cores: vcores,
            memory_mb,
            instances,
        },
        local_files: vec![],
    }
}

/// A single-runnable application.
pub fn one_runnable_spec(name: &str, instances: u32) -> ApplicationSpec {
    ApplicationSpec {
        name: format!("{name}-app"),
        runnables: BTreeMap::from([(name.to_string(), runtime_spec(name, 1, 1024, instances))]),
        orders: vec![],
        event_handler: None,
    }
}

/// Two runnables with an explicit startup order: `alpha` (2 instances)
/// before `beta` (1 instance).
pub fn ordered_spec() -> ApplicationSpec {
    ApplicationSpec {
        name: "ordered-app".to_string(),
        runnables: BTreeMap::from([
            ("alpha".to_string(), runtime_spec("alpha", 1, 1024, 2)),
            ("beta".to_string(), runtime_spec("beta", 1, 1024, 1)),
        ]),
        orders: vec![
            Order {
                names: BTreeSet::from(["alpha".to_string()]),
                order_type: OrderType::Started,
            },
            Order {
                names: BTreeSet::from(["beta".to_string()]),
                order_type: OrderType::Started,
            },
        ],
        event_handler: None,
    }
}

/// Attaches an event handler to a spec.
pub fn with_event_handler(mut spec: ApplicationSpec, name: &str) -> ApplicationSpec {
    spec.event_handler = Some(EventHandlerSpec {
        name: name.to_string(),
        configs: BTreeMap::new(),
    });
    spec
}

/// A clock that follows the tokio clock, so paused-time tests control the
/// provisioning timeout.
pub fn tokio_now_fn() -> NowFn {
    let start = tokio::time::Instant::now();
    NowFn::from(move || {
        u64::try_from(start.elapsed().as_millis()).expect("elapsed millis fit in u64")
    })
}

/// A started application master plus everything a test needs to poke it.
pub struct TestAm {
    pub handle: ApplicationMasterHandle,
    pub run: tokio::task::JoinHandle<Result<(), anyhow::Error>>,
    pub mock: MockResourceManager,
    pub store: MemoryStore,
    pub launcher: TestLauncher,
    /// A metadata client namespaced at the application's node.
    pub client: MetadataClient,
}

/// Starts an application master against the test backends and spawns its
/// run loop.
pub async fn start_am(
    spec: ApplicationSpec,
    mock: MockResourceManager,
    launcher: TestLauncher,
) -> TestAm {
    let store = MemoryStore::new();
    let app_id = ApplicationId {
        cluster_time: 1000,
        id: 1,
    };
    let config = ApplicationMasterConfig {
        spec,
        app_run_id: RunId::from_base(TEST_RUN_ID),
        app_id,
        app_dir: "./weave-test-app-does-not-exist".to_string(),
        fs_user: None,
        zk_connect: "test".to_string(),
        kafka_zk_path: Some("/weave/kafka".to_string()),
        am_container: ContainerResources {
            container_id: "container_1000_0001_01_000000".to_string(),
            instance_id: 0,
            host: "127.0.0.1".to_string(),
            virtual_cores: 1,
            memory_mb: 512,
        },
        credentials_path: None,
        arguments: BTreeMap::new(),
        localize_files: vec![],
        jvm_opts: None,
        logging_template: None,
        reserved_memory_mb: 200,
        broker: LogBrokerConfig::default(),
        tunables: AmTunables::default(),
        now: tokio_now_fn(),
    };
    let backends = Backends {
        store: Arc::new(store.clone()),
        resource_manager: Box::new(mock.clone()),
        launcher: Arc::new(launcher.clone()),
        storage: Arc::new(LocalStorage),
    };
    let service = ApplicationMasterService::start(config, backends)
        .await
        .expect("application master starts");
    let handle = service.handle();
    let run = tokio::spawn(service.run());
    let client = MetadataClient::new(Arc::new(store.clone()), &format!("/{TEST_RUN_ID}"))
        .expect("valid namespace");
    TestAm {
        handle,
        run,
        mock,
        store,
        launcher,
        client,
    }
}

impl TestAm {
    /// Waits until `runnable` has exactly `count` running instances.
    pub async fn wait_for_count(&self, runnable: &str, count: usize) {
        tokio::time::timeout(
            Duration::from_secs(60),
            self.handle.registry.wait_for_count(runnable, count),
        )
        .await
        .unwrap_or_else(|_| panic!("{runnable} never reached {count} instances"));
    }

    /// Posts a control message under the runnable's message directory.
    pub async fn post_runnable_message(&self, runnable: &str, message: &Message) -> String {
        self.client
            .create(
                &format!("{}/{MESSAGE_PREFIX}", runnable_messages(runnable)),
                &serde_json::to_vec(message).expect("message serializes"),
                CreateMode::PersistentSequential,
            )
            .await
            .expect("posting message")
    }

    /// Waits until the given message node has been acknowledged (deleted).
    pub async fn wait_for_ack(&self, path: &str) {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if !self.client.exists(path).await.expect("exists") {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("message {path} was never acknowledged"));
    }
}
