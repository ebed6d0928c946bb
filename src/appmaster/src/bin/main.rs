// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The application master binary, wired for single-host local mode: an
//! in-process metadata store, a local resource manager, and containers as
//! child processes. Cluster deployments wire real backends through the
//! library API from their own launcher instead.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use weave_api::env;
use weave_api::id::RunId;
use weave_api::report::ContainerResources;
use weave_api::spec::{ApplicationSpec, LocalFile};
use weave_appmaster::broker::LogBrokerConfig;
use weave_appmaster::launcher::ProcessLauncher;
use weave_appmaster::service::{
    AmTunables, ApplicationMasterConfig, ApplicationMasterService, Backends,
};
use weave_appmaster::storage::LocalStorage;
use weave_ore::now::{system_time, system_time_now_fn};
use weave_yarn::{ApplicationId, LocalResourceManager};
use weave_zk::MemoryStore;

/// Runs a Weave application on the local host.
#[derive(Debug, Parser)]
#[clap(name = "weave-appmaster")]
struct Args {
    /// The staged application directory, containing `weave.spec.json`.
    #[clap(long, env = "WEAVE_APP_DIR", default_value = "./weave-app", value_name = "DIR")]
    app_dir: PathBuf,
    /// The application run id; generated when absent.
    #[clap(long, env = "WEAVE_APP_RUN_ID")]
    app_run_id: Option<String>,
    /// User identity for filesystem access.
    #[clap(long, env = "WEAVE_FS_USER")]
    fs_user: Option<String>,
    /// Metadata-store connect string handed to containers.
    #[clap(long, env = "WEAVE_ZK_CONNECT", default_value = "local")]
    zk_connect: String,
    /// Log-broker metadata path handed to containers.
    #[clap(long, env = "WEAVE_LOG_KAFKA_ZK")]
    log_kafka_zk: Option<String>,
    /// Memory reserved for the container runtime, in megabytes.
    #[clap(long, env = "WEAVE_RESERVED_MEMORY_MB", default_value_t = env::DEFAULT_RESERVED_MEMORY_MB)]
    reserved_memory_mb: u32,
    /// The cluster-assigned application sequence number.
    #[clap(long, env = "YARN_APP_ID", default_value_t = 1)]
    yarn_app_id: u32,
    /// The cluster timestamp scoping the application id.
    #[clap(long, env = "YARN_APP_ID_CLUSTER_TIME")]
    yarn_app_id_cluster_time: Option<u64>,
    /// This process's own container id.
    #[clap(long, env = "YARN_CONTAINER_ID", default_value = "container_0_0001_01_000000")]
    yarn_container_id: String,
    /// This process's own host.
    #[clap(long, env = "YARN_CONTAINER_HOST", default_value = "localhost")]
    yarn_container_host: String,
    /// Virtual cores granted to this process's container.
    #[clap(long, env = "YARN_CONTAINER_VIRTUAL_CORES", default_value_t = 1)]
    yarn_container_virtual_cores: u32,
    /// Memory granted to this process's container, in megabytes.
    #[clap(long, env = "YARN_CONTAINER_MEMORY_MB", default_value_t = 512)]
    yarn_container_memory_mb: u32,
    /// Location of staged credential tokens.
    #[clap(long, value_name = "PATH")]
    credentials: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    if let Err(e) = run(Args::parse()).await {
        error!("application master failed to start: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let spec_path = args.app_dir.join(env::SPEC_FILE);
    let bytes = std::fs::read(&spec_path)
        .with_context(|| format!("reading {}", spec_path.display()))?;
    let spec = ApplicationSpec::from_json(&bytes)?;

    let arguments: BTreeMap<String, Vec<String>> =
        read_optional_json(args.app_dir.join(env::ARGUMENTS_FILE))?.unwrap_or_default();
    let localize_files: Vec<LocalFile> =
        read_optional_json(args.app_dir.join(env::LOCALIZE_FILES_FILE))?.unwrap_or_default();
    let jvm_opts = std::fs::read_to_string(args.app_dir.join(env::JVM_OPTS_FILE))
        .ok()
        .map(|opts| opts.trim().to_string())
        .filter(|opts| !opts.is_empty());
    let logging_template =
        std::fs::read_to_string(args.app_dir.join(env::LOGBACK_TEMPLATE_FILE)).ok();

    let app_run_id = match &args.app_run_id {
        Some(id) => RunId::from_base(id.as_str()),
        None => RunId::generate(),
    };
    let app_id = ApplicationId {
        cluster_time: args.yarn_app_id_cluster_time.unwrap_or_else(system_time),
        id: args.yarn_app_id,
    };

    let rm = LocalResourceManager::new(app_id);
    let launcher = Arc::new(ProcessLauncher::new(rm.handle()));

    let config = ApplicationMasterConfig {
        spec,
        app_run_id,
        app_id,
        app_dir: args.app_dir.display().to_string(),
        fs_user: args.fs_user,
        zk_connect: args.zk_connect,
        kafka_zk_path: args.log_kafka_zk,
        am_container: ContainerResources {
            container_id: args.yarn_container_id,
            instance_id: 0,
            host: args.yarn_container_host,
            virtual_cores: args.yarn_container_virtual_cores,
            memory_mb: args.yarn_container_memory_mb,
        },
        credentials_path: args.credentials,
        arguments,
        localize_files,
        jvm_opts,
        logging_template,
        reserved_memory_mb: args.reserved_memory_mb,
        broker: LogBrokerConfig::default(),
        tunables: AmTunables::default(),
        now: system_time_now_fn(),
    };
    let backends = Backends {
        store: Arc::new(MemoryStore::new()),
        resource_manager: Box::new(rm),
        launcher,
        storage: Arc::new(LocalStorage),
    };

    let service = ApplicationMasterService::start(config, backends).await?;
    let handle = service.handle();
    info!("resource report at {}", handle.tracker_url());

    // Interruption is a normal shutdown trigger.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            handle.shutdown();
        }
    });

    if let Err(e) = service.run().await {
        // Runtime failures are surfaced through the event handler and the
        // loop's own logging; they do not change the exit code.
        error!("application master terminated abnormally: {e:#}");
    }
    Ok(())
}

fn read_optional_json<T: serde::de::DeserializeOwned>(
    path: PathBuf,
) -> Result<Option<T>, anyhow::Error> {
    match std::fs::read(&path) {
        Ok(bytes) => Ok(Some(
            serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::from(e).context(format!("reading {}", path.display()))),
    }
}
