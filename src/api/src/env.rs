// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! Environment keys and file names shared between the launcher, the
//! application master, and container processes.
//!
//! These names are load-bearing: the launcher writes them, the application
//! master reads them, and the application master writes a subset of them
//! back into every container it launches.

/// URI of the staged application artifacts.
pub const APP_DIR: &str = "WEAVE_APP_DIR";

/// The application's run id.
pub const APP_RUN_ID: &str = "WEAVE_APP_RUN_ID";

/// User identity for filesystem access.
pub const FS_USER: &str = "WEAVE_FS_USER";

/// Metadata-store connect string.
pub const ZK_CONNECT: &str = "WEAVE_ZK_CONNECT";

/// Log-broker metadata path.
pub const LOG_KAFKA_ZK: &str = "WEAVE_LOG_KAFKA_ZK";

/// Memory reserved for the runtime itself, in megabytes. Optional.
pub const RESERVED_MEMORY_MB: &str = "WEAVE_RESERVED_MEMORY_MB";

/// The default for [`RESERVED_MEMORY_MB`].
pub const DEFAULT_RESERVED_MEMORY_MB: u32 = 200;

/// The runnable a container hosts. Set by the application master.
pub const RUNNABLE_NAME: &str = "WEAVE_RUNNABLE_NAME";

/// The instance number of a container's runnable. Set by the application
/// master.
pub const INSTANCE_ID: &str = "WEAVE_INSTANCE_ID";

/// The desired instance count of a container's runnable at launch time. Set
/// by the application master.
pub const INSTANCE_COUNT: &str = "WEAVE_INSTANCE_COUNT";

/// The run id of a container's runnable instance. Set by the application
/// master.
pub const RUN_ID: &str = "WEAVE_RUN_ID";

/// The cluster-assigned application id.
pub const YARN_APP_ID: &str = "YARN_APP_ID";

/// The cluster timestamp embedded in the application id.
pub const YARN_APP_ID_CLUSTER_TIME: &str = "YARN_APP_ID_CLUSTER_TIME";

/// The application master's own container id.
pub const YARN_CONTAINER_ID: &str = "YARN_CONTAINER_ID";

/// The host of the application master's own container.
pub const YARN_CONTAINER_HOST: &str = "YARN_CONTAINER_HOST";

/// Virtual cores granted to the application master's own container.
pub const YARN_CONTAINER_VIRTUAL_CORES: &str = "YARN_CONTAINER_VIRTUAL_CORES";

/// Memory granted to the application master's own container, in megabytes.
pub const YARN_CONTAINER_MEMORY_MB: &str = "YARN_CONTAINER_MEMORY_MB";

/// The application specification, staged by the launcher.
pub const SPEC_FILE: &str = "weave.spec.json";

/// Per-runnable runtime arguments, staged by the launcher.
pub const ARGUMENTS_FILE: &str = "arguments.json";

/// Files to localize into each container, staged by the launcher.
pub const LOCALIZE_FILES_FILE: &str = "localizeFiles.json";

/// Extra JVM options for containers. Optional.
pub const JVM_OPTS_FILE: &str = "jvm.opts";

/// Logging configuration template for containers. Optional.
pub const LOGBACK_TEMPLATE_FILE: &str = "logback-template.xml";
