// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The live resource report.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A snapshot of every live container and its resource usage, served by the
/// application master's tracker endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReport {
    /// The cluster-assigned application id.
    pub app_id: String,
    /// The application master's own container.
    pub app_master_resources: ContainerResources,
    /// Live containers, keyed by runnable name.
    pub resources: BTreeMap<String, Vec<ContainerResources>>,
}

/// One container's identity and resource profile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerResources {
    /// The cluster-assigned container id.
    #[serde(rename = "containerId")]
    pub container_id: String,
    /// The instance number within the runnable.
    #[serde(rename = "instanceId")]
    pub instance_id: u32,
    /// The host the container runs on.
    pub host: String,
    /// Virtual cores granted to the container.
    #[serde(rename = "vcores")]
    pub virtual_cores: u32,
    /// Memory granted to the container, in megabytes.
    #[serde(rename = "memoryMB")]
    pub memory_mb: u32,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn container_resources_strategy() -> impl Strategy<Value = ContainerResources> {
        (any::<u64>(), any::<u32>(), 0u32..64, 1u32..128, 1u32..1 << 20).prop_map(
            |(container, instance_id, host, virtual_cores, memory_mb)| ContainerResources {
                container_id: format!("container_{container:06}"),
                instance_id,
                host: format!("host{host}.example.com"),
                virtual_cores,
                memory_mb,
            },
        )
    }

    fn report_strategy() -> impl Strategy<Value = ResourceReport> {
        (
            any::<u32>(),
            container_resources_strategy(),
            proptest::collection::btree_map(
                (0u32..16).prop_map(|n| format!("runnable{n}")),
                proptest::collection::vec(container_resources_strategy(), 0..4),
                0..4,
            ),
        )
            .prop_map(|(app, app_master_resources, resources)| ResourceReport {
                app_id: format!("application_0_{app:04}"),
                app_master_resources,
                resources,
            })
    }

    proptest! {
        #[test]
        fn test_json_round_trip(report in report_strategy()) {
            let json = serde_json::to_string(&report).unwrap();
            let reparsed: ResourceReport = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(report, reparsed);
        }
    }

    #[test]
    fn test_wire_keys() {
        let report = ResourceReport {
            app_id: "application_1_0001".into(),
            app_master_resources: ContainerResources {
                container_id: "container_1_0001_01_000001".into(),
                instance_id: 0,
                host: "am.example.com".into(),
                virtual_cores: 1,
                memory_mb: 512,
            },
            resources: BTreeMap::new(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("appId").is_some());
        assert!(json.get("appMasterResources").is_some());
        let am = &json["appMasterResources"];
        for key in ["containerId", "instanceId", "host", "vcores", "memoryMB"] {
            assert!(am.get(key).is_some(), "missing key {key}");
        }
    }
}
