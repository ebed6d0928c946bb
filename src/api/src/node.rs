// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! Payloads stored in the metadata store.

use serde::{Deserialize, Serialize};
use weave_ore::now::EpochMillis;

/// The payload of the application master's ephemeral live node.
///
/// Presence of the node means the application master is alive; the payload
/// lets external observers locate the cluster-side application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationMasterLiveNodeData {
    /// The cluster-assigned application id.
    #[serde(rename = "yarnAppId")]
    pub yarn_app_id: String,
    /// The cluster timestamp embedded in the application id.
    #[serde(rename = "clusterTime")]
    pub cluster_time: EpochMillis,
    /// The application master's own container id.
    #[serde(rename = "containerId")]
    pub container_id: String,
}

/// The service state recorded on the application master's persistent node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    /// The application master is running.
    Running,
    /// The application master has shut down.
    Terminated,
}

/// The JSON document stored on the application master's persistent node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStateData {
    /// The current state.
    pub state: ServiceState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_node_wire_keys() {
        let data = ApplicationMasterLiveNodeData {
            yarn_app_id: "application_1_0001".into(),
            cluster_time: 12345,
            container_id: "container_1_0001_01_000001".into(),
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "yarnAppId": "application_1_0001",
                "clusterTime": 12345,
                "containerId": "container_1_0001_01_000001",
            })
        );
    }
}
