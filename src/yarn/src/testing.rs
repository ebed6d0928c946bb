// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! A scriptable resource manager for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::{
    Allocation, ContainerId, ContainerStatus, FinalStatus, Resource, ResourceManager,
    RmContainer,
};

/// A [`ResourceManager`] whose grants are scripted by the test.
///
/// By default every ask is granted on the next allocate cycle. A grant
/// budget can be imposed to simulate a cluster that never (or only
/// partially) delivers, and completions can be injected to simulate
/// container exits.
#[derive(Debug, Clone)]
pub struct MockResourceManager {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Debug)]
struct MockState {
    /// One entry per unmatched ask.
    pending: VecDeque<Resource>,
    /// Total remaining grants, or `None` for unlimited.
    grant_budget: Option<u64>,
    /// Completions awaiting the next allocate cycle.
    completed: VecDeque<ContainerStatus>,
    /// Every `request_containers` call, in order.
    requests: Vec<(Resource, u32)>,
    /// Every `release_requests` call, in order.
    releases: Vec<(Resource, u32)>,
    registered: Option<(String, Option<String>)>,
    deregistered: Option<(FinalStatus, String)>,
    next_container: u64,
}

impl Default for MockResourceManager {
    fn default() -> Self {
        MockResourceManager::new()
    }
}

impl MockResourceManager {
    /// Creates a mock that grants every ask.
    pub fn new() -> MockResourceManager {
        MockResourceManager {
            inner: Arc::new(Mutex::new(MockState {
                pending: VecDeque::new(),
                grant_budget: None,
                completed: VecDeque::new(),
                requests: Vec::new(),
                releases: Vec::new(),
                registered: None,
                deregistered: None,
                next_container: 1,
            })),
        }
    }

    /// Creates a mock that grants at most `budget` containers in total.
    /// `0` simulates a cluster that never delivers.
    pub fn with_grant_budget(budget: u64) -> MockResourceManager {
        let mock = MockResourceManager::new();
        mock.lock().grant_budget = Some(budget);
        mock
    }

    /// Injects a completion, delivered on the next allocate cycle.
    pub fn inject_completion(&self, container_id: ContainerId, exit_status: i32) {
        self.lock().completed.push_back(ContainerStatus {
            container_id,
            exit_status,
        });
    }

    /// Every `request_containers` call observed so far.
    pub fn requests(&self) -> Vec<(Resource, u32)> {
        self.lock().requests.clone()
    }

    /// Every `release_requests` call observed so far.
    pub fn released(&self) -> Vec<(Resource, u32)> {
        self.lock().releases.clone()
    }

    /// The final status reported on deregistration, if any.
    pub fn deregistered(&self) -> Option<(FinalStatus, String)> {
        self.lock().deregistered.clone()
    }

    /// The host and tracking URL reported on registration, if any.
    pub fn registered(&self) -> Option<(String, Option<String>)> {
        self.lock().registered.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().expect("mock resource manager poisoned")
    }
}

#[async_trait]
impl ResourceManager for MockResourceManager {
    async fn register_application_master(
        &self,
        host: &str,
        tracking_url: Option<&str>,
    ) -> Result<(), anyhow::Error> {
        self.lock().registered = Some((host.to_string(), tracking_url.map(String::from)));
        Ok(())
    }

    async fn request_containers(
        &self,
        capability: Resource,
        count: u32,
    ) -> Result<(), anyhow::Error> {
        let mut state = self.lock();
        state.requests.push((capability, count));
        for _ in 0..count {
            state.pending.push_back(capability);
        }
        Ok(())
    }

    async fn release_requests(
        &self,
        capability: Resource,
        count: u32,
    ) -> Result<(), anyhow::Error> {
        let mut state = self.lock();
        state.releases.push((capability, count));
        let mut remaining = count;
        state.pending.retain(|ask| {
            if remaining > 0 && *ask == capability {
                remaining -= 1;
                false
            } else {
                true
            }
        });
        Ok(())
    }

    async fn allocate(&self, _progress: f32) -> Result<Allocation, anyhow::Error> {
        let mut state = self.lock();
        let mut acquired = Vec::new();
        while !state.pending.is_empty() {
            if state.grant_budget == Some(0) {
                break;
            }
            let capability = state.pending.pop_front().expect("pending is non-empty");
            if let Some(budget) = &mut state.grant_budget {
                *budget -= 1;
            }
            let seq = state.next_container;
            state.next_container += 1;
            acquired.push(RmContainer {
                id: ContainerId::new(format!("container_0_0000_01_{seq:06}")),
                host: format!("host{}.example.com", seq % 4),
                resource: capability,
            });
        }
        let completed = state.completed.drain(..).collect();
        Ok(Allocation { acquired, completed })
    }

    async fn deregister_application_master(
        &self,
        status: FinalStatus,
        message: &str,
    ) -> Result<(), anyhow::Error> {
        self.lock().deregistered = Some((status, message.to_string()));
        Ok(())
    }
}
