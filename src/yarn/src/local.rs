// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! A resource manager that grants containers on the local host.
//!
//! This is the single-host development backend: every ask is granted
//! immediately as a synthetic container on `localhost`, and the process
//! launcher reports exits back through a [`LocalRmHandle`] so they surface
//! as completions on the next allocate cycle, the same way a real cluster
//! delivers them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::info;

use crate::{
    Allocation, ApplicationId, ContainerId, ContainerStatus, FinalStatus, Resource,
    ResourceManager, RmContainer,
};

/// A [`ResourceManager`] for a single host.
#[derive(Debug, Clone)]
pub struct LocalResourceManager {
    inner: Arc<Mutex<LocalState>>,
}

/// Reports container exits back into a [`LocalResourceManager`].
#[derive(Debug, Clone)]
pub struct LocalRmHandle {
    inner: Arc<Mutex<LocalState>>,
}

#[derive(Debug)]
struct LocalState {
    app_id: ApplicationId,
    registered: bool,
    /// One entry per unmatched ask.
    pending: VecDeque<Resource>,
    /// Completions awaiting the next allocate cycle.
    completed: VecDeque<ContainerStatus>,
    next_container: u64,
}

impl LocalResourceManager {
    /// Creates a local resource manager for the given application.
    pub fn new(app_id: ApplicationId) -> LocalResourceManager {
        LocalResourceManager {
            inner: Arc::new(Mutex::new(LocalState {
                app_id,
                registered: false,
                pending: VecDeque::new(),
                completed: VecDeque::new(),
                next_container: 1,
            })),
        }
    }

    /// Returns a handle through which container exits are reported.
    pub fn handle(&self) -> LocalRmHandle {
        LocalRmHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.inner.lock().expect("local resource manager poisoned")
    }
}

impl LocalRmHandle {
    /// Reports a container exit; it is delivered as a completion on the
    /// next allocate cycle.
    pub fn report_completion(&self, status: ContainerStatus) {
        self.inner
            .lock()
            .expect("local resource manager poisoned")
            .completed
            .push_back(status);
    }
}

#[async_trait]
impl ResourceManager for LocalResourceManager {
    async fn register_application_master(
        &self,
        host: &str,
        tracking_url: Option<&str>,
    ) -> Result<(), anyhow::Error> {
        let mut state = self.lock();
        state.registered = true;
        info!(
            "registered application master on {host} (tracker: {})",
            tracking_url.unwrap_or("none")
        );
        Ok(())
    }

    async fn request_containers(
        &self,
        capability: Resource,
        count: u32,
    ) -> Result<(), anyhow::Error> {
        let mut state = self.lock();
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
        while let Some(capability) = state.pending.pop_front() {
            let seq = state.next_container;
            state.next_container += 1;
            let id = ContainerId::new(format!(
                "container_{}_{:04}_01_{:06}",
                state.app_id.cluster_time, state.app_id.id, seq
            ));
            acquired.push(RmContainer {
                id,
                host: "localhost".to_string(),
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
        let mut state = self.lock();
        state.registered = false;
        info!("deregistered application master: {status:?} ({message})");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grant_and_complete() {
        let app_id = ApplicationId {
            cluster_time: 17,
            id: 1,
        };
        let rm = LocalResourceManager::new(app_id);
        let capability = Resource {
            virtual_cores: 1,
            memory_mb: 128,
        };
        rm.request_containers(capability, 2).await.unwrap();
        let allocation = rm.allocate(0.0).await.unwrap();
        assert_eq!(allocation.acquired.len(), 2);
        assert_eq!(allocation.acquired[0].id.as_str(), "container_17_0001_01_000001");
        assert_eq!(allocation.acquired[0].host, "localhost");

        rm.handle().report_completion(ContainerStatus {
            container_id: allocation.acquired[0].id.clone(),
            exit_status: 0,
        });
        let allocation = rm.allocate(0.5).await.unwrap();
        assert!(allocation.acquired.is_empty());
        assert_eq!(allocation.completed.len(), 1);
    }

    #[tokio::test]
    async fn test_release_forgets_pending_asks() {
        let rm = LocalResourceManager::new(ApplicationId {
            cluster_time: 17,
            id: 1,
        });
        let capability = Resource {
            virtual_cores: 1,
            memory_mb: 128,
        };
        rm.request_containers(capability, 3).await.unwrap();
        rm.release_requests(capability, 3).await.unwrap();
        assert!(rm.allocate(0.0).await.unwrap().is_empty());
    }
}
