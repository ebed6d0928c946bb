// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The request-tracking wrapper around a [`ResourceManager`].

use std::collections::BTreeMap;

use tracing::debug;

use crate::{Allocation, FinalStatus, Resource, ResourceManager};

/// An opaque handle to an outstanding container request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(u64);

#[derive(Debug)]
struct OutstandingRequest {
    capability: Resource,
    count: u32,
}

/// Wraps a [`ResourceManager`] with the bookkeeping the raw protocol lacks.
///
/// Every ask is recorded under a fresh [`RequestId`]. Once the caller has
/// matched all containers for a request it calls
/// [`complete_container_request`](RmClient::complete_container_request),
/// which releases the recorded ask so the protocol client does not keep
/// re-presenting it.
#[derive(Debug)]
pub struct RmClient {
    rm: Box<dyn ResourceManager>,
    outstanding: BTreeMap<RequestId, OutstandingRequest>,
    next_request_id: u64,
}

impl RmClient {
    /// Creates a client over the given protocol implementation.
    pub fn new(rm: Box<dyn ResourceManager>) -> RmClient {
        RmClient {
            rm,
            outstanding: BTreeMap::new(),
            next_request_id: 0,
        }
    }

    /// Registers the application master.
    pub async fn start(
        &mut self,
        host: &str,
        tracking_url: Option<&str>,
    ) -> Result<(), anyhow::Error> {
        self.rm.register_application_master(host, tracking_url).await
    }

    /// Asks for `count` containers of the given capability, returning the
    /// id under which the ask is recorded.
    pub async fn add_container_request(
        &mut self,
        capability: Resource,
        count: u32,
    ) -> Result<RequestId, anyhow::Error> {
        self.rm.request_containers(capability, count).await?;
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        self.outstanding
            .insert(id, OutstandingRequest { capability, count });
        debug!("requested {count} containers ({capability}) as {id:?}");
        Ok(id)
    }

    /// Releases the recorded ask for a fully matched request.
    ///
    /// Safe to call more than once for the same id; only the first call has
    /// an effect.
    pub async fn complete_container_request(
        &mut self,
        id: RequestId,
    ) -> Result<(), anyhow::Error> {
        if let Some(request) = self.outstanding.remove(&id) {
            debug!("completing container request {id:?}");
            self.rm
                .release_requests(request.capability, request.count)
                .await?;
        }
        Ok(())
    }

    /// One poll cycle against the resource manager.
    pub async fn allocate(&mut self, progress: f32) -> Result<Allocation, anyhow::Error> {
        self.rm.allocate(progress).await
    }

    /// The number of requests that have not been completed yet.
    pub fn outstanding_requests(&self) -> usize {
        self.outstanding.len()
    }

    /// Deregisters the application master.
    pub async fn stop(
        &mut self,
        status: FinalStatus,
        message: &str,
    ) -> Result<(), anyhow::Error> {
        self.rm.deregister_application_master(status, message).await
    }
}
