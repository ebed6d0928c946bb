// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The Weave application master.
//!
//! The application master is the per-application controller: it negotiates
//! containers from the cluster resource manager, launches runnable instances
//! inside them, supervises their lifecycle, and mediates out-of-band control
//! and observability. The moving parts:
//!
//!   * [`registry::ContainerRegistry`]: the in-memory source of truth for
//!     live containers.
//!   * [`provisioner::Provisioner`]: the 1 Hz loop that converges running
//!     containers toward desired counts.
//!   * [`messages::MessageBus`]: consumes control messages from the
//!     metadata store and dispatches them.
//!   * [`instances::InstanceChangeWorker`]: serializes desired-count
//!     reconciliations.
//!   * [`tracker::TrackerService`]: serves the live resource report over
//!     HTTP.
//!   * [`service::ApplicationMasterService`]: wires everything together
//!     and owns the lifecycle.

pub mod broker;
pub mod credentials;
pub mod events;
pub mod expect;
pub mod instances;
pub mod launcher;
pub mod messages;
pub mod provisioner;
pub mod registry;
pub mod service;
pub mod storage;
pub mod tracker;
