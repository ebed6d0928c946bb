// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! A thin client abstraction over the consensus-style metadata store.
//!
//! The store itself (hierarchical znodes, ephemeral nodes, one-shot watches)
//! is an external collaborator reached through the [`MetadataStore`] trait.
//! What this crate adds is the part the naive store gets wrong: a
//! [`MetadataClient`] whose watch streams survive session expiry. A one-shot
//! watch installed directly on the store dies with the session, which would
//! silently stall anything waiting on it; the client's streams instead
//! re-read the watched state, re-deliver it, and re-arm after every
//! disconnect, so an observer sees every distinct state change (possibly
//! with duplicates, never an indefinite gap).
//!
//! A heap-backed [`MemoryStore`] implementation backs tests and local mode.

mod client;
mod memory;
mod store;

pub mod paths;

pub use client::MetadataClient;
pub use memory::MemoryStore;
pub use store::{CreateMode, MetadataStore, StoreError, WatchEvent, WatchFuture};
