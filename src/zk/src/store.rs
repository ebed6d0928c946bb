// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The metadata store trait and its error type.

use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;

/// Errors surfaced by a [`MetadataStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The addressed node does not exist.
    #[error("node does not exist: {0}")]
    NoNode(String),
    /// A node already exists at the addressed path.
    #[error("node already exists: {0}")]
    NodeExists(String),
    /// The addressed node still has children.
    #[error("node has children: {0}")]
    NotEmpty(String),
    /// The path is not a well-formed absolute node path.
    #[error("invalid path: {0}")]
    BadPath(String),
    /// The connection to the store was lost. Retryable.
    #[error("connection to the metadata store was lost")]
    ConnectionLoss,
    /// The session expired; ephemeral nodes and watches installed under it
    /// are gone. Retryable for idempotent operations.
    #[error("metadata store session expired")]
    SessionExpired,
}

impl StoreError {
    /// Whether retrying the failed operation on a fresh connection can
    /// succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::ConnectionLoss | StoreError::SessionExpired)
    }
}

/// How a node is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// The node outlives the creating session.
    Persistent,
    /// Persistent, with a monotonically increasing sequence number appended
    /// to the requested path.
    PersistentSequential,
    /// The node is removed when the creating session ends.
    Ephemeral,
    /// Ephemeral and sequentially named.
    EphemeralSequential,
}

impl CreateMode {
    /// Whether nodes created in this mode vanish with the session.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    /// Whether a sequence number is appended to the requested path.
    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// The outcome of a one-shot watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// The watched state may have changed.
    Changed,
    /// The session was lost; the watch will never fire again and must be
    /// re-armed on a fresh session.
    SessionLost,
}

/// A pending one-shot watch.
pub type WatchFuture = BoxFuture<'static, WatchEvent>;

/// The consensus-style metadata store.
///
/// Paths are absolute (`/a/b/c`); `get_children` returns bare child names.
/// Watches are one-shot: they fire at most once, on the first subsequent
/// change *or* on session loss, and are consumed by firing. Callers that
/// need a durable subscription use [`MetadataClient`](crate::MetadataClient)
/// instead of re-arming by hand.
#[async_trait]
pub trait MetadataStore: fmt::Debug + Send + Sync {
    /// Creates a node, returning the path actually created (which differs
    /// from the requested path for sequential modes).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode)
        -> Result<String, StoreError>;

    /// Replaces a node's data.
    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Reads a node's data.
    async fn get_data(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Deletes a childless node.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Whether a node exists.
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Lists a node's children, as bare names.
    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Lists a node's children and arms a one-shot watch that fires on the
    /// next change to the child set or to the session.
    async fn get_children_and_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, WatchFuture), StoreError>;

    /// Checks existence and arms a one-shot watch that fires on the next
    /// change to the node or to the session.
    async fn exists_and_watch(&self, path: &str) -> Result<(bool, WatchFuture), StoreError>;
}
