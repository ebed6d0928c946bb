// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! A heap-backed metadata store.
//!
//! Backs tests and local mode. The store behaves as a single session: all
//! ephemeral nodes belong to it, and [`MemoryStore::expire_session`] drops
//! them and fires every outstanding watch with
//! [`WatchEvent::SessionLost`], which is exactly the failure the
//! [`MetadataClient`](crate::MetadataClient) watch streams exist to absorb.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::paths;
use crate::store::{CreateMode, MetadataStore, StoreError, WatchEvent, WatchFuture};

/// An in-memory [`MetadataStore`].
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    /// One-shot watches keyed by node path. A watch fires on any change at
    /// its path (data, existence, or child set), which is coarser than a
    /// real store; watch consumers tolerate duplicate wakeups.
    watches: BTreeMap<String, Vec<oneshot::Sender<WatchEvent>>>,
}

#[derive(Debug, Default)]
struct Node {
    data: Vec<u8>,
    ephemeral: bool,
    next_seq: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    /// Creates an empty store containing only the root node.
    pub fn new() -> MemoryStore {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::default());
        MemoryStore {
            inner: Arc::new(Mutex::new(Inner {
                nodes,
                watches: BTreeMap::new(),
            })),
        }
    }

    /// Simulates session expiry: removes every ephemeral node and fires
    /// every outstanding watch with [`WatchEvent::SessionLost`].
    pub fn expire_session(&self) {
        let mut inner = self.lock();
        let ephemerals: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral)
            .map(|(path, _)| path.clone())
            .collect();
        // Children sort after their parents, so removing in reverse order
        // removes leaves first.
        for path in ephemerals.iter().rev() {
            inner.nodes.remove(path);
        }
        let watches = std::mem::take(&mut inner.watches);
        for (_, senders) in watches {
            for sender in senders {
                let _ = sender.send(WatchEvent::SessionLost);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store poisoned")
    }
}

impl Inner {
    fn fire(&mut self, path: &str) {
        if let Some(senders) = self.watches.remove(path) {
            for sender in senders {
                let _ = sender.send(WatchEvent::Changed);
            }
        }
    }

    fn fire_node_and_parent(&mut self, path: &str) {
        self.fire(path);
        if let Some(parent) = paths::parent(path) {
            let parent = parent.to_string();
            self.fire(&parent);
        }
    }

    fn arm_watch(&mut self, path: &str) -> WatchFuture {
        let (tx, rx) = oneshot::channel();
        self.watches.entry(path.to_string()).or_default().push(tx);
        Box::pin(async move { rx.await.unwrap_or(WatchEvent::SessionLost) })
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| &k[prefix.len()..])
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .map(|name| name.to_string())
            .collect()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, StoreError> {
        paths::validate(path)?;
        let mut inner = self.lock();
        let parent = paths::parent(path)
            .ok_or_else(|| StoreError::BadPath(path.to_string()))?
            .to_string();
        let actual = if mode.is_sequential() {
            let parent_node = inner
                .nodes
                .get_mut(&parent)
                .ok_or_else(|| StoreError::NoNode(parent.clone()))?;
            let seq = parent_node.next_seq;
            parent_node.next_seq += 1;
            format!("{path}{seq:010}")
        } else {
            if !inner.nodes.contains_key(&parent) {
                return Err(StoreError::NoNode(parent));
            }
            path.to_string()
        };
        if inner.nodes.contains_key(&actual) {
            return Err(StoreError::NodeExists(actual));
        }
        inner.nodes.insert(
            actual.clone(),
            Node {
                data: data.to_vec(),
                ephemeral: mode.is_ephemeral(),
                next_seq: 0,
            },
        );
        inner.fire_node_and_parent(&actual);
        Ok(actual)
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.nodes.get_mut(path) {
            None => Err(StoreError::NoNode(path.to_string())),
            Some(node) => {
                node.data = data.to_vec();
                inner.fire(path);
                Ok(())
            }
        }
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let inner = self.lock();
        inner
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| StoreError::NoNode(path.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        if !inner.children_of(path).is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        inner.nodes.remove(path);
        inner.fire_node_and_parent(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.lock().nodes.contains_key(path))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        if !inner.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        Ok(inner.children_of(path))
    }

    async fn get_children_and_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, WatchFuture), StoreError> {
        let mut inner = self.lock();
        if !inner.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        let children = inner.children_of(path);
        let watch = inner.arm_watch(path);
        Ok((children, watch))
    }

    async fn exists_and_watch(&self, path: &str) -> Result<(bool, WatchFuture), StoreError> {
        let mut inner = self.lock();
        let exists = inner.nodes.contains_key(path);
        let watch = inner.arm_watch(path);
        Ok((exists, watch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_parent() {
        let store = MemoryStore::new();
        let err = store
            .create("/a/b", b"", CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoNode(p) if p == "/a"));
        store.create("/a", b"", CreateMode::Persistent).await.unwrap();
        store.create("/a/b", b"", CreateMode::Persistent).await.unwrap();
        assert_eq!(store.get_children("/a").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_sequential_names() {
        let store = MemoryStore::new();
        store.create("/q", b"", CreateMode::Persistent).await.unwrap();
        let first = store
            .create("/q/msg", b"", CreateMode::PersistentSequential)
            .await
            .unwrap();
        let second = store
            .create("/q/msg", b"", CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(first, "/q/msg0000000000");
        assert_eq!(second, "/q/msg0000000001");
    }

    #[tokio::test]
    async fn test_expire_session_removes_ephemerals() {
        let store = MemoryStore::new();
        store.create("/app", b"", CreateMode::Persistent).await.unwrap();
        store
            .create("/app/live", b"up", CreateMode::Ephemeral)
            .await
            .unwrap();
        store.expire_session();
        assert!(!store.exists("/app/live").await.unwrap());
        assert!(store.exists("/app").await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_fires_on_child_change() {
        let store = MemoryStore::new();
        store.create("/q", b"", CreateMode::Persistent).await.unwrap();
        let (children, watch) = store.get_children_and_watch("/q").await.unwrap();
        assert!(children.is_empty());
        store.create("/q/a", b"", CreateMode::Persistent).await.unwrap();
        assert_eq!(watch.await, WatchEvent::Changed);
    }

    #[tokio::test]
    async fn test_watch_fires_on_session_loss() {
        let store = MemoryStore::new();
        let (_, watch) = store.exists_and_watch("/nope").await.unwrap();
        store.expire_session();
        assert_eq!(watch.await, WatchEvent::SessionLost);
    }

    #[tokio::test]
    async fn test_delete_refuses_children() {
        let store = MemoryStore::new();
        store.create("/a", b"", CreateMode::Persistent).await.unwrap();
        store.create("/a/b", b"", CreateMode::Persistent).await.unwrap();
        let err = store.delete("/a").await.unwrap_err();
        assert!(matches!(err, StoreError::NotEmpty(_)));
        store.delete("/a/b").await.unwrap();
        store.delete("/a").await.unwrap();
    }
}
