// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The retrying, namespacing metadata client.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{Future, StreamExt};
use tracing::{debug, warn};
use weave_ore::retry::Retry;

use crate::paths;
use crate::store::{CreateMode, MetadataStore, StoreError, WatchEvent, WatchFuture};

/// How long to keep retrying a plain operation that fails transiently.
const OP_RETRY_CLAMP: Duration = Duration::from_secs(1);
const OP_RETRY_MAX_TRIES: usize = 10;

/// Backoff clamp while a watch stream is re-arming against an unreachable
/// store. Watch streams never give up.
const WATCH_RETRY_CLAMP: Duration = Duration::from_secs(5);

/// A client for a [`MetadataStore`] that namespaces every operation under a
/// path prefix, absorbs transient errors with backoff, and provides watch
/// streams that survive session expiry.
#[derive(Debug, Clone)]
pub struct MetadataClient {
    store: Arc<dyn MetadataStore>,
    prefix: String,
}

impl MetadataClient {
    /// Creates a client namespaced under `namespace` (`""` for the root).
    pub fn new(store: Arc<dyn MetadataStore>, namespace: &str) -> Result<MetadataClient, StoreError> {
        if !namespace.is_empty() {
            paths::validate(namespace)?;
        }
        Ok(MetadataClient {
            store,
            prefix: namespace.trim_end_matches('/').to_string(),
        })
    }

    /// Returns a client namespaced under a path relative to this client's
    /// namespace.
    pub fn namespaced(&self, path: &str) -> Result<MetadataClient, StoreError> {
        let prefix = self.resolve(path);
        MetadataClient::new(Arc::clone(&self.store), &prefix)
    }

    fn resolve(&self, path: &str) -> String {
        paths::join(&self.prefix, path)
    }

    fn strip(&self, resolved: String) -> String {
        if self.prefix.is_empty() {
            resolved
        } else {
            resolved[self.prefix.len()..].to_string()
        }
    }

    fn op_retry() -> Retry {
        Retry::default()
            .clamp_backoff(OP_RETRY_CLAMP)
            .max_tries(OP_RETRY_MAX_TRIES)
    }

    fn watch_retry() -> Retry {
        Retry::default().clamp_backoff(WATCH_RETRY_CLAMP)
    }

    async fn with_retry<T, F, Fut>(&self, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let retry = Self::op_retry().into_retry_stream();
        tokio::pin!(retry);
        loop {
            match f().await {
                Ok(t) => return Ok(t),
                Err(e) if e.is_transient() => {
                    warn!("transient metadata store error, retrying: {e}");
                    if retry.next().await.is_none() {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Creates a node, returning its path relative to this client's
    /// namespace.
    pub async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, StoreError> {
        let resolved = self.resolve(path);
        let created = self
            .with_retry(|| {
                let path = resolved.clone();
                async move { self.store.create(&path, data, mode).await }
            })
            .await?;
        Ok(self.strip(created))
    }

    /// Creates `path` and any missing ancestors as persistent nodes.
    pub async fn ensure_path(&self, path: &str) -> Result<(), StoreError> {
        let resolved = self.resolve(path);
        paths::validate(&resolved)?;
        let mut acc = String::new();
        for component in resolved[1..].split('/') {
            acc.push('/');
            acc.push_str(component);
            let result = self
                .with_retry(|| {
                    let path = acc.clone();
                    async move { self.store.create(&path, &[], CreateMode::Persistent).await }
                })
                .await;
            match result {
                Ok(_) | Err(StoreError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Replaces a node's data.
    pub async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let resolved = self.resolve(path);
        self.with_retry(|| {
            let path = resolved.clone();
            async move { self.store.set_data(&path, data).await }
        })
        .await
    }

    /// Reads a node's data.
    pub async fn get_data(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let resolved = self.resolve(path);
        self.with_retry(|| {
            let path = resolved.clone();
            async move { self.store.get_data(&path).await }
        })
        .await
    }

    /// Deletes a node.
    pub async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let resolved = self.resolve(path);
        self.with_retry(|| {
            let path = resolved.clone();
            async move { self.store.delete(&path).await }
        })
        .await
    }

    /// Whether a node exists.
    pub async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let resolved = self.resolve(path);
        self.with_retry(|| {
            let path = resolved.clone();
            async move { self.store.exists(&path).await }
        })
        .await
    }

    /// Lists a node's children, as bare names.
    pub async fn get_children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let resolved = self.resolve(path);
        self.with_retry(|| {
            let path = resolved.clone();
            async move { self.store.get_children(&path).await }
        })
        .await
    }

    /// Returns a stream of the child set of `path`.
    ///
    /// The stream emits the current children immediately, then again after
    /// every observed change. A path that does not exist yet is reported as
    /// having no children, and the stream picks the node up once it is
    /// created. After session expiry the stream re-reads the state,
    /// re-delivers it, and re-arms; consecutive identical deliveries are
    /// possible and expected.
    pub fn watch_children(&self, path: &str) -> BoxStream<'static, Vec<String>> {
        let client = self.clone();
        let path = self.resolve(path);
        futures::stream::unfold(
            (client, path, None::<WatchFuture>),
            |(client, path, pending)| async move {
                if let Some(watch) = pending {
                    if watch.await == WatchEvent::SessionLost {
                        debug!("metadata session lost; re-arming children watch on {path}");
                    }
                }
                let retry = MetadataClient::watch_retry().into_retry_stream();
                tokio::pin!(retry);
                loop {
                    match client.store.get_children_and_watch(&path).await {
                        Ok((children, watch)) => {
                            return Some((children, (client, path, Some(watch))));
                        }
                        Err(StoreError::NoNode(_)) => {
                            match client.store.exists_and_watch(&path).await {
                                // Created between the two calls; read again.
                                Ok((true, _)) => continue,
                                Ok((false, watch)) => {
                                    return Some((Vec::new(), (client, path, Some(watch))));
                                }
                                Err(e) => {
                                    warn!("children watch on {path} failed, retrying: {e}");
                                    retry.next().await;
                                }
                            }
                        }
                        Err(e) => {
                            warn!("children watch on {path} failed, retrying: {e}");
                            retry.next().await;
                        }
                    }
                }
            },
        )
        .boxed()
    }

    /// Returns a stream of the existence of `path`, with the same delivery
    /// guarantees as [`MetadataClient::watch_children`].
    pub fn watch_exists(&self, path: &str) -> BoxStream<'static, bool> {
        let client = self.clone();
        let path = self.resolve(path);
        futures::stream::unfold(
            (client, path, None::<WatchFuture>),
            |(client, path, pending)| async move {
                if let Some(watch) = pending {
                    if watch.await == WatchEvent::SessionLost {
                        debug!("metadata session lost; re-arming exists watch on {path}");
                    }
                }
                let retry = MetadataClient::watch_retry().into_retry_stream();
                tokio::pin!(retry);
                loop {
                    match client.store.exists_and_watch(&path).await {
                        Ok((exists, watch)) => {
                            return Some((exists, (client, path, Some(watch))));
                        }
                        Err(e) => {
                            warn!("exists watch on {path} failed, retrying: {e}");
                            retry.next().await;
                        }
                    }
                }
            },
        )
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn client(store: &MemoryStore, namespace: &str) -> MetadataClient {
        MetadataClient::new(Arc::new(store.clone()), namespace).unwrap()
    }

    #[tokio::test]
    async fn test_namespacing() {
        let store = MemoryStore::new();
        let client = client(&store, "");
        client.ensure_path("/app/runnables").await.unwrap();
        let app = client.namespaced("/app").unwrap();
        app.create("/live", b"up", CreateMode::Ephemeral).await.unwrap();
        assert!(store.exists("/app/live").await.unwrap());
        assert_eq!(app.get_data("/live").await.unwrap(), b"up");
        assert_eq!(
            app.get_children("").await.unwrap(),
            vec!["live".to_string(), "runnables".to_string()]
        );
    }

    #[tokio::test]
    async fn test_create_strips_namespace() {
        let store = MemoryStore::new();
        let root = client(&store, "");
        root.ensure_path("/app/messages").await.unwrap();
        let app = root.namespaced("/app").unwrap();
        let created = app
            .create("/messages/msg", b"{}", CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(created, "/messages/msg0000000000");
    }

    #[tokio::test]
    async fn test_watch_children_delivers_updates() {
        let store = MemoryStore::new();
        let client = client(&store, "");
        client.ensure_path("/q").await.unwrap();
        let mut watch = client.watch_children("/q");
        assert_eq!(watch.next().await.unwrap(), Vec::<String>::new());
        client.create("/q/a", b"", CreateMode::Persistent).await.unwrap();
        assert_eq!(watch.next().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_watch_children_of_missing_path() {
        let store = MemoryStore::new();
        let client = client(&store, "");
        let mut watch = client.watch_children("/later");
        assert_eq!(watch.next().await.unwrap(), Vec::<String>::new());
        client.ensure_path("/later").await.unwrap();
        client
            .create("/later/x", b"", CreateMode::Persistent)
            .await
            .unwrap();
        // The creation of /later wakes the exists watch; the stream re-reads
        // and eventually reports the child.
        loop {
            let children = watch.next().await.unwrap();
            if children == vec!["x".to_string()] {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_watch_survives_session_expiry() {
        let store = MemoryStore::new();
        let client = client(&store, "");
        client.ensure_path("/q").await.unwrap();
        client.create("/q/a", b"", CreateMode::Persistent).await.unwrap();
        let mut watch = client.watch_children("/q");
        assert_eq!(watch.next().await.unwrap(), vec!["a".to_string()]);

        store.expire_session();
        // The latest state is re-delivered after expiry even though nothing
        // changed, and the watch is live again for subsequent changes.
        assert_eq!(watch.next().await.unwrap(), vec!["a".to_string()]);
        client.create("/q/b", b"", CreateMode::Persistent).await.unwrap();
        assert_eq!(
            watch.next().await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
