// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The control-message bus.
//!
//! External controllers post messages as sequentially named nodes under the
//! application's metadata namespace: application-scope messages under
//! `/messages`, runnable-scope messages under
//! `/runnables/<name>/messages`. The bus watches every message directory,
//! processes nodes in sequence order, and acknowledges each message by
//! deleting its node only after dispatch completes, so delivery is
//! at-least-once and commands must be idempotent.
//!
//! A message that triggers an instance change is acknowledged when the
//! instance-change worker finishes it; later messages to other runnables
//! are not held up behind it.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::BoxStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info, warn};

use weave_api::message::{self, Message, MessageKind, MessageScope};
use weave_ore::task;
use weave_zk::{MetadataClient, StoreError};

use crate::credentials::CredentialsCache;
use crate::instances::InstanceChangeRequest;
use crate::registry::{target_runnable, ContainerRegistry};

/// The node-name prefix of a message; the store appends the sequence
/// number.
pub const MESSAGE_PREFIX: &str = "msg";

/// The application-scope message directory.
pub const APPLICATION_MESSAGES: &str = "/messages";

/// The message directory of a runnable.
pub fn runnable_messages(runnable: &str) -> String {
    format!("/runnables/{runnable}/messages")
}

/// The control-message bus. Runs as its own task.
#[derive(Debug)]
pub struct MessageBus {
    client: MetadataClient,
    registry: Arc<ContainerRegistry>,
    changes_tx: UnboundedSender<InstanceChangeRequest>,
    credentials: Arc<CredentialsCache>,
    runnables: Vec<String>,
}

impl MessageBus {
    /// Creates a bus over the application's metadata namespace.
    pub fn new(
        client: MetadataClient,
        registry: Arc<ContainerRegistry>,
        changes_tx: UnboundedSender<InstanceChangeRequest>,
        credentials: Arc<CredentialsCache>,
        runnables: Vec<String>,
    ) -> MessageBus {
        MessageBus {
            client,
            registry,
            changes_tx,
            credentials,
            runnables,
        }
    }

    /// Watches every message directory and dispatches until the watch
    /// streams end (which they do not, short of task shutdown).
    pub async fn run(self) {
        let mut streams: StreamMap<String, BoxStream<'static, Vec<String>>> = StreamMap::new();
        streams.insert(
            APPLICATION_MESSAGES.to_string(),
            self.client.watch_children(APPLICATION_MESSAGES),
        );
        for runnable in &self.runnables {
            let dir = runnable_messages(runnable);
            streams.insert(dir.clone(), self.client.watch_children(&dir));
        }

        // Messages already dispatched (or being dispatched) whose nodes are
        // still visible. An entry leaves the set once its node is observed
        // gone; sequence numbers never repeat, so no name is reused.
        let mut inflight: BTreeSet<String> = BTreeSet::new();
        while let Some((dir, children)) = streams.next().await {
            let dir_prefix = format!("{dir}/");
            inflight.retain(|path| match path.strip_prefix(&dir_prefix) {
                Some(name) => children.iter().any(|child| child == name),
                None => true,
            });

            let mut pending: Vec<(u64, &String)> = children
                .iter()
                .filter_map(|name| {
                    let seq = name.strip_prefix(MESSAGE_PREFIX)?.parse::<u64>().ok()?;
                    Some((seq, name))
                })
                .collect();
            pending.sort();
            for (_, name) in pending {
                let path = format!("{dir}/{name}");
                if inflight.contains(&path) {
                    continue;
                }
                if self.process(&path).await {
                    inflight.insert(path);
                }
            }
        }
    }

    /// Reads and dispatches one message node. Returns whether the node was
    /// consumed; a transient read failure returns `false` so the message is
    /// retried on the next watch delivery.
    async fn process(&self, path: &str) -> bool {
        let data = match self.client.get_data(path).await {
            Ok(data) => data,
            // Already consumed (e.g. by a previous incarnation's ack).
            Err(StoreError::NoNode(_)) => return true,
            Err(e) => {
                warn!("failed to read message {path}: {e}");
                return false;
            }
        };
        match serde_json::from_slice::<Message>(&data) {
            Ok(msg) => self.dispatch(path, msg).await,
            Err(e) => {
                warn!("dropping unparseable message {path}: {e}");
                self.ack(path).await;
            }
        }
        true
    }

    async fn dispatch(&self, path: &str, msg: Message) {
        debug!("dispatching {path}: {} ({:?})", msg.command.command, msg.scope);

        // Instance change: hand off to the serialized worker and ack when
        // it completes.
        if msg.kind == MessageKind::System
            && msg.scope == MessageScope::Runnable
            && msg.command.command == message::CMD_INSTANCES
        {
            let count = msg
                .command
                .options
                .get(message::OPT_COUNT)
                .and_then(|count| count.parse::<u32>().ok());
            let target = target_runnable(&msg).map(str::to_string);
            match (target, count) {
                (Ok(runnable), Some(new_count)) => {
                    let (done_tx, done_rx) = oneshot::channel();
                    let request = InstanceChangeRequest {
                        runnable,
                        new_count,
                        message: msg,
                        done: done_tx,
                    };
                    if self.changes_tx.send(request).is_err() {
                        warn!("instance-change worker is gone; acking {path} without effect");
                        self.ack(path).await;
                        return;
                    }
                    let client = self.client.clone();
                    let path = path.to_string();
                    task::spawn(
                        || "message-ack",
                        async move {
                            let _ = done_rx.await;
                            ack_with(&client, &path).await;
                        },
                    );
                }
                (Err(e), _) => {
                    warn!("dropping instances message {path}: {e}");
                    self.ack(path).await;
                }
                (_, None) => {
                    warn!("dropping instances message {path}: no valid count option");
                    self.ack(path).await;
                }
            }
            return;
        }

        if msg.command.command == message::CMD_SECURE_STORE_UPDATED {
            info!("credential store updated; reloading and replicating");
            self.credentials.reload();
            self.registry.send_to_all(&msg).await;
            self.ack(path).await;
            return;
        }

        match msg.scope {
            MessageScope::AllRunnable => {
                self.registry.send_to_all(&msg).await;
            }
            MessageScope::Runnable => match target_runnable(&msg) {
                Ok(target) => {
                    self.registry.send_to_runnable(target, &msg).await;
                }
                Err(e) => warn!("dropping message {path}: {e}"),
            },
            MessageScope::Application => {
                info!(
                    "ignoring unrecognized application command {:?} ({path})",
                    msg.command.command
                );
            }
        }
        self.ack(path).await;
    }

    async fn ack(&self, path: &str) {
        ack_with(&self.client, path).await;
    }
}

async fn ack_with(client: &MetadataClient, path: &str) {
    match client.delete(path).await {
        Ok(()) | Err(StoreError::NoNode(_)) => {}
        Err(e) => warn!("failed to acknowledge message {path}: {e}"),
    }
}
