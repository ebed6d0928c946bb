// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! Serialized reconciliation of desired instance counts.
//!
//! All instance-count changes flow through one worker task consuming one
//! channel, so reconciliations never interleave. A reconciliation first
//! waits for the registry to settle at the old count (so it cannot race
//! with in-flight container starts), then either stops the highest-indexed
//! instances or enqueues a fresh container request for the provisioning
//! loop, and finally broadcasts the triggering message to the runnable's
//! remaining instances so they observe the new count.

use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use weave_api::message::Message;
use weave_api::spec::ApplicationSpec;

use crate::expect::ExpectedCounts;
use crate::provisioner::{order_type_of, RunnableContainerRequest};
use crate::registry::ContainerRegistry;

/// A request to change a runnable's desired instance count.
#[derive(Debug)]
pub struct InstanceChangeRequest {
    /// The runnable to reconcile.
    pub runnable: String,
    /// The new desired count.
    pub new_count: u32,
    /// The message that triggered the change, re-broadcast to the
    /// runnable's instances after reconciliation.
    pub message: Message,
    /// Fired exactly once when the request is finished or discarded.
    pub done: oneshot::Sender<()>,
}

/// The worker task that serializes instance-count changes.
#[derive(Debug)]
pub struct InstanceChangeWorker {
    rx: UnboundedReceiver<InstanceChangeRequest>,
    registry: Arc<ContainerRegistry>,
    expected: Arc<ExpectedCounts>,
    requests_tx: UnboundedSender<RunnableContainerRequest>,
    spec: Arc<ApplicationSpec>,
    shutdown: watch::Receiver<bool>,
}

impl InstanceChangeWorker {
    /// Creates a worker.
    pub fn new(
        rx: UnboundedReceiver<InstanceChangeRequest>,
        registry: Arc<ContainerRegistry>,
        expected: Arc<ExpectedCounts>,
        requests_tx: UnboundedSender<RunnableContainerRequest>,
        spec: Arc<ApplicationSpec>,
        shutdown: watch::Receiver<bool>,
    ) -> InstanceChangeWorker {
        InstanceChangeWorker {
            rx,
            registry,
            expected,
            requests_tx,
            spec,
            shutdown,
        }
    }

    /// Consumes requests until shutdown. On shutdown, pending requests are
    /// discarded with their completions fired.
    pub async fn run(mut self) {
        loop {
            let mut shutdown = self.shutdown.clone();
            let request = tokio::select! {
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = wait_shutdown(&mut shutdown) => break,
            };
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                () = self.reconcile(&request) => {}
                _ = wait_shutdown(&mut shutdown) => {
                    debug!("discarding instance change for {} on shutdown", request.runnable);
                }
            }
            let _ = request.done.send(());
        }
        // Drain anything left so every originator's completion fires.
        while let Ok(request) = self.rx.try_recv() {
            let _ = request.done.send(());
        }
    }

    async fn reconcile(&self, request: &InstanceChangeRequest) {
        let runnable = &request.runnable;
        let old_count = self.expected.desired(runnable);
        let new_count = request.new_count;

        // Settle at the old count first, so an in-flight start cannot be
        // half-observed.
        self.registry
            .wait_for_count(runnable, old_count as usize)
            .await;
        self.expected.set_desired(runnable, new_count);
        info!("changing instances of {runnable}: {old_count} -> {new_count}");

        if new_count < old_count {
            for _ in 0..(old_count - new_count) {
                if let Err(e) = self.registry.remove_last(runnable).await {
                    warn!("stopping an instance of {runnable} failed: {e:#}");
                    break;
                }
            }
        } else if new_count > old_count {
            match self.spec.runnables.get(runnable) {
                Some(runtime) => {
                    let request = RunnableContainerRequest::single(
                        runtime.clone(),
                        order_type_of(&self.spec, runnable),
                    );
                    if self.requests_tx.send(request).is_err() {
                        warn!("provisioning loop is gone; dropping scale-up of {runnable}");
                    }
                }
                None => warn!("cannot scale undeclared runnable {runnable}"),
            }
        }

        // Let the remaining instances observe the new count.
        self.registry
            .send_to_runnable(runnable, &request.message)
            .await;
    }
}

/// Resolves once the shutdown flag is raised (or its sender is gone).
pub(crate) async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::sync::mpsc;

    use weave_api::spec::{ResourceSpec, RunnableSpec, RuntimeSpec};
    use weave_ore::now::now_zero_fn;

    use super::*;

    fn one_runnable_spec() -> ApplicationSpec {
        ApplicationSpec {
            name: "app".to_string(),
            runnables: BTreeMap::from([(
                "echo".to_string(),
                RuntimeSpec {
                    runnable: RunnableSpec {
                        name: "echo".to_string(),
                        command: "true".to_string(),
                        args: vec![],
                    },
                    resource: ResourceSpec {
                        virtual_cores: 1,
                        memory_mb: 128,
                        instances: 0,
                    },
                    local_files: vec![],
                },
            )]),
            orders: vec![],
            event_handler: None,
        }
    }

    #[tokio::test]
    async fn test_scale_up_enqueues_request_and_completes() {
        let registry = Arc::new(ContainerRegistry::new());
        let expected = Arc::new(ExpectedCounts::new(
            now_zero_fn(),
            [("echo".to_string(), 0)],
        ));
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = InstanceChangeWorker::new(
            change_rx,
            Arc::clone(&registry),
            Arc::clone(&expected),
            requests_tx,
            Arc::new(one_runnable_spec()),
            shutdown_rx,
        );
        let worker = tokio::spawn(worker.run());

        let (done_tx, done_rx) = oneshot::channel();
        change_tx
            .send(InstanceChangeRequest {
                runnable: "echo".to_string(),
                new_count: 2,
                message: Message::set_instances("echo", 2),
                done: done_tx,
            })
            .unwrap();
        done_rx.await.unwrap();
        assert_eq!(expected.desired("echo"), 2);
        assert!(requests_rx.recv().await.is_some());

        drop(change_tx);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_discards_and_completes() {
        let registry = Arc::new(ContainerRegistry::new());
        let expected = Arc::new(ExpectedCounts::new(
            now_zero_fn(),
            [("echo".to_string(), 1)],
        ));
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (requests_tx, _requests_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = InstanceChangeWorker::new(
            change_rx,
            registry,
            expected,
            requests_tx,
            Arc::new(one_runnable_spec()),
            shutdown_rx,
        );
        let worker = tokio::spawn(worker.run());

        // The reconcile blocks forever: desired is 1 but nothing runs. A
        // shutdown must still fire the completion.
        let (done_tx, done_rx) = oneshot::channel();
        change_tx
            .send(InstanceChangeRequest {
                runnable: "echo".to_string(),
                new_count: 3,
                message: Message::set_instances("echo", 3),
                done: done_tx,
            })
            .unwrap();
        tokio::task::yield_now().await;
        shutdown_tx.send(true).unwrap();
        done_rx.await.unwrap();
        worker.await.unwrap();
    }
}
