// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The tracker HTTP service.
//!
//! A small HTTP endpoint bound to an ephemeral port on the application
//! master's host, serving the live [`ResourceReport`] as JSON. It starts
//! before the resource-manager handshake so the tracking URL can be handed
//! over at registration time.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use weave_api::report::{ContainerResources, ResourceReport};
use weave_ore::task;

use crate::registry::ContainerRegistry;

/// Where the report's data comes from.
#[derive(Debug)]
pub struct ReportSource {
    registry: Arc<ContainerRegistry>,
    app_id: String,
    app_master: ContainerResources,
}

impl ReportSource {
    /// Creates a source backed by the given registry.
    pub fn new(
        registry: Arc<ContainerRegistry>,
        app_id: String,
        app_master: ContainerResources,
    ) -> ReportSource {
        ReportSource {
            registry,
            app_id,
            app_master,
        }
    }

    /// Builds the current report.
    pub async fn report(&self) -> ResourceReport {
        self.registry
            .resource_report(&self.app_id, self.app_master.clone())
            .await
    }
}

/// A running tracker service.
#[derive(Debug)]
pub struct TrackerService {
    url: String,
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl TrackerService {
    /// Binds an ephemeral port and starts serving.
    ///
    /// `host` is the name the URL advertises (the application master's
    /// host), which need not match the bind address.
    pub fn serve(source: ReportSource, host: &str) -> Result<TrackerService, anyhow::Error> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).context("binding tracker port")?;
        listener
            .set_nonblocking(true)
            .context("configuring tracker listener")?;
        let local_addr = listener.local_addr()?;
        let url = format!("http://{host}:{}/", local_addr.port());

        let app = Router::new()
            .route("/", get(serve_report))
            .with_state(Arc::new(source));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server = axum::Server::from_tcp(listener)
            .context("starting tracker server")?
            .serve(app.into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
        let server = task::spawn(
            || "tracker",
            async move {
                if let Err(e) = server.await {
                    error!("tracker server failed: {e}");
                }
            },
        );
        info!("tracker listening on {local_addr}, advertised as {url}");
        Ok(TrackerService {
            url,
            local_addr,
            shutdown_tx,
            server,
        })
    }

    /// The advertised tracking URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the service gracefully.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.server.await;
    }
}

async fn serve_report(State(source): State<Arc<ReportSource>>) -> Json<ResourceReport> {
    Json(source.report().await)
}
