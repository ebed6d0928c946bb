// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The staged-artifact storage abstraction.
//!
//! The cluster filesystem that holds staged application bundles is an
//! external collaborator; the application master only ever asks it to
//! remove the application directory at shutdown.

use std::fmt;

use async_trait::async_trait;
use tracing::info;

/// Storage holding staged application artifacts.
#[async_trait]
pub trait ApplicationStorage: fmt::Debug + Send + Sync {
    /// Removes the application's staging directory.
    async fn remove_application_dir(&self, app_dir: &str) -> Result<(), anyhow::Error>;
}

/// [`ApplicationStorage`] over the local filesystem.
#[derive(Debug, Default)]
pub struct LocalStorage;

#[async_trait]
impl ApplicationStorage for LocalStorage {
    async fn remove_application_dir(&self, app_dir: &str) -> Result<(), anyhow::Error> {
        let path = app_dir.strip_prefix("file://").unwrap_or(app_dir);
        info!("removing application directory {path}");
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("app");
        tokio::fs::create_dir(&app_dir).await.unwrap();
        tokio::fs::write(app_dir.join("weave.spec.json"), b"{}")
            .await
            .unwrap();

        let storage = LocalStorage;
        let app_dir = app_dir.to_str().unwrap().to_string();
        storage.remove_application_dir(&app_dir).await.unwrap();
        storage.remove_application_dir(&app_dir).await.unwrap();
    }
}
