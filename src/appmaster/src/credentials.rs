// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! The forwardable-credentials cache.
//!
//! The launcher stages credential tokens as a JSON map of token kind to
//! token. The application master's own token for talking to the resource
//! manager must not reach containers, so it is stripped on every load.
//! A read failure is logged and leaves the cache empty: containers will
//! likely fail auth, which surfaces through their own reporting.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, warn};

/// The token kind that authenticates the application master to the resource
/// manager. Never forwarded.
pub const AM_RM_TOKEN_KIND: &str = "YARN_AM_RM_TOKEN";

/// A cache of forwardable credential tokens.
#[derive(Debug)]
pub struct CredentialsCache {
    path: Option<PathBuf>,
    tokens: Mutex<BTreeMap<String, String>>,
}

impl CredentialsCache {
    /// Loads the cache from the given token file, if any.
    pub fn load(path: Option<PathBuf>) -> CredentialsCache {
        let cache = CredentialsCache {
            path,
            tokens: Mutex::new(BTreeMap::new()),
        };
        cache.reload();
        cache
    }

    /// Re-reads the token file, e.g. after a `secureStoreUpdated` message.
    pub fn reload(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let read = std::fs::read(path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| {
                serde_json::from_slice::<BTreeMap<String, String>>(&bytes)
                    .map_err(anyhow::Error::from)
            });
        match read {
            Ok(mut tokens) => {
                if tokens.remove(AM_RM_TOKEN_KIND).is_some() {
                    debug!("stripped non-forwardable {AM_RM_TOKEN_KIND} from credentials");
                }
                *self.tokens.lock().expect("credentials cache poisoned") = tokens;
            }
            Err(e) => {
                warn!(
                    "failed to read credentials from {}; continuing with empty credentials: {e:#}",
                    path.display()
                );
            }
        }
    }

    /// A snapshot of the forwardable tokens.
    pub fn tokens(&self) -> BTreeMap<String, String> {
        self.tokens.lock().expect("credentials cache poisoned").clone()
    }
}
