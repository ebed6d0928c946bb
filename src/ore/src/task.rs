// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! Tokio task utilities.

use std::future::Future;
use std::ops::{Deref, DerefMut};

use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawns a named task onto the current Tokio runtime.
///
/// The name is attached to a tracing span around the task, so log lines
/// emitted by the task can be attributed to it. The name closure is invoked
/// eagerly, even if naming ends up unused.
pub fn spawn<Fut, Name, NameClosure>(nc: NameClosure, future: Fut) -> JoinHandle<Fut::Output>
where
    Name: AsRef<str>,
    NameClosure: FnOnce() -> Name,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let name = nc();
    let span = tracing::debug_span!("task", name = name.as_ref());
    tokio::spawn(future.instrument(span))
}

/// A wrapper around a [`JoinHandle`] that aborts the underlying task when
/// dropped.
#[derive(Debug)]
pub struct AbortOnDropHandle<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDropHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Deref for AbortOnDropHandle<T> {
    type Target = JoinHandle<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for AbortOnDropHandle<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Extension methods for [`JoinHandle`].
pub trait JoinHandleExt<T> {
    /// Converts the handle into one that aborts the task on drop.
    fn abort_on_drop(self) -> AbortOnDropHandle<T>;
}

impl<T> JoinHandleExt<T> for JoinHandle<T> {
    fn abort_on_drop(self) -> AbortOnDropHandle<T> {
        AbortOnDropHandle(self)
    }
}
