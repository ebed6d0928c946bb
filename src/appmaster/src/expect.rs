// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! Desired instance counts.

use std::collections::BTreeMap;
use std::sync::Mutex;

use weave_ore::now::{EpochMillis, NowFn};

/// A runnable's desired instance count, plus when containers for it were
/// last requested. The timestamp resets the provisioning-timeout window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpectedCount {
    /// The desired instance count.
    pub desired: u32,
    /// When containers for this runnable were last requested.
    pub requested_at: EpochMillis,
}

/// The desired instance count for every runnable.
#[derive(Debug)]
pub struct ExpectedCounts {
    now: NowFn,
    counts: Mutex<BTreeMap<String, ExpectedCount>>,
}

impl ExpectedCounts {
    /// Initializes counts from the declared instance counts.
    pub fn new<I>(now: NowFn, initial: I) -> ExpectedCounts
    where
        I: IntoIterator<Item = (String, u32)>,
    {
        let at = now.now();
        let counts = initial
            .into_iter()
            .map(|(runnable, desired)| {
                (
                    runnable,
                    ExpectedCount {
                        desired,
                        requested_at: at,
                    },
                )
            })
            .collect();
        ExpectedCounts {
            now,
            counts: Mutex::new(counts),
        }
    }

    /// The desired count for `runnable`; zero if undeclared.
    pub fn desired(&self, runnable: &str) -> u32 {
        self.lock().get(runnable).map_or(0, |count| count.desired)
    }

    /// Sets the desired count for `runnable` and resets its timeout window.
    pub fn set_desired(&self, runnable: &str, desired: u32) {
        let at = self.now.now();
        self.lock().insert(
            runnable.to_string(),
            ExpectedCount {
                desired,
                requested_at: at,
            },
        );
    }

    /// Resets the timeout window for `runnable`, e.g. because fresh
    /// containers were just requested.
    pub fn bump_requested(&self, runnable: &str) {
        let at = self.now.now();
        if let Some(count) = self.lock().get_mut(runnable) {
            count.requested_at = at;
        }
    }

    /// A snapshot of every runnable's expected count.
    pub fn snapshot(&self) -> BTreeMap<String, ExpectedCount> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ExpectedCount>> {
        self.counts.lock().expect("expected counts poisoned")
    }
}
