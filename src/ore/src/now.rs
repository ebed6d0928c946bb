// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! A source of wall-clock time that can be swapped out in tests.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A timestamp in milliseconds since the Unix epoch.
pub type EpochMillis = u64;

/// A function that returns the current wall-clock time.
///
/// Components that need the current time take a `NowFn` instead of calling
/// [`SystemTime::now`] directly, so that tests can substitute a controlled
/// clock.
#[derive(Clone)]
pub struct NowFn(Arc<dyn Fn() -> EpochMillis + Send + Sync>);

impl NowFn {
    /// Returns the current time in milliseconds since the Unix epoch.
    pub fn now(&self) -> EpochMillis {
        (self.0)()
    }
}

impl fmt::Debug for NowFn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("<now_fn>")
    }
}

impl<F> From<F> for NowFn
where
    F: Fn() -> EpochMillis + Send + Sync + 'static,
{
    fn from(f: F) -> NowFn {
        NowFn(Arc::new(f))
    }
}

/// Returns the true system time in milliseconds since the Unix epoch.
pub fn system_time() -> EpochMillis {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("failed to get millis since epoch");
    u64::try_from(since_epoch.as_millis()).expect("current time did not fit into u64")
}

/// A [`NowFn`] that reads the true system time.
pub fn system_time_now_fn() -> NowFn {
    NowFn::from(system_time)
}

/// A [`NowFn`] that always returns zero. For tests that do not care about
/// time.
pub fn now_zero_fn() -> NowFn {
    NowFn::from(|| 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_fns() {
        assert_eq!(now_zero_fn().now(), 0);
        assert!(system_time_now_fn().now() > 0);
    }
}
