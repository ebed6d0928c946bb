// Copyright Weave authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0
// <http://www.apache.org/licenses/LICENSE-2.0>.

//! Retry utilities with exponential backoff.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::time::{self, Sleep};

/// Configures a retry operation.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    /// The backoff to apply before the first retry.
    pub initial_backoff: Duration,
    /// The factor by which the backoff grows after each retry.
    pub factor: f64,
    /// The maximum backoff between retries.
    pub clamp_backoff: Duration,
    /// The maximum number of attempts, if bounded.
    pub max_tries: Option<usize>,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::MAX,
            max_tries: None,
        }
    }
}

impl Retry {
    /// Sets the backoff applied before the first retry.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Clamps the backoff between retries to the specified maximum.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Bounds the total number of attempts.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    /// Retries the asynchronous, fallible operation `f` according to this
    /// configuration, returning the first success or the error from the final
    /// attempt.
    pub async fn retry_async<F, U, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> U,
        U: Future<Output = Result<T, E>>,
    {
        let mut stream = self.into_retry_stream();
        let mut i = 0;
        let mut backoff = None;
        loop {
            let state = RetryState { i, next_backoff: backoff };
            match f(state).await {
                Ok(t) => return Ok(t),
                Err(e) => {
                    backoff = futures::StreamExt::next(&mut stream).await;
                    if backoff.is_none() {
                        return Err(e);
                    }
                }
            }
            i += 1;
        }
    }

    /// Converts the configuration into an infinite (or `max_tries`-bounded)
    /// stream that sleeps the current backoff before each item.
    ///
    /// Useful for "retry forever" loops that want to do their own error
    /// handling between attempts.
    pub fn into_retry_stream(self) -> RetryStream {
        RetryStream {
            retry: self,
            i: 0,
            next_backoff: self.initial_backoff.min(self.clamp_backoff),
            sleep: None,
        }
    }
}

/// The state of an in-progress retry operation, handed to the retried
/// closure.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    /// The attempt number, starting at zero.
    pub i: usize,
    /// The backoff that preceded this attempt, if any.
    pub next_backoff: Option<Duration>,
}

/// A stream produced by [`Retry::into_retry_stream`].
#[derive(Debug)]
pub struct RetryStream {
    retry: Retry,
    i: usize,
    next_backoff: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Stream for RetryStream {
    type Item = Duration;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Duration>> {
        let this = self.get_mut();
        if let Some(max_tries) = this.retry.max_tries {
            // The stream yields one backoff per *retry*, so it ends after
            // `max_tries - 1` items.
            if this.i + 1 >= max_tries {
                return Poll::Ready(None);
            }
        }
        let sleep = match &mut this.sleep {
            Some(sleep) => sleep,
            None => {
                let backoff = this.next_backoff;
                this.sleep = Some(Box::pin(time::sleep(backoff)));
                this.sleep.as_mut().expect("sleep was just installed")
            }
        };
        match sleep.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => {
                let slept = this.next_backoff;
                this.i += 1;
                this.next_backoff = this
                    .next_backoff
                    .mul_f64(this.retry.factor)
                    .min(this.retry.clamp_backoff);
                this.sleep = None;
                Poll::Ready(Some(slept))
            }
        }
    }
}
