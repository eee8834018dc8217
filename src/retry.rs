//! Bounded retry loop
//!
//! Waiters in the destroy pipeline poll the cluster or a node until a
//! condition holds. Every wait is bounded and returns early with
//! [`DestroyError::Cancelled`] once the shutdown token fires.

use crate::error::{DestroyError, ErrorKind, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryLoop {
    name: String,
    attempts: usize,
    wait: Duration,
    cancel: CancellationToken,
}

impl RetryLoop {
    /// Create a loop making at most `attempts` calls with `wait` between them
    pub fn new(name: impl Into<String>, attempts: usize, wait: Duration) -> Self {
        Self {
            name: name.into(),
            attempts: attempts.max(1),
            wait,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort the loop when `token` is cancelled
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out
    ///
    /// Config, precondition and cancellation errors are never retried.
    /// The last error is returned when attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(DestroyError::Cancelled);
            }

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !is_retryable(&err) {
                return Err(err);
            }

            if attempt >= self.attempts {
                warn!(
                    operation = %self.name,
                    attempts = self.attempts,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(err);
            }

            debug!(
                operation = %self.name,
                attempt,
                max_attempts = self.attempts,
                error = %err,
                "Attempt failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.wait) => {}
                _ = self.cancel.cancelled() => return Err(DestroyError::Cancelled),
            }
            attempt += 1;
        }
    }
}

fn is_retryable(err: &DestroyError) -> bool {
    !matches!(
        err.kind(),
        ErrorKind::Config | ErrorKind::Precondition | ErrorKind::Cancelled
    )
}

/// Sleep for `duration` unless `cancel` fires first
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(DestroyError::Cancelled),
    }
}

#[cfg(test)]
#[path = "retry_test.rs"]
mod tests;
