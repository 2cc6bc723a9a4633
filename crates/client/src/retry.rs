//! Backoff and failure accounting shared by every client task.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::ClientError;

/// Exponential backoff doubling from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// Counts consecutive transient failures and decides when to give up.
#[derive(Debug, Clone)]
pub struct Retry {
    backoff: Backoff,
    failures: u32,
    max_failures: u32,
}

impl Retry {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            backoff: Backoff::new(config.initial.to_std(), config.max.to_std()),
            failures: 0,
            max_failures: config.max_failures,
        }
    }

    pub fn success(&mut self) {
        self.failures = 0;
        self.backoff.reset();
    }

    /// Delay before the next attempt, or the error to stop with.
    ///
    /// Non-transient errors stop immediately. A transient streak stops once
    /// it exceeds `max-failures` or the credential at stake has `expired`.
    pub fn failure(&mut self, err: ClientError, expired: bool) -> Result<Duration, ClientError> {
        if !err.is_transient() {
            return Err(err);
        }
        self.failures += 1;
        if self.failures > self.max_failures || expired {
            return Err(ClientError::Exhausted {
                failures: self.failures,
                last: err.to_string(),
            });
        }
        Ok(self.backoff.next_delay())
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Sleep for `wait`; `false` if cancelled first.
pub async fn sleep_unless_cancelled(wait: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}
