//! Retry policy for dispatch operations.

use crate::backoff::{Backoff, Jitter};
use crate::error::DispatchError;
use crate::policy::PolicyError;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Cap on failures kept inside `RetryExhausted` so a long retry run does not
/// accumulate unbounded error state.
pub(crate) const MAX_KEPT_FAILURES: usize = 10;

/// Bounded retry with backoff, jitter, and a retry predicate.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&DispatchError) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::new().build()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Run `operation` until it succeeds, fails a non-retryable way, or the
    /// attempts run out.
    ///
    /// Only `PolicyError::Inner` failures are retried; open circuits and
    /// nested exhaustion pass straight through.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, PolicyError>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut failures = Vec::new();

        for attempt in 1..=self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(PolicyError::Inner(e)) => {
                    if !(self.should_retry)(&e) {
                        return Err(PolicyError::Inner(e));
                    }

                    tracing::debug!(attempt, max = self.max_attempts, error = %e, "retrying");
                    failures.push(e);
                    if failures.len() > MAX_KEPT_FAILURES {
                        let excess = failures.len() - MAX_KEPT_FAILURES;
                        failures.drain(0..excess);
                    }

                    if attempt == self.max_attempts {
                        return Err(PolicyError::RetryExhausted {
                            attempts: self.max_attempts,
                            failures,
                        });
                    }

                    let delay = self.jitter.apply(self.backoff.delay(attempt));
                    self.sleeper.sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        unreachable!("retry loop returns from its final attempt")
    }
}

/// Builder for [`RetryPolicy`]. Defaults: 3 attempts, exponential backoff
/// from 100ms, full jitter, retry everything.
pub struct RetryPolicyBuilder {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&DispatchError) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(100)),
            jitter: Jitter::Full,
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Total attempts including the first. Clamped to at least 1.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Predicate deciding whether a failure is worth another attempt.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&DispatchError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
        }
    }
}
