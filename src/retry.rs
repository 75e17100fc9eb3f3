//! Retry policy for idempotent downstream calls.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Only `ResilienceError::Inner(E)` values are eligible for retry; an open breaker or a
//!   timeout returns immediately.
//! - `should_retry` decides whether an `Inner` error is retryable.
//! - With a deadline, a retry whose backoff would end at or past the deadline is not attempted;
//!   the failures so far are returned instead.
//!
//! ```rust
//! use std::time::Duration;
//! use tollgate::{Backoff, InstantSleeper, ResilienceError, RetryPolicy};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let policy = RetryPolicy::<&'static str>::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(50)))
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), ResilienceError<&'static str>> =
//!     policy.execute(|| async { Err(ResilienceError::Inner("unavailable")) }).await;
//! assert!(result.unwrap_err().is_retry_exhausted());
//! # });
//! ```

use crate::error::MAX_RETRY_FAILURES;
use crate::telemetry::{GatewayEvent, RetryEvent, Telemetry};
use crate::{Backoff, Jitter, ResilienceError, Sleeper, TokioSleeper};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Retry policy combining backoff, jitter, predicate, and sleeper.
#[derive(Clone)]
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .field("should_retry", &"<predicate>")
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: Send + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Execute with retries and no deadline.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        self.run(None, operation).await
    }

    /// Execute with retries, never sleeping past `deadline`.
    pub async fn execute_within<T, Fut, Op>(
        &self,
        deadline: Instant,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        self.run(Some(deadline), operation).await
    }

    async fn run<T, Fut, Op>(
        &self,
        deadline: Option<Instant>,
        mut operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        let started = Instant::now();
        let mut failures: VecDeque<E> = VecDeque::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(ResilienceError::Inner(e)) if (self.should_retry)(&e) => e,
                Err(other) => return Err(other),
            };

            failures.push_back(err);
            while failures.len() > MAX_RETRY_FAILURES {
                failures.pop_front();
            }

            if attempt >= self.max_attempts {
                return Err(self.exhausted(attempt, started, failures));
            }

            let delay = self.jitter.apply(self.backoff.delay(attempt));
            if let Some(deadline) = deadline {
                if Instant::now() + delay >= deadline {
                    tracing::debug!(attempt, ?delay, "retry would outlive deadline; giving up");
                    return Err(self.exhausted(attempt, started, failures));
                }
            }

            self.telemetry.emit(GatewayEvent::Retry(RetryEvent::Attempt { attempt: attempt + 1, delay }));
            self.sleeper.sleep(delay).await;
        }
    }

    fn exhausted(
        &self,
        attempts: usize,
        started: Instant,
        failures: VecDeque<E>,
    ) -> ResilienceError<E> {
        self.telemetry.emit(GatewayEvent::Retry(RetryEvent::Exhausted {
            total_attempts: attempts,
            total_duration: started.elapsed(),
        }));
        ResilienceError::retry_exhausted(attempts, failures.into_iter().collect())
    }
}

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
}

impl<E> RetryPolicyBuilder<E>
where
    E: Send + 'static,
{
    /// Three attempts, 50ms exponential backoff capped at 1s, full jitter.
    pub fn new() -> Self {
        let backoff = Backoff::exponential(Duration::from_millis(50));
        Self {
            max_attempts: 3,
            backoff: backoff.with_max(Duration::from_secs(1)).unwrap_or(backoff),
            jitter: Jitter::full(),
            should_retry: Arc::new(|_| true),
            sleeper: Arc::new(TokioSleeper),
            telemetry: Telemetry::disabled(),
        }
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Predicate to decide if an `Inner` error is retryable.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            sleeper: self.sleeper,
            telemetry: self.telemetry,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
