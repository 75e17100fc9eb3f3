//! Outbound calls to downstream services.
//!
//! [`RemoteCallExecutor`] runs one business operation through the named service's breaker, an
//! optional retry policy for idempotent calls, and the request deadline, then folds whatever
//! happened into a [`GatewayError`]. It is transport agnostic: the operation is any future that
//! yields a [`RemoteStatus`]-classified [`RemoteError`] on failure.

use crate::circuit_breaker_registry::BreakerRegistry;
use crate::error::{codes, GatewayError, ResilienceError};
use crate::retry::RetryPolicy;
use crate::telemetry::{CallOutcome, GatewayEvent, RemoteCallEvent, Telemetry};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Status of a downstream reply, gRPC-style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteStatus {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl RemoteStatus {
    /// The service is healthy and said "no". Passed to the client verbatim.
    pub fn is_business_rejection(&self) -> bool {
        self.business_code().is_some()
    }

    /// Counts against the breaker. Business rejections and caller cancellation do not.
    pub fn is_breaker_failure(&self) -> bool {
        !self.is_business_rejection() && *self != RemoteStatus::Cancelled
    }

    /// Worth another attempt for idempotent calls.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteStatus::Unavailable | RemoteStatus::Aborted | RemoteStatus::ResourceExhausted
        )
    }

    /// Envelope code for business rejections.
    pub fn business_code(&self) -> Option<i32> {
        match self {
            RemoteStatus::InvalidArgument | RemoteStatus::OutOfRange => Some(codes::INVALID_INPUT),
            RemoteStatus::NotFound => Some(codes::NOT_FOUND),
            RemoteStatus::AlreadyExists => Some(codes::ALREADY_EXISTS),
            RemoteStatus::PermissionDenied => Some(codes::PERMISSION_DENIED),
            RemoteStatus::FailedPrecondition => Some(codes::FAILED_PRECONDITION),
            RemoteStatus::Unauthenticated => Some(codes::UNAUTHENTICATED),
            _ => None,
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A failed downstream attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{status}: {message}")]
pub struct RemoteError {
    pub status: RemoteStatus,
    pub message: String,
}

impl RemoteError {
    pub fn new(status: RemoteStatus, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteStatus::Unavailable, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteStatus::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(RemoteStatus::AlreadyExists, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RemoteStatus::Internal, message)
    }
}

fn healthy<T>(result: &Result<T, RemoteError>) -> bool {
    match result {
        Ok(_) => true,
        Err(err) => !err.status.is_breaker_failure(),
    }
}

/// Per-call knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    idempotent: bool,
    deadline: Option<Instant>,
}

impl CallOptions {
    /// Single attempt, no deadline of its own.
    pub fn once() -> Self {
        Self::default()
    }

    /// Eligible for retries on retryable statuses.
    pub fn idempotent() -> Self {
        Self { idempotent: true, deadline: None }
    }

    /// Abort the call, and stop retrying, at `deadline`.
    pub fn within(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Invokes downstream operations through their breakers.
#[derive(Clone, Debug)]
pub struct RemoteCallExecutor {
    breakers: BreakerRegistry,
    retry: Option<RetryPolicy<RemoteError>>,
    telemetry: Telemetry,
}

impl RemoteCallExecutor {
    pub fn new(breakers: BreakerRegistry) -> Self {
        Self { breakers, retry: None, telemetry: Telemetry::disabled() }
    }

    /// Retry policy for idempotent calls. Only retryable statuses are retried, whatever the
    /// policy's own predicate says.
    pub fn with_retry(mut self, retry: RetryPolicy<RemoteError>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Run `op` against `service`. Business rejections come back as
    /// [`GatewayError::BusinessRejection`]; everything else that goes wrong is logged here.
    pub async fn call<T, Fut, Op>(
        &self,
        service: &str,
        operation: &str,
        options: CallOptions,
        mut op: Op,
    ) -> Result<T, GatewayError>
    where
        Fut: Future<Output = Result<T, RemoteError>>,
        Op: FnMut() -> Fut,
    {
        let breaker = self.breakers.breaker(service);
        let started = Instant::now();

        let op = &mut op;
        let breaker = &breaker;
        let deadline = options.deadline;
        // deadline expiry inside the breaker is a breaker failure, unlike a caller drop
        let mut attempt = move || {
            let fut = op();
            let call = breaker.execute_classified(move || bounded(deadline, fut), healthy);
            async move {
                match (call.await, deadline) {
                    (Err(ResilienceError::Inner(err)), Some(deadline))
                        if err.status == RemoteStatus::DeadlineExceeded
                            && Instant::now() >= deadline =>
                    {
                        Err(ResilienceError::Timeout {
                            elapsed: started.elapsed(),
                            timeout: deadline.saturating_duration_since(started),
                        })
                    }
                    (result, _) => result,
                }
            }
        };

        let work = async {
            match (&self.retry, options.idempotent) {
                (Some(retry), true) => {
                    // non-retryable statuses come back as already exhausted so the loop stops
                    let gated = move || {
                        let fut = attempt();
                        async move {
                            match fut.await {
                                Err(ResilienceError::Inner(err)) if !err.status.is_retryable() => {
                                    Err(ResilienceError::retry_exhausted(1, vec![err]))
                                }
                                other => other,
                            }
                        }
                    };
                    match options.deadline {
                        Some(deadline) => retry.execute_within(deadline, gated).await,
                        None => retry.execute(gated).await,
                    }
                }
                _ => attempt().await,
            }
        };

        let result = match options.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, work).await {
                Ok(result) => result,
                Err(_) => Err(ResilienceError::Timeout {
                    elapsed: started.elapsed(),
                    timeout: deadline.saturating_duration_since(started),
                }),
            },
            None => work.await,
        };

        let elapsed = started.elapsed();
        let (outcome, mapped) = match result {
            Ok(value) => (CallOutcome::Success, Ok(value)),
            Err(err) => {
                let (outcome, mapped) = classify(service, operation, err, elapsed);
                (outcome, Err(mapped))
            }
        };
        self.telemetry.emit(GatewayEvent::RemoteCall(RemoteCallEvent {
            service: service.to_string(),
            operation: operation.to_string(),
            duration: elapsed,
            outcome,
        }));
        mapped
    }
}

async fn bounded<T, Fut>(deadline: Option<Instant>, fut: Fut) -> Result<T, RemoteError>
where
    Fut: Future<Output = Result<T, RemoteError>>,
{
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::new(RemoteStatus::DeadlineExceeded, "request deadline reached")),
        },
        None => fut.await,
    }
}

fn classify(
    service: &str,
    operation: &str,
    err: ResilienceError<RemoteError>,
    elapsed: Duration,
) -> (CallOutcome, GatewayError) {
    let duration_ms = elapsed.as_millis() as u64;
    match err {
        ResilienceError::CircuitOpen { open_for, .. } => {
            tracing::warn!(service, operation, open_for_ms = open_for.as_millis() as u64, "downstream short-circuited");
            (CallOutcome::ShortCircuited, GatewayError::DownstreamUnavailable { service: service.to_string() })
        }
        ResilienceError::Timeout { timeout, .. } => {
            tracing::warn!(service, operation, duration_ms, "downstream call hit request deadline");
            (CallOutcome::DeadlineExceeded, GatewayError::Timeout { timeout })
        }
        ResilienceError::Inner(remote) => remote_failure(service, operation, remote, duration_ms),
        ResilienceError::RetryExhausted { attempts, failures } => match failures.last().cloned() {
            Some(remote) => {
                if attempts > 1 {
                    tracing::debug!(service, operation, attempts, "retries exhausted");
                }
                remote_failure(service, operation, remote, duration_ms)
            }
            None => {
                tracing::error!(service, operation, attempts, duration_ms, "retries exhausted without a recorded failure");
                (
                    CallOutcome::Failure,
                    GatewayError::DownstreamError {
                        service: service.to_string(),
                        operation: operation.to_string(),
                        detail: format!("{attempts} attempts failed"),
                    },
                )
            }
        },
    }
}

fn remote_failure(
    service: &str,
    operation: &str,
    remote: RemoteError,
    duration_ms: u64,
) -> (CallOutcome, GatewayError) {
    if let Some(code) = remote.status.business_code() {
        return (
            CallOutcome::BusinessRejection,
            GatewayError::BusinessRejection { code, message: remote.message },
        );
    }
    if remote.status == RemoteStatus::DeadlineExceeded {
        tracing::warn!(service, operation, duration_ms, "downstream reported deadline exceeded");
        return (
            CallOutcome::DeadlineExceeded,
            GatewayError::Timeout { timeout: Duration::from_millis(duration_ms) },
        );
    }
    tracing::error!(service, operation, duration_ms, status = %remote.status, error = %remote.message, "downstream call failed");
    (
        CallOutcome::Failure,
        GatewayError::DownstreamError {
            service: service.to_string(),
            operation: operation.to_string(),
            detail: remote.to_string(),
        },
    )
}
