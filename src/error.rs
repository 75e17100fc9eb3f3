//! Error types: the client-facing taxonomy and the policy-level resilience error.
//!
//! [`GatewayError`] is what the admission pipeline and handlers turn into HTTP responses.
//! [`ResilienceError`] is what breakers and retry policies return around an inner error; the
//! remote call executor folds it into a [`GatewayError`].

use crate::envelope::Envelope;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Body-carried taxonomy codes. `0` means success.
pub mod codes {
    pub const OK: i32 = 0;
    pub const INVALID_INPUT: i32 = 40000;
    pub const UNAUTHENTICATED: i32 = 40100;
    pub const CLIENT_BLACKLISTED: i32 = 40300;
    pub const PERMISSION_DENIED: i32 = 40301;
    pub const NOT_FOUND: i32 = 40400;
    pub const ALREADY_EXISTS: i32 = 40900;
    pub const FAILED_PRECONDITION: i32 = 41200;
    pub const RATE_LIMITED: i32 = 42900;
    pub const DOWNSTREAM_ERROR: i32 = 50000;
    pub const INTERNAL_ERROR: i32 = 50001;
    pub const DOWNSTREAM_UNAVAILABLE: i32 = 50300;
    pub const TIMEOUT: i32 = 50400;
}

/// Fixed message for throttled requests.
pub const RETRY_LATER_MESSAGE: &str = "too many requests, please retry later";
const GENERIC_INTERNAL_MESSAGE: &str = "internal server error";
const GENERIC_UNAVAILABLE_MESSAGE: &str = "service temporarily unavailable";

/// Everything the gateway can answer a request with, other than success.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("client is blacklisted")]
    ClientBlacklisted,
    #[error("rate limited ({scope})")]
    RateLimited { scope: String },
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A downstream "no" (not found, already exists, ...) surfaced verbatim.
    #[error("{message}")]
    BusinessRejection { code: i32, message: String },
    #[error("downstream {service} unavailable: circuit breaker open")]
    DownstreamUnavailable { service: String },
    #[error("downstream {service}.{operation} failed: {detail}")]
    DownstreamError { service: String, operation: String, detail: String },
    #[error("deadline of {timeout:?} exceeded")]
    Timeout { timeout: Duration },
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status for this error. Input and business errors ride in the body with a 200.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ClientBlacklisted => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidInput(_) | Self::BusinessRejection { .. } => StatusCode::OK,
            Self::DownstreamUnavailable { .. } | Self::Timeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::DownstreamError { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body taxonomy code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ClientBlacklisted => codes::CLIENT_BLACKLISTED,
            Self::RateLimited { .. } => codes::RATE_LIMITED,
            Self::Unauthenticated(_) => codes::UNAUTHENTICATED,
            Self::InvalidInput(_) => codes::INVALID_INPUT,
            Self::BusinessRejection { code, .. } => *code,
            Self::DownstreamUnavailable { .. } => codes::DOWNSTREAM_UNAVAILABLE,
            Self::DownstreamError { .. } => codes::DOWNSTREAM_ERROR,
            Self::Timeout { .. } => codes::TIMEOUT,
            Self::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Message safe to show the client. Internal detail never leaves the process.
    pub fn public_message(&self) -> String {
        match self {
            Self::ClientBlacklisted => "access denied".to_string(),
            Self::RateLimited { .. } => RETRY_LATER_MESSAGE.to_string(),
            Self::Unauthenticated(_) => "authentication required".to_string(),
            Self::InvalidInput(msg) => msg.clone(),
            Self::BusinessRejection { message, .. } => message.clone(),
            Self::DownstreamUnavailable { .. } | Self::Timeout { .. } => {
                GENERIC_UNAVAILABLE_MESSAGE.to_string()
            }
            Self::DownstreamError { .. } | Self::Internal(_) => {
                GENERIC_INTERNAL_MESSAGE.to_string()
            }
        }
    }

    /// Expected outcomes driven by the client; these are never logged as errors.
    pub fn is_client_driven(&self) -> bool {
        matches!(
            self,
            Self::ClientBlacklisted
                | Self::RateLimited { .. }
                | Self::Unauthenticated(_)
                | Self::InvalidInput(_)
                | Self::BusinessRejection { .. }
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Envelope::<()>::failure(self.code(), self.public_message());
        let mut response = (status, body).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

/// Error returned by breakers and retry policies around an inner error.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The operation exceeded its deadline.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The named breaker is rejecting calls.
    CircuitOpen { service: String, open_for: Duration },
    /// All retry attempts were exhausted.
    RetryExhausted { attempts: usize, failures: Arc<Vec<E>> },
    /// The underlying operation failed; passed through untouched.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { service, open_for } => {
                write!(f, "circuit breaker for '{}' open (open for {:?})", service, open_for)
            }
            Self::RetryExhausted { attempts, failures } => match failures.last() {
                Some(last) => {
                    write!(f, "retry exhausted after {} attempts; last error: {}", attempts, last)
                }
                None => write!(f, "retry exhausted after {} attempts", attempts),
            },
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Construct a `RetryExhausted` variant keeping only the most recent `MAX_RETRY_FAILURES`.
    pub fn retry_exhausted(attempts: usize, failures: Vec<E>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            failures.into_iter().rev().take(MAX_RETRY_FAILURES).rev().collect()
        } else {
            failures
        };
        ResilienceError::RetryExhausted { attempts, failures: Arc::new(trimmed) }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Last recorded failure of a retry run, or the inner error itself.
    pub fn last_failure(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => failures.last(),
            _ => None,
        }
    }
}
