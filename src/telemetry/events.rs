use crate::circuit_breaker::CircuitState;
use crate::rate_limit::Realm;
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Events emitted by the admission pipeline and the outbound call path.
///
/// Every decision that changes what a client sees (throttle, ban, breaker trip, timeout) and
/// every remote call emits one of these. They can be collected, aggregated, or forwarded.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Token-bucket decisions that did not simply admit.
    RateLimit(RateLimitEvent),
    /// Blacklist hits and store failures during the lookup.
    Blacklist(BlacklistEvent),
    /// Breaker state transitions.
    CircuitBreaker(CircuitBreakerEvent),
    /// One downstream call, after its last attempt.
    RemoteCall(RemoteCallEvent),
    /// Retry policy activity.
    Retry(RetryEvent),
    /// A request deadline fired before the handler answered.
    Timeout(TimeoutEvent),
}

/// Events emitted by token-bucket limiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// The bucket had too few tokens.
    Rejected {
        realm: Realm,
        /// Store key of the bucket, without deployment prefix.
        scope: String,
    },
    /// The store failed or was too slow; the request was admitted anyway.
    FailedOpen { realm: Realm, scope: String, reason: String },
}

/// Events emitted by the blacklist check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlacklistEvent {
    /// The subject is in the blacklist set.
    Hit { subject: String },
    /// The store failed or was too slow; the subject was treated as not blacklisted.
    FailedOpen { subject: String, reason: String },
}

/// A breaker moved between states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerEvent {
    pub service: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// How a downstream call ended, from the breaker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// The service answered "no"; counted as a breaker success.
    BusinessRejection,
    Failure,
    /// Short-circuited by an open breaker; the service was never called.
    ShortCircuited,
    /// The request deadline expired first.
    DeadlineExceeded,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::BusinessRejection => "business_rejection",
            CallOutcome::Failure => "failure",
            CallOutcome::ShortCircuited => "short_circuited",
            CallOutcome::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// Duration and outcome of one downstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCallEvent {
    pub service: String,
    pub operation: String,
    pub duration: Duration,
    pub outcome: CallOutcome,
}

/// Events emitted by retry policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry attempt is about to be made.
    ///
    /// Emitted before sleeping and retrying a failed call.
    Attempt {
        /// The attempt number (1-indexed)
        attempt: usize,
        /// The backoff delay before this retry
        delay: Duration,
    },
    /// All retry attempts have been exhausted.
    Exhausted {
        /// Total number of attempts made
        total_attempts: usize,
        /// Total time spent retrying
        total_duration: Duration,
    },
}

/// A route's deadline expired before its handler produced a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutEvent {
    pub route: String,
    pub timeout: Duration,
}

impl fmt::Display for GatewayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            GatewayEvent::Blacklist(event) => write!(f, "Blacklist::{}", event),
            GatewayEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            GatewayEvent::RemoteCall(event) => write!(f, "RemoteCall::{}", event),
            GatewayEvent::Retry(event) => write!(f, "Retry::{}", event),
            GatewayEvent::Timeout(event) => write!(f, "Timeout::{}", event),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Rejected { scope, .. } => write!(f, "Rejected({})", scope),
            RateLimitEvent::FailedOpen { scope, reason, .. } => {
                write!(f, "FailedOpen({}, {})", scope, reason)
            }
        }
    }
}

impl fmt::Display for BlacklistEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlacklistEvent::Hit { subject } => write!(f, "Hit({})", subject),
            BlacklistEvent::FailedOpen { subject, reason } => {
                write!(f, "FailedOpen({}, {})", subject, reason)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} -> {})", self.service, self.from, self.to)
    }
}

impl fmt::Display for RemoteCallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({}, {:?})",
            self.service,
            self.operation,
            self.outcome.as_str(),
            self.duration
        )
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(timeout={:?})", self.route, self.timeout)
    }
}

#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a GatewayEvent into a JSON value for sinks.
pub fn event_to_json(event: &GatewayEvent) -> serde_json::Value {
    match event {
        GatewayEvent::RateLimit(r) => match r {
            RateLimitEvent::Rejected { realm, scope } => json!({
                "kind": "rate_limited",
                "realm": realm.as_str(),
                "scope": scope,
            }),
            RateLimitEvent::FailedOpen { realm, scope, reason } => json!({
                "kind": "rate_limit_failed_open",
                "realm": realm.as_str(),
                "scope": scope,
                "reason": reason,
            }),
        },
        GatewayEvent::Blacklist(b) => match b {
            BlacklistEvent::Hit { subject } => json!({ "kind": "blacklist_hit", "subject": subject }),
            BlacklistEvent::FailedOpen { subject, reason } => json!({
                "kind": "blacklist_failed_open",
                "subject": subject,
                "reason": reason,
            }),
        },
        GatewayEvent::CircuitBreaker(c) => json!({
            "kind": "circuit_transition",
            "service": c.service,
            "from": c.from.as_str(),
            "to": c.to.as_str(),
        }),
        GatewayEvent::RemoteCall(r) => json!({
            "kind": "remote_call",
            "service": r.service,
            "operation": r.operation,
            "outcome": r.outcome.as_str(),
            "duration_ms": clamp_u64(r.duration.as_millis()),
        }),
        GatewayEvent::Retry(r) => match r {
            RetryEvent::Attempt { attempt, delay } => json!({
                "kind": "retry_attempt",
                "attempt": *attempt,
                "delay_ms": clamp_u64(delay.as_millis()),
            }),
            RetryEvent::Exhausted { total_attempts, total_duration } => json!({
                "kind": "retry_exhausted",
                "attempts": *total_attempts,
                "duration_ms": clamp_u64(total_duration.as_millis()),
            }),
        },
        GatewayEvent::Timeout(t) => json!({
            "kind": "timeout",
            "route": t.route,
            "timeout_ms": clamp_u64(t.timeout.as_millis()),
        }),
    }
}
