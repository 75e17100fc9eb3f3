//! Telemetry and observability for the admission pipeline.
//!
//! Limiters, the blacklist check, breakers, the retry policy, the remote call executor, and the
//! deadline controller emit [`GatewayEvent`]s through a [`Telemetry`] handle. The handle hands
//! them to a background worker that drives any [`TelemetrySink`] (a `tower::Service`).
//!
//! # Event Types
//!
//! - **Rate limiting**: `Rejected`, `FailedOpen`
//! - **Blacklist**: `Hit`, `FailedOpen`
//! - **Circuit breaker**: one event per transition with the previous and new state
//! - **Remote calls**: service, operation, duration, outcome
//! - **Retry**: `Attempt`, `Exhausted`
//! - **Timeout**: route and deadline
//!
//! Logging is separate: components log through `tracing` directly. Use [`LogSink`] to also
//! mirror the event stream into the log.

pub mod events;
mod handle;
pub mod sinks;

pub use events::{
    event_to_json, BlacklistEvent, CallOutcome, CircuitBreakerEvent, GatewayEvent, RateLimitEvent,
    RemoteCallEvent, RetryEvent, TimeoutEvent,
};
pub use handle::Telemetry;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
