//! Convenient re-exports for wiring a gateway.
pub use crate::{
    auth::{Authenticator, StaticTokenAuthenticator},
    backoff::Backoff,
    circuit_breaker::{CircuitBreakerConfig, CircuitState},
    circuit_breaker_registry::BreakerRegistry,
    config::GatewayConfig,
    context::{AdmissionContext, Subject},
    envelope::Envelope,
    error::{GatewayError, ResilienceError},
    extract::{ValidJson, ValidPath},
    jitter::Jitter,
    pipeline::{AdmissionPipeline, RouteLayer},
    rate_limit::{BucketRule, BucketStore, InMemoryBucketStore, ScopeKey, TokenBucketLimiter},
    remote::{CallOptions, RemoteCallExecutor, RemoteError, RemoteStatus},
    retry::RetryPolicy,
    telemetry::{GatewayEvent, LogSink, MemorySink, Telemetry},
};
