#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Admission and resilience control plane for HTTP API gateways.
//!
//! ## Features
//!
//! - **Distributed token buckets** over a shared store, atomic per key, failing open when the
//!   store is slow or down
//! - **Blacklist checks** ahead of any throttle budget
//! - **Circuit breakers** per downstream service with generation-scoped statistics
//! - **Remote call executor** combining breakers, deadline-bounded retries, and error mapping
//! - **Admission pipeline** as tower layers for axum, with per-route limiters and a deadline
//!   controller that never writes two responses
//! - **Telemetry events** delivered off the request path to pluggable sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tollgate::rate_limit::{BucketRule, InMemoryBucketStore, ScopeKey, TokenBucketLimiter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(InMemoryBucketStore::new());
//! let limiter = TokenBucketLimiter::new(store, BucketRule::new(2.0, 1.0).unwrap());
//! let scope = ScopeKey::ip("198.51.100.4".parse().unwrap());
//!
//! assert!(limiter.allow(&scope).await);
//! assert!(limiter.allow(&scope).await);
//! assert!(!limiter.allow(&scope).await);
//! # }
//! ```

pub mod adaptive;
pub mod auth;
pub mod backoff;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod context;
pub mod deadline;
pub mod envelope;
pub mod error;
pub mod extract;
pub mod jitter;
pub mod pipeline;
pub mod prelude;
pub mod rate_limit;
pub mod remote;
pub mod retry;
pub mod sleeper;
pub mod telemetry;

// Re-exports
pub use adaptive::DynamicConfig;
pub use auth::{AuthError, Authenticator, Credentials, StaticTokenAuthenticator};
pub use backoff::{Backoff, BackoffError};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use circuit_breaker_registry::{BreakerRegistry, BreakerRegistryError};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{ConfigError, GatewayConfig};
pub use context::{AdmissionContext, RequestId, ResponseLatch, Subject};
pub use deadline::{DeadlineLayer, DeadlineService};
pub use envelope::Envelope;
pub use error::{GatewayError, ResilienceError};
pub use extract::{ValidJson, ValidPath};
pub use jitter::Jitter;
pub use pipeline::{AdmissionLayer, AdmissionPipeline, RouteBuilder, RouteLayer};
pub use remote::{CallOptions, RemoteCallExecutor, RemoteError, RemoteStatus};
pub use retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{GatewayEvent, Telemetry};
