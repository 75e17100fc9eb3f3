//! Ready-made wiring for tollgate.
//!
//! - [`retry_for`] and [`executor_from_config`] turn a [`GatewayConfig`] into the outbound side.
//! - [`FakeDownstream`] stands in for the user and friend services.
//! - [`demo_router`] assembles a complete gateway: shared admission stages, a sensitive route
//!   with its own bucket, deadline-bounded handlers, and an unprotected health check.
//!
//! `cargo run -p tollgate-cookbook --example gateway` serves it on `127.0.0.1:3000`.

use axum::extract::State;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tollgate::circuit_breaker::CircuitState;
use tollgate::{
    AdmissionContext, AdmissionPipeline, BreakerRegistry, BuildError, CallOptions, ConfigError,
    Envelope, GatewayConfig, GatewayError, Jitter, RemoteCallExecutor, RemoteError, RemoteStatus,
    RetryPolicy, Telemetry, ValidPath,
};
use uuid::Uuid;

pub const USER_SERVICE: &str = "user";
pub const FRIEND_SERVICE: &str = "friend";

/// Retry policy for idempotent downstream reads, from the `retry*` keys.
pub fn retry_for(
    config: &GatewayConfig,
    telemetry: Telemetry,
) -> Result<RetryPolicy<RemoteError>, BuildError> {
    RetryPolicy::builder()
        .max_attempts(config.retry_max_attempts)
        .backoff(config.retry_backoff())
        .with_jitter(Jitter::full())
        .should_retry(|err: &RemoteError| err.status.is_retryable())
        .with_telemetry(telemetry)
        .build()
}

/// Breakers for the known services plus the retry policy.
pub fn executor_from_config(
    config: &GatewayConfig,
    telemetry: Telemetry,
) -> Result<RemoteCallExecutor, ConfigError> {
    let breakers = BreakerRegistry::new(config.breaker_config()?)
        .with_telemetry(telemetry.clone())
        .with_services([USER_SERVICE, FRIEND_SERVICE]);
    let retry = retry_for(config, telemetry.clone()).map_err(|e| ConfigError::Invalid {
        field: "retryMaxAttempts",
        reason: e.to_string(),
    })?;
    Ok(RemoteCallExecutor::new(breakers).with_retry(retry).with_telemetry(telemetry))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub user_id: Uuid,
    pub display_name: String,
}

/// In-process stand-in for the user and friend services.
#[derive(Debug, Clone, Default)]
pub struct FakeDownstream {
    profiles: Arc<Mutex<HashMap<Uuid, Profile>>>,
    friendships: Arc<Mutex<HashSet<(Uuid, Uuid)>>>,
    outage: Arc<AtomicBool>,
    latency: Arc<Mutex<Duration>>,
}

impl FakeDownstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(self, user_id: Uuid, display_name: impl Into<String>) -> Self {
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id, Profile { user_id, display_name: display_name.into() });
        self
    }

    /// While set, every call fails with `Unavailable`.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    async fn simulate(&self) -> Result<(), RemoteError> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.outage.load(Ordering::SeqCst) {
            return Err(RemoteError::unavailable("connection refused"));
        }
        Ok(())
    }

    pub async fn get_profile(&self, user_id: Uuid) -> Result<Profile, RemoteError> {
        self.simulate().await?;
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
            .ok_or_else(|| RemoteError::not_found("profile not found"))
    }

    pub async fn add_friend(&self, user_id: Uuid, friend_id: Uuid) -> Result<(), RemoteError> {
        self.simulate().await?;
        if user_id == friend_id {
            return Err(RemoteError::new(
                RemoteStatus::FailedPrecondition,
                "cannot befriend yourself",
            ));
        }
        let inserted = self
            .friendships
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((user_id, friend_id));
        if inserted {
            Ok(())
        } else {
            Err(RemoteError::already_exists("already friends"))
        }
    }
}

#[derive(Debug, Clone)]
struct AppState {
    executor: RemoteCallExecutor,
    downstream: FakeDownstream,
}

/// Full demo gateway. `/healthz` sits outside the admission stages.
pub fn demo_router(
    pipeline: &AdmissionPipeline,
    executor: RemoteCallExecutor,
    downstream: FakeDownstream,
) -> Router {
    let state = AppState { executor, downstream };

    let api = Router::new()
        .route(
            "/v1/profile",
            get(get_profile).layer(pipeline.route("/v1/profile").build()),
        )
        .route(
            "/v1/friends/{friend_id}",
            post(add_friend).layer(pipeline.route("/v1/friends").sensitive().build()),
        )
        .route("/v1/admin/breakers", get(breakers).layer(pipeline.route("/v1/admin/breakers").build()))
        .layer(pipeline.layer())
        .with_state(state);

    Router::new().route("/healthz", get(|| async { "ok" })).merge(api)
}

async fn get_profile(
    State(state): State<AppState>,
    ctx: AdmissionContext,
) -> Result<Envelope<Profile>, GatewayError> {
    let user_id = ctx.require_subject()?.user_id;
    let mut options = CallOptions::idempotent();
    if let Some(deadline) = ctx.deadline() {
        options = options.within(deadline);
    }
    let downstream = state.downstream.clone();
    let profile = state
        .executor
        .call(USER_SERVICE, "GetProfile", options, || downstream.get_profile(user_id))
        .await?;
    Ok(Envelope::ok(profile))
}

async fn add_friend(
    State(state): State<AppState>,
    ctx: AdmissionContext,
    ValidPath(friend_id): ValidPath<Uuid>,
) -> Result<Envelope<()>, GatewayError> {
    let user_id = ctx.require_subject()?.user_id;
    let mut options = CallOptions::once();
    if let Some(deadline) = ctx.deadline() {
        options = options.within(deadline);
    }
    let downstream = state.downstream.clone();
    state
        .executor
        .call(FRIEND_SERVICE, "AddFriend", options, || downstream.add_friend(user_id, friend_id))
        .await?;
    Ok(Envelope::ok(()))
}

#[derive(Debug, Serialize)]
struct BreakerView {
    service: String,
    state: &'static str,
}

async fn breakers(State(state): State<AppState>) -> Envelope<Vec<BreakerView>> {
    let views = state
        .executor
        .breakers()
        .snapshot()
        .into_iter()
        .map(|(service, state): (String, CircuitState)| BreakerView { service, state: state.as_str() })
        .collect();
    Envelope::ok(views)
}
