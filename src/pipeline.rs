//! The admission pipeline: the ordered middleware chain in front of every authenticated route.
//!
//! Stage order, outermost first:
//!
//! 1. panic recovery
//! 2. request id
//! 3. client address resolution
//! 4. access log (server errors and slow requests)
//! 5. blacklist, then per-IP bucket
//! 6. authentication
//! 7. per-user bucket
//!
//! Each route then adds its own [`RouteLayer`]: an optional stricter bucket and the deadline
//! controller wrapping the handler.
//!
//! ```no_run
//! use std::sync::Arc;
//! use axum::{routing::post, Router};
//! use tollgate::auth::StaticTokenAuthenticator;
//! use tollgate::rate_limit::InMemoryBucketStore;
//! use tollgate::{AdmissionPipeline, GatewayConfig};
//!
//! # fn build() -> Result<Router, tollgate::ConfigError> {
//! let pipeline = AdmissionPipeline::new(
//!     GatewayConfig::default(),
//!     Arc::new(InMemoryBucketStore::new()),
//!     Arc::new(StaticTokenAuthenticator::new()),
//! )?;
//! let app = Router::new()
//!     .route(
//!         "/v1/friends",
//!         post(|| async { "added" }).layer(pipeline.route("/v1/friends").sensitive().build()),
//!     )
//!     .layer(pipeline.layer());
//! # Ok(app)
//! # }
//! ```

mod access_log;
mod authenticate;
mod client_ip;
mod guard;
mod ip_guard;
mod recovery;
mod request_id;
mod user_limit;

pub use access_log::{AccessLogLayer, AccessLogService};
pub use authenticate::AuthGuard;
pub use client_ip::ClientIpResolver;
pub use guard::{Guard, GuardLayer, GuardService};
pub use ip_guard::IpGuard;
pub use recovery::{RecoveryLayer, RecoveryService};
pub use request_id::{RequestIdLayer, RequestIdService, REQUEST_ID_HEADER};
pub use user_limit::{RouteLimitGuard, UserLimitGuard};

use crate::auth::Authenticator;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, GatewayConfig};
use crate::deadline::{DeadlineLayer, DeadlineService};
use crate::rate_limit::{BlacklistCheck, BucketRule, BucketStore, TokenBucketLimiter};
use crate::telemetry::Telemetry;
use axum::http::HeaderName;
use std::sync::Arc;
use std::time::Duration;
use tower_layer::Layer;

/// Explicitly constructed admission stack. Cheap to clone; clones share limiters and store.
#[derive(Debug, Clone)]
pub struct AdmissionPipeline {
    config: Arc<GatewayConfig>,
    store: Arc<dyn BucketStore>,
    authenticator: Arc<dyn Authenticator>,
    trusted_header: HeaderName,
    sensitive_rule: BucketRule,
    blacklist: BlacklistCheck,
    ip_limiter: TokenBucketLimiter,
    user_limiter: TokenBucketLimiter,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl AdmissionPipeline {
    /// Validates `config` and builds the IP, user, and blacklist stages over `store`.
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn BucketStore>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let ip_rule = config.ip_bucket()?;
        let user_rule = config.user_bucket()?;
        let sensitive_rule = config.sensitive_bucket()?;
        let trusted_header = config.trusted_header()?;
        let blacklist = BlacklistCheck::new(store.clone(), &config.blacklist_key)
            .with_op_timeout(config.store_timeout());

        let mut pipeline = Self {
            config: Arc::new(config),
            ip_limiter: TokenBucketLimiter::new(store.clone(), ip_rule),
            user_limiter: TokenBucketLimiter::new(store.clone(), user_rule),
            store,
            authenticator,
            trusted_header,
            sensitive_rule,
            blacklist,
            clock: Arc::new(SystemClock),
            telemetry: Telemetry::disabled(),
        };
        pipeline.rebuild();
        Ok(pipeline)
    }

    /// Bucket timestamps are shared across replicas; only swap the wall clock out in tests.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self.rebuild();
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self.rebuild();
        self
    }

    fn rebuild(&mut self) {
        self.ip_limiter = self.limiter(self.ip_limiter.rule());
        self.user_limiter = self.limiter(self.user_limiter.rule());
        self.blacklist = self.blacklist.clone().with_telemetry(self.telemetry.clone());
    }

    fn limiter(&self, rule: BucketRule) -> TokenBucketLimiter {
        TokenBucketLimiter::new(self.store.clone(), rule)
            .with_clock(self.clock.clone())
            .with_key_prefix(&self.config.bucket_key_prefix)
            .with_op_timeout(self.config.store_timeout())
            .with_telemetry(self.telemetry.clone())
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn ip_limiter(&self) -> &TokenBucketLimiter {
        &self.ip_limiter
    }

    pub fn user_limiter(&self) -> &TokenBucketLimiter {
        &self.user_limiter
    }

    pub fn blacklist(&self) -> &BlacklistCheck {
        &self.blacklist
    }

    /// The shared stages, for `Router::layer`.
    pub fn layer(&self) -> AdmissionLayer {
        AdmissionLayer {
            client_ip: GuardLayer::new(ClientIpResolver::new(self.trusted_header.clone())),
            access_log: AccessLogLayer::new(self.config.slow_threshold()),
            ip_guard: GuardLayer::new(IpGuard::new(
                self.blacklist.clone(),
                self.ip_limiter.clone(),
            )),
            auth: GuardLayer::new(AuthGuard::new(self.authenticator.clone())),
            user_limit: GuardLayer::new(UserLimitGuard::new(self.user_limiter.clone())),
        }
    }

    /// Start configuring one route's layer. The deadline defaults to the route's configured
    /// timeout.
    pub fn route(&self, name: impl Into<String>) -> RouteBuilder {
        let name = name.into();
        let timeout = self.config.route_timeout(&name);
        RouteBuilder { pipeline: self.clone(), name, rule: None, timeout }
    }
}

/// Recovery, request id, client address, access log, IP stage, authentication, user bucket.
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    client_ip: GuardLayer<ClientIpResolver>,
    access_log: AccessLogLayer,
    ip_guard: GuardLayer<IpGuard>,
    auth: GuardLayer<AuthGuard>,
    user_limit: GuardLayer<UserLimitGuard>,
}

pub type AdmissionService<S> = RecoveryService<
    RequestIdService<
        GuardService<
            AccessLogService<
                GuardService<GuardService<GuardService<S, UserLimitGuard>, AuthGuard>, IpGuard>,
            >,
            ClientIpResolver,
        >,
    >,
>;

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        let inner = self.user_limit.layer(inner);
        let inner = self.auth.layer(inner);
        let inner = self.ip_guard.layer(inner);
        let inner = self.access_log.layer(inner);
        let inner = self.client_ip.layer(inner);
        let inner = RequestIdLayer.layer(inner);
        RecoveryLayer.layer(inner)
    }
}

/// Builder for one route's independently configured layer.
#[derive(Debug, Clone)]
pub struct RouteBuilder {
    pipeline: AdmissionPipeline,
    name: String,
    rule: Option<BucketRule>,
    timeout: Duration,
}

impl RouteBuilder {
    /// Apply the configured sensitive-operation bucket.
    pub fn sensitive(mut self) -> Self {
        self.rule = Some(self.pipeline.sensitive_rule);
        self
    }

    /// Apply a custom bucket for this route.
    pub fn limit(mut self, rule: BucketRule) -> Self {
        self.rule = Some(rule);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> RouteLayer {
        let route: Arc<str> = Arc::from(self.name);
        let limiter = self.rule.map(|rule| self.pipeline.limiter(rule));
        RouteLayer {
            limit: GuardLayer::new(RouteLimitGuard::new(route.clone(), limiter)),
            deadline: DeadlineLayer::new(route, self.timeout)
                .with_telemetry(self.pipeline.telemetry.clone()),
        }
    }
}

/// Optional route bucket, then the deadline controller.
#[derive(Debug, Clone)]
pub struct RouteLayer {
    limit: GuardLayer<RouteLimitGuard>,
    deadline: DeadlineLayer,
}

impl RouteLayer {
    /// This route's own limiter, for live tuning through its rule handle.
    pub fn limiter(&self) -> Option<&TokenBucketLimiter> {
        self.limit.guard().limiter()
    }

    pub fn timeout(&self) -> Duration {
        self.deadline.timeout()
    }
}

impl<S> Layer<S> for RouteLayer {
    type Service = GuardService<DeadlineService<S>, RouteLimitGuard>;

    fn layer(&self, inner: S) -> Self::Service {
        self.limit.layer(self.deadline.layer(inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenAuthenticator;
    use crate::rate_limit::InMemoryBucketStore;

    fn pipeline(config: GatewayConfig) -> AdmissionPipeline {
        AdmissionPipeline::new(
            config,
            Arc::new(InMemoryBucketStore::new()),
            Arc::new(StaticTokenAuthenticator::new()),
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = GatewayConfig { ip_rate: 0.0, ..GatewayConfig::default() };
        let err = AdmissionPipeline::new(
            config,
            Arc::new(InMemoryBucketStore::new()),
            Arc::new(StaticTokenAuthenticator::new()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("ipRate"));
    }

    #[test]
    fn routes_are_configured_independently() {
        let mut config = GatewayConfig::default();
        config.per_route_timeout_overrides.insert("/v1/login".into(), 800);
        let pipeline = pipeline(config);

        let login = pipeline.route("/v1/login").sensitive().build();
        let profile = pipeline.route("/v1/profile").build();
        let upload = pipeline
            .route("/v1/upload")
            .limit(BucketRule::new(2.0, 0.5).unwrap())
            .timeout(Duration::from_secs(30))
            .build();

        assert_eq!(login.timeout(), Duration::from_millis(800));
        assert_eq!(profile.timeout(), Duration::from_secs(5));
        assert_eq!(upload.timeout(), Duration::from_secs(30));
        assert!(profile.limiter().is_none());
        assert_eq!(login.limiter().unwrap().rule(), BucketRule::new(3.0, 1.0).unwrap());

        // tuning one route never leaks into another
        login.limiter().unwrap().rule_handle().set(BucketRule::new(10.0, 5.0).unwrap());
        let other = pipeline.route("/v1/login").sensitive().build();
        assert_eq!(other.limiter().unwrap().rule(), BucketRule::new(3.0, 1.0).unwrap());
        assert_eq!(upload.limiter().unwrap().rule(), BucketRule::new(2.0, 0.5).unwrap());
    }

    #[test]
    fn clock_swap_keeps_tuned_rules() {
        let pipeline = pipeline(GatewayConfig::default());
        pipeline.ip_limiter().rule_handle().set(BucketRule::new(7.0, 7.0).unwrap());
        let pipeline = pipeline.with_clock(crate::clock::ManualClock::default());
        assert_eq!(pipeline.ip_limiter().rule(), BucketRule::new(7.0, 7.0).unwrap());
    }
}
