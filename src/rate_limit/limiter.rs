use super::{BucketRule, BucketStore, ScopeKey, StoreError, TakeRequest};
use crate::adaptive::DynamicConfig;
use crate::clock::{Clock, SystemClock};
use crate::telemetry::{GatewayEvent, RateLimitEvent, Telemetry};
use std::sync::Arc;
use std::time::Duration;

/// Default bound on one store round trip.
pub const DEFAULT_STORE_OP_TIMEOUT: Duration = Duration::from_millis(50);
pub const DEFAULT_KEY_PREFIX: &str = "tollgate:bucket:";

/// Token-bucket limiter over a shared [`BucketStore`].
///
/// Clones share the store, the rule handle, and the telemetry handle. Store failures, store
/// timeouts, and malformed replies all admit the request.
///
/// ```
/// use std::sync::Arc;
/// use tollgate::rate_limit::{BucketRule, InMemoryBucketStore, ScopeKey, TokenBucketLimiter};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let limiter = TokenBucketLimiter::new(
///     Arc::new(InMemoryBucketStore::new()),
///     BucketRule::new(3.0, 1.0).unwrap(),
/// );
/// let scope = ScopeKey::ip("203.0.113.9".parse().unwrap());
/// assert!(limiter.allow(&scope).await);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct TokenBucketLimiter {
    store: Arc<dyn BucketStore>,
    rule: DynamicConfig<BucketRule>,
    clock: Arc<dyn Clock>,
    key_prefix: Arc<str>,
    op_timeout: Duration,
    telemetry: Telemetry,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn BucketStore>, rule: BucketRule) -> Self {
        Self {
            store,
            rule: DynamicConfig::new(rule),
            clock: Arc::new(SystemClock),
            key_prefix: Arc::from(DEFAULT_KEY_PREFIX),
            op_timeout: DEFAULT_STORE_OP_TIMEOUT,
            telemetry: Telemetry::disabled(),
        }
    }

    /// Bucket timestamps are shared across replicas; only swap the wall clock out in tests.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        self.key_prefix = Arc::from(prefix.as_ref());
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Live handle on this limiter's rule.
    pub fn rule_handle(&self) -> DynamicConfig<BucketRule> {
        self.rule.clone()
    }

    pub fn rule(&self) -> BucketRule {
        *self.rule.get()
    }

    /// Take one token from `scope`'s bucket.
    pub async fn allow(&self, scope: &ScopeKey) -> bool {
        self.allow_n(scope, 1.0).await
    }

    /// Take `cost` tokens; admits when the store cannot answer.
    pub async fn allow_n(&self, scope: &ScopeKey, cost: f64) -> bool {
        match self.try_take(scope, cost).await {
            Ok(true) => true,
            Ok(false) => {
                self.telemetry.emit(GatewayEvent::RateLimit(RateLimitEvent::Rejected {
                    realm: scope.realm(),
                    scope: scope.to_string(),
                }));
                false
            }
            Err(err) => {
                tracing::warn!(scope = %scope, error = %err, "rate limit store failed; admitting");
                self.telemetry.emit(GatewayEvent::RateLimit(RateLimitEvent::FailedOpen {
                    realm: scope.realm(),
                    scope: scope.to_string(),
                    reason: err.to_string(),
                }));
                true
            }
        }
    }

    /// One bounded round trip, without the fail-open policy.
    pub async fn try_take(&self, scope: &ScopeKey, cost: f64) -> Result<bool, StoreError> {
        let rule = self.rule();
        let req = TakeRequest::new(self.clock.now_millis(), &rule, cost);
        let key = format!("{}{}", self.key_prefix, scope);
        match tokio::time::timeout(self.op_timeout, self.store.take(&key, req)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}
