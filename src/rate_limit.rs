//! Distributed token-bucket rate limiting.
//!
//! The building blocks:
//! - [`BucketStore`]: the shared key-value store. Implementations must run the whole
//!   read-refill-consume-persist sequence as one atomic unit (an in-process mutex for
//!   [`InMemoryBucketStore`], a server-side script for the redis adapter).
//! - [`TokenBucketLimiter`]: asks the store, bounds each round trip with a short timeout, and
//!   fails open when the store misbehaves.
//! - [`BlacklistCheck`]: set-membership lookup with the same fail-open policy.
//!
//! Bucket state lives outside the process and is mutated by every gateway replica, so the
//! limiter never reads and then writes in two separate round trips.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

pub mod blacklist;
pub mod limiter;
pub mod store;

pub use blacklist::BlacklistCheck;
pub use limiter::TokenBucketLimiter;
pub use store::{BucketStore, InMemoryBucketStore, StoreError};

/// Idle buckets never expire sooner than this.
pub const MIN_BUCKET_TTL_SECS: u64 = 60;

/// Capacity and refill rate of one class of bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketRule {
    capacity: f64,
    refill_per_sec: f64,
}

/// Errors produced when validating a [`BucketRule`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BucketRuleError {
    #[error("capacity must be a positive finite number (got {0})")]
    InvalidCapacity(f64),
    #[error("refill rate must be a positive finite number (got {0})")]
    InvalidRate(f64),
}

impl BucketRule {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Result<Self, BucketRuleError> {
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(BucketRuleError::InvalidCapacity(capacity));
        }
        if !(refill_per_sec.is_finite() && refill_per_sec > 0.0) {
            return Err(BucketRuleError::InvalidRate(refill_per_sec));
        }
        Ok(Self { capacity, refill_per_sec })
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    /// Key expiry: long enough for an empty bucket to refill twice over, never under a minute.
    pub fn ttl_secs(&self) -> u64 {
        let refill_secs = (self.capacity / self.refill_per_sec).ceil();
        let doubled = if refill_secs >= (u64::MAX / 2) as f64 {
            u64::MAX
        } else {
            2 * refill_secs as u64
        };
        doubled.max(MIN_BUCKET_TTL_SECS)
    }
}

/// Realm of a throttled subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Realm {
    Ip,
    User,
    RouteOverride,
}

impl Realm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Realm::Ip => "ip",
            Realm::User => "user",
            Realm::RouteOverride => "route-override",
        }
    }
}

impl fmt::Display for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{realm}:{subject-id}`, the store key of one bucket (before the deployment prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    realm: Realm,
    key: String,
}

impl ScopeKey {
    pub fn ip(ip: IpAddr) -> Self {
        Self { realm: Realm::Ip, key: format!("ip:{ip}") }
    }

    pub fn user(user_id: &Uuid) -> Self {
        Self { realm: Realm::User, key: format!("user:{user_id}") }
    }

    /// Per-route bucket of one subject; each route gets its own budget.
    pub fn route(route: &str, user_id: &Uuid) -> Self {
        Self { realm: Realm::RouteOverride, key: format!("route-override:{route}:{user_id}") }
    }

    pub fn realm(&self) -> Realm {
        self.realm
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_millis: u64,
}

/// Arguments of one atomic take against the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeRequest {
    pub now_millis: u64,
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub cost: f64,
    pub ttl_secs: u64,
}

impl TakeRequest {
    pub fn new(now_millis: u64, rule: &BucketRule, cost: f64) -> Self {
        Self {
            now_millis,
            capacity: rule.capacity,
            refill_per_sec: rule.refill_per_sec,
            cost,
            ttl_secs: rule.ttl_secs(),
        }
    }
}

/// The bucket arithmetic every store must reproduce atomically.
///
/// Refill only ever adds whole tokens, and the refill timestamp only moves when it does, so
/// frequent callers do not erase fractional progress. A rejected take leaves the tokens alone.
pub fn refill_and_take(previous: Option<BucketState>, req: &TakeRequest) -> (BucketState, bool) {
    let mut state = previous
        .unwrap_or(BucketState { tokens: req.capacity, last_refill_millis: req.now_millis });
    state.tokens = state.tokens.clamp(0.0, req.capacity);

    let elapsed = req.now_millis.saturating_sub(state.last_refill_millis);
    let refill = (elapsed as f64 * req.refill_per_sec / 1000.0).floor();
    if refill > 0.0 {
        state.tokens = (state.tokens + refill).min(req.capacity);
        state.last_refill_millis = req.now_millis;
    }

    let admitted = state.tokens >= req.cost;
    if admitted {
        state.tokens -= req.cost;
    }
    (state, admitted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> BucketRule {
        BucketRule::new(20.0, 10.0).unwrap()
    }

    #[test]
    fn rejects_non_positive_rules() {
        assert!(matches!(BucketRule::new(0.0, 1.0), Err(BucketRuleError::InvalidCapacity(_))));
        assert!(matches!(BucketRule::new(1.0, -2.0), Err(BucketRuleError::InvalidRate(_))));
        assert!(BucketRule::new(f64::NAN, 1.0).is_err());
    }

    #[test]
    fn ttl_has_a_one_minute_floor() {
        assert_eq!(rule().ttl_secs(), 60);
        // 1000 tokens at 1/s takes 1000s to refill; expiry is twice that
        assert_eq!(BucketRule::new(1000.0, 1.0).unwrap().ttl_secs(), 2000);
        assert_eq!(BucketRule::new(3.0, 0.02).unwrap().ttl_secs(), 300);
    }

    #[test]
    fn scope_keys_are_realm_prefixed() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(ScopeKey::ip(ip).as_str(), "ip:10.1.2.3");
        let uid = Uuid::nil();
        assert_eq!(ScopeKey::user(&uid).to_string(), format!("user:{uid}"));
        let route = ScopeKey::route("add_friend", &uid);
        assert_eq!(route.realm(), Realm::RouteOverride);
        assert!(route.as_str().starts_with("route-override:add_friend:"));
    }

    #[test]
    fn missing_bucket_starts_full() {
        let req = TakeRequest::new(1_000, &rule(), 1.0);
        let (state, admitted) = refill_and_take(None, &req);
        assert!(admitted);
        assert_eq!(state.tokens, 19.0);
        assert_eq!(state.last_refill_millis, 1_000);
    }

    #[test]
    fn rejection_leaves_tokens_unchanged() {
        let req = TakeRequest::new(1_000, &rule(), 1.0);
        let empty = BucketState { tokens: 0.5, last_refill_millis: 1_000 };
        let (state, admitted) = refill_and_take(Some(empty), &req);
        assert!(!admitted);
        assert_eq!(state, empty);
    }

    #[test]
    fn partial_refill_does_not_move_timestamp() {
        // 10/s => one token per 100ms; 99ms is not enough
        let start = BucketState { tokens: 0.0, last_refill_millis: 1_000 };
        let (state, admitted) = refill_and_take(Some(start), &TakeRequest::new(1_099, &rule(), 1.0));
        assert!(!admitted);
        assert_eq!(state.last_refill_millis, 1_000);

        let (state, admitted) = refill_and_take(Some(state), &TakeRequest::new(1_100, &rule(), 1.0));
        assert!(admitted);
        assert_eq!(state.tokens, 0.0);
        assert_eq!(state.last_refill_millis, 1_100);
    }

    #[test]
    fn refill_is_clamped_to_capacity() {
        let start = BucketState { tokens: 0.0, last_refill_millis: 0 };
        let (state, _) = refill_and_take(Some(start), &TakeRequest::new(3_600_000, &rule(), 0.0));
        assert_eq!(state.tokens, 20.0);
    }

    #[test]
    fn clock_skew_backwards_is_ignored() {
        let start = BucketState { tokens: 5.0, last_refill_millis: 10_000 };
        let (state, admitted) = refill_and_take(Some(start), &TakeRequest::new(9_000, &rule(), 1.0));
        assert!(admitted);
        assert_eq!(state.tokens, 4.0);
        assert_eq!(state.last_refill_millis, 10_000);
    }

    #[test]
    fn tokens_never_increase_without_elapsed_time() {
        let mut state = None;
        let mut last = f64::MAX;
        for _ in 0..30 {
            let (next, _) = refill_and_take(state, &TakeRequest::new(42, &rule(), 1.0));
            assert!(next.tokens <= last);
            last = next.tokens;
            state = Some(next);
        }
    }
}
