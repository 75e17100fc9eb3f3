use super::{refill_and_take, BucketState, TakeRequest};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

/// Failures talking to the shared store. Every variant makes the limiter fail open.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call exceeded {0:?}")]
    Timeout(std::time::Duration),
    #[error("unexpected store reply: {0}")]
    Malformed(String),
}

/// Shared key-value store holding token buckets and blacklist sets.
///
/// Implementations are shared by every gateway replica. `take` must apply the arithmetic of
/// [`refill_and_take`] as one atomic step server-side and refresh the key's expiry to
/// `req.ttl_secs`; a client-side read followed by a separate write is not acceptable.
#[async_trait]
pub trait BucketStore: Send + Sync + std::fmt::Debug {
    /// Refill, try to consume `req.cost`, persist, and report whether the take was admitted.
    async fn take(&self, key: &str, req: TakeRequest) -> Result<bool, StoreError>;

    /// Membership test against the set stored at `set_key`.
    async fn is_member(&self, set_key: &str, member: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: BucketState,
    expires_at_millis: u64,
}

/// Minimum spacing between sweeps of expired buckets inside `take`.
const SWEEP_INTERVAL_MILLIS: u64 = 10_000;

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<String, Entry>,
    sets: HashMap<String, HashSet<String>>,
    next_sweep_millis: u64,
}

impl Inner {
    fn sweep(&mut self, now_millis: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, entry| entry.expires_at_millis > now_millis);
        before - self.buckets.len()
    }
}

/// Single-process store for tests and single-replica deployments.
///
/// One mutex guards all buckets, which gives the same atomicity a scripted store gives.
/// Expiry is evaluated against the caller-supplied `now_millis`; `take` sweeps expired
/// buckets at most once per ten seconds of store time.
#[derive(Default, Clone, Debug)]
pub struct InMemoryBucketStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `member` to the set at `set_key`.
    pub fn add_member(&self, set_key: &str, member: impl Into<String>) {
        self.lock().sets.entry(set_key.to_string()).or_default().insert(member.into());
    }

    pub fn remove_member(&self, set_key: &str, member: &str) -> bool {
        self.lock().sets.get_mut(set_key).is_some_and(|set| set.remove(member))
    }

    /// Current state of a bucket, ignoring expiry.
    pub fn bucket(&self, key: &str) -> Option<BucketState> {
        self.lock().buckets.get(key).map(|entry| entry.state)
    }

    /// Drop buckets whose expiry is at or before `now_millis`; returns how many were removed.
    pub fn purge_expired(&self, now_millis: u64) -> usize {
        self.lock().sweep(now_millis)
    }

    pub fn bucket_count(&self) -> usize {
        self.lock().buckets.len()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn take(&self, key: &str, req: TakeRequest) -> Result<bool, StoreError> {
        let mut guard = self.lock();
        if req.now_millis >= guard.next_sweep_millis {
            guard.sweep(req.now_millis);
            guard.next_sweep_millis = req.now_millis.saturating_add(SWEEP_INTERVAL_MILLIS);
        }
        let previous = guard
            .buckets
            .get(key)
            .filter(|entry| entry.expires_at_millis > req.now_millis)
            .map(|entry| entry.state);
        let (state, admitted) = refill_and_take(previous, &req);
        let expires_at_millis = req.now_millis.saturating_add(req.ttl_secs.saturating_mul(1000));
        guard.buckets.insert(key.to_string(), Entry { state, expires_at_millis });
        Ok(admitted)
    }

    async fn is_member(&self, set_key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.lock().sets.get(set_key).is_some_and(|set| set.contains(member)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::BucketRule;

    fn take_req(now: u64) -> TakeRequest {
        TakeRequest::new(now, &BucketRule::new(2.0, 1.0).unwrap(), 1.0)
    }

    #[tokio::test]
    async fn persists_state_between_takes() {
        let store = InMemoryBucketStore::new();
        assert!(store.take("k", take_req(0)).await.unwrap());
        assert!(store.take("k", take_req(0)).await.unwrap());
        assert!(!store.take("k", take_req(0)).await.unwrap());
        assert_eq!(store.bucket("k").unwrap().tokens, 0.0);
    }

    #[tokio::test]
    async fn expired_bucket_starts_over_full() {
        let store = InMemoryBucketStore::new();
        store.take("k", take_req(0)).await.unwrap();
        store.take("k", take_req(0)).await.unwrap();
        // ttl is 60s for this rule
        assert!(store.take("k", take_req(60_000)).await.unwrap());
        assert_eq!(store.bucket("k").unwrap().tokens, 1.0);
    }

    #[tokio::test]
    async fn purge_removes_idle_buckets() {
        let store = InMemoryBucketStore::new();
        store.take("a", take_req(0)).await.unwrap();
        store.take("b", take_req(30_000)).await.unwrap();
        assert_eq!(store.purge_expired(61_000), 1);
        assert_eq!(store.bucket_count(), 1);
        assert!(store.bucket("b").is_some());
    }

    #[tokio::test]
    async fn take_sweeps_idle_buckets() {
        let store = InMemoryBucketStore::new();
        for i in 0..1_000 {
            store.take(&format!("ip:{i}"), take_req(0)).await.unwrap();
        }
        assert_eq!(store.bucket_count(), 1_000);

        // within the sweep interval nothing is scanned
        store.take("ip:late", take_req(5_000)).await.unwrap();
        assert_eq!(store.bucket_count(), 1_001);

        store.take("ip:fresh", take_req(3_600_000)).await.unwrap();
        assert_eq!(store.bucket_count(), 1);
        assert!(store.bucket("ip:fresh").is_some());
    }

    #[tokio::test]
    async fn set_membership() {
        let store = InMemoryBucketStore::new();
        store.add_member("bl", "1.2.3.4");
        assert!(store.is_member("bl", "1.2.3.4").await.unwrap());
        assert!(!store.is_member("bl", "5.6.7.8").await.unwrap());
        assert!(!store.is_member("other", "1.2.3.4").await.unwrap());
        assert!(store.remove_member("bl", "1.2.3.4"));
        assert!(!store.is_member("bl", "1.2.3.4").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_takes_never_overspend() {
        let store = InMemoryBucketStore::new();
        let rule = BucketRule::new(50.0, 1.0).unwrap();
        let mut handles = Vec::new();
        for _ in 0..200 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.take("shared", TakeRequest::new(7, &rule, 1.0)).await.unwrap()
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 50);
    }
}
