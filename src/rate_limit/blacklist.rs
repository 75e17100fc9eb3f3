use super::limiter::DEFAULT_STORE_OP_TIMEOUT;
use super::{BucketStore, StoreError};
use crate::telemetry::{BlacklistEvent, GatewayEvent, Telemetry};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BLACKLIST_KEY: &str = "tollgate:blacklist:ip";

/// Set-membership check against the shared blacklist. Store trouble means "not blacklisted".
#[derive(Clone, Debug)]
pub struct BlacklistCheck {
    store: Arc<dyn BucketStore>,
    set_key: Arc<str>,
    op_timeout: Duration,
    telemetry: Telemetry,
}

impl BlacklistCheck {
    pub fn new(store: Arc<dyn BucketStore>, set_key: impl AsRef<str>) -> Self {
        Self {
            store,
            set_key: Arc::from(set_key.as_ref()),
            op_timeout: DEFAULT_STORE_OP_TIMEOUT,
            telemetry: Telemetry::disabled(),
        }
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn set_key(&self) -> &str {
        &self.set_key
    }

    pub async fn is_blacklisted(&self, subject: &str) -> bool {
        match self.try_lookup(subject).await {
            Ok(true) => {
                self.telemetry
                    .emit(GatewayEvent::Blacklist(BlacklistEvent::Hit { subject: subject.to_string() }));
                true
            }
            Ok(false) => false,
            Err(err) => {
                tracing::warn!(subject, error = %err, "blacklist store failed; treating as not blacklisted");
                self.telemetry.emit(GatewayEvent::Blacklist(BlacklistEvent::FailedOpen {
                    subject: subject.to_string(),
                    reason: err.to_string(),
                }));
                false
            }
        }
    }

    /// One bounded lookup, without the fail-open policy.
    pub async fn try_lookup(&self, subject: &str) -> Result<bool, StoreError> {
        match tokio::time::timeout(self.op_timeout, self.store.is_member(&self.set_key, subject))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{InMemoryBucketStore, TakeRequest};
    use crate::telemetry::MemorySink;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct GarbledStore;

    #[async_trait]
    impl BucketStore for GarbledStore {
        async fn take(&self, _key: &str, _req: TakeRequest) -> Result<bool, StoreError> {
            Err(StoreError::Malformed("nil".into()))
        }

        async fn is_member(&self, _set_key: &str, _member: &str) -> Result<bool, StoreError> {
            Err(StoreError::Malformed("expected integer".into()))
        }
    }

    #[tokio::test]
    async fn hit_and_miss() {
        let store = InMemoryBucketStore::new();
        store.add_member(DEFAULT_BLACKLIST_KEY, "192.0.2.1");
        let sink = MemorySink::new();
        let check = BlacklistCheck::new(Arc::new(store), DEFAULT_BLACKLIST_KEY)
            .with_telemetry(Telemetry::recording(sink.clone()));
        assert!(check.is_blacklisted("192.0.2.1").await);
        assert!(!check.is_blacklisted("192.0.2.2").await);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn malformed_reply_fails_open() {
        let check = BlacklistCheck::new(Arc::new(GarbledStore), DEFAULT_BLACKLIST_KEY);
        assert!(!check.is_blacklisted("192.0.2.1").await);
        assert!(matches!(check.try_lookup("192.0.2.1").await, Err(StoreError::Malformed(_))));
    }
}
