//! Live-tunable values shared between an operator handle and the request path.
//!
//! A limiter reads its [`BucketRule`](crate::rate_limit::BucketRule) once per request through
//! a `DynamicConfig`; whoever holds a clone of the handle can retune it without a restart.
//! Each limiter owns its own handle, so retuning one route never touches another.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// `DynamicConfig<T>` gives lock-free reads and atomic replacement.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Read-copy-update; retried if another writer races.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|cur| Arc::new(f(cur)));
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;
    use crate::rate_limit::BucketRule;

    #[test]
    fn get_set_update() {
        let a = DynamicConfig::new(1);
        assert_eq!(*a.get(), 1);
        a.set(2);
        assert_eq!(*a.get(), 2);
        a.update(|v| v + 3);
        assert_eq!(*a.get(), 5);
    }

    #[test]
    fn clones_observe_retuned_rule() {
        let rule = DynamicConfig::new(BucketRule::new(20.0, 10.0).unwrap());
        let reader = rule.clone();
        let before = reader.get();
        rule.set(BucketRule::new(5.0, 1.0).unwrap());
        assert_eq!(before.capacity(), 20.0);
        assert_eq!(reader.get().capacity(), 5.0);
    }
}
