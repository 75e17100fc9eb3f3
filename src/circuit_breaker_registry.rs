//! Registry of per-service circuit breakers.
//!
//! Built explicitly at startup and handed to whatever needs it; there is no process-wide
//! instance. Breakers for known services are created up front, unknown names get one lazily.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::Telemetry;

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerRegistryError {
    #[error("circuit breaker '{name}' not found")]
    NotFound { name: String },
}

/// One breaker per downstream service, all sharing a policy.
#[derive(Clone, Debug)]
pub struct BreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::default(),
            config,
            clock: Arc::new(MonotonicClock::default()),
            telemetry: Telemetry::disabled(),
        }
    }

    /// Applies to breakers created after this call.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Applies to breakers created after this call.
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Pre-create breakers for `services`.
    pub fn with_services<I, S>(self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for service in services {
            self.breaker(service.as_ref());
        }
        self
    }

    fn build(&self, name: &str) -> CircuitBreaker {
        CircuitBreaker::with_parts(
            name.to_string(),
            self.config.clone(),
            self.clock.clone(),
            self.telemetry.clone(),
        )
    }

    /// Breaker for `name`, created on first use.
    pub fn breaker(&self, name: &str) -> CircuitBreaker {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut map = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string()).or_insert_with(|| self.build(name)).clone()
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Force one breaker back to Closed.
    pub fn reset(&self, name: &str) -> Result<(), BreakerRegistryError> {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                tracing::info!(service = name, "circuit breaker reset");
                Ok(())
            }
            None => Err(BreakerRegistryError::NotFound { name: name.to_string() }),
        }
    }

    /// Breaker states sorted by service name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let breakers: Vec<CircuitBreaker> =
            self.breakers.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        let mut entries: Vec<(String, CircuitState)> =
            breakers.iter().map(|b| (b.name().to_string(), b.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn preloads_services() {
        let registry =
            BreakerRegistry::new(CircuitBreakerConfig::default()).with_services(["user", "friend"]);
        assert_eq!(
            registry.snapshot(),
            vec![("friend".to_string(), CircuitState::Closed), ("user".to_string(), CircuitState::Closed)]
        );
    }

    #[tokio::test]
    async fn same_name_shares_state() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default())
            .with_clock(ManualClock::default());
        let first = registry.breaker("user");
        for _ in 0..5 {
            let _ = first.execute(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(registry.breaker("user").state(), CircuitState::Open);
        assert_eq!(registry.breaker("friend").state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_by_name() {
        let registry = BreakerRegistry::new(CircuitBreakerConfig::default())
            .with_clock(ManualClock::default());
        let breaker = registry.breaker("user");
        for _ in 0..5 {
            let _ = breaker.execute(|| async { Err::<(), _>("boom") }).await;
        }
        registry.reset("user").unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(
            registry.reset("ghost"),
            Err(BreakerRegistryError::NotFound { name: "ghost".into() })
        );
    }
}
