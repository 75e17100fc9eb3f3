//! Gateway configuration surface.
//!
//! Keys are camelCase; durations are integer milliseconds; rates are tokens per second and
//! bursts are bucket capacities. Every key is optional and falls back to [`GatewayConfig::default`].
//!
//! ```json
//! {
//!   "ipRate": 20, "ipBurst": 40,
//!   "userRate": 10, "userBurst": 20,
//!   "sensitiveOpRate": 1, "sensitiveOpBurst": 3,
//!   "breakerMinRequests": 5, "breakerFailureRatio": 0.5,
//!   "breakerOpenCooldown": 45000, "breakerHalfOpenProbes": 3,
//!   "defaultRequestTimeout": 5000,
//!   "perRouteTimeoutOverrides": { "/v1/auth/login": 2000 }
//! }
//! ```

use crate::backoff::Backoff;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use crate::rate_limit::BucketRule;
use axum::http::HeaderName;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    Breaker(#[from] CircuitBreakerError),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid { field, reason: reason.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct GatewayConfig {
    pub ip_rate: f64,
    pub ip_burst: f64,
    pub blacklist_key: String,
    pub user_rate: f64,
    pub user_burst: f64,
    pub sensitive_op_rate: f64,
    pub sensitive_op_burst: f64,
    pub breaker_min_requests: u32,
    pub breaker_failure_ratio: f64,
    pub breaker_open_cooldown: u64,
    pub breaker_half_open_probes: u32,
    /// Rolling statistics window while Closed.
    pub breaker_interval: u64,
    pub default_request_timeout: u64,
    pub per_route_timeout_overrides: HashMap<String, u64>,
    /// Per-call limit for shared-store round trips. Fixed; does not scale with load.
    pub store_op_timeout: u64,
    pub bucket_key_prefix: String,
    pub trusted_proxy_header: String,
    pub slow_request_threshold: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay: u64,
    pub retry_max_delay: u64,
    pub telemetry_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ip_rate: 20.0,
            ip_burst: 40.0,
            blacklist_key: "tollgate:blacklist:ip".to_string(),
            user_rate: 10.0,
            user_burst: 20.0,
            sensitive_op_rate: 1.0,
            sensitive_op_burst: 3.0,
            breaker_min_requests: 5,
            breaker_failure_ratio: 0.5,
            breaker_open_cooldown: 45_000,
            breaker_half_open_probes: 3,
            breaker_interval: 15_000,
            default_request_timeout: 5_000,
            per_route_timeout_overrides: HashMap::new(),
            store_op_timeout: 50,
            bucket_key_prefix: "tollgate:bucket:".to_string(),
            trusted_proxy_header: "X-Real-IP".to_string(),
            slow_request_threshold: 1_000,
            retry_max_attempts: 3,
            retry_base_delay: 50,
            retry_max_delay: 1_000,
            telemetry_buffer: 1_024,
        }
    }
}

impl GatewayConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, rate, burst) in [
            ("ipRate/ipBurst", self.ip_rate, self.ip_burst),
            ("userRate/userBurst", self.user_rate, self.user_burst),
            ("sensitiveOpRate/sensitiveOpBurst", self.sensitive_op_rate, self.sensitive_op_burst),
        ] {
            BucketRule::new(burst, rate).map_err(|e| ConfigError::invalid(field, e.to_string()))?;
        }
        if self.blacklist_key.trim().is_empty() {
            return Err(ConfigError::invalid("blacklistKey", "must not be empty"));
        }
        if self.default_request_timeout == 0 {
            return Err(ConfigError::invalid("defaultRequestTimeout", "must be > 0"));
        }
        if let Some((route, _)) = self.per_route_timeout_overrides.iter().find(|(_, ms)| **ms == 0)
        {
            return Err(ConfigError::invalid(
                "perRouteTimeoutOverrides",
                format!("timeout for '{route}' must be > 0"),
            ));
        }
        if self.store_op_timeout == 0 {
            return Err(ConfigError::invalid("storeOpTimeout", "must be > 0"));
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::invalid("retryMaxAttempts", "must be > 0"));
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(ConfigError::invalid("retryMaxDelay", "must be >= retryBaseDelay"));
        }
        self.trusted_header()?;
        self.breaker_config()?;
        Ok(())
    }

    /// Header name of the trusted reverse proxy's client-address header.
    pub fn trusted_header(&self) -> Result<HeaderName, ConfigError> {
        HeaderName::from_bytes(self.trusted_proxy_header.as_bytes())
            .map_err(|e| ConfigError::invalid("trustedProxyHeader", e.to_string()))
    }

    pub fn ip_bucket(&self) -> Result<BucketRule, ConfigError> {
        BucketRule::new(self.ip_burst, self.ip_rate)
            .map_err(|e| ConfigError::invalid("ipRate/ipBurst", e.to_string()))
    }

    pub fn user_bucket(&self) -> Result<BucketRule, ConfigError> {
        BucketRule::new(self.user_burst, self.user_rate)
            .map_err(|e| ConfigError::invalid("userRate/userBurst", e.to_string()))
    }

    pub fn sensitive_bucket(&self) -> Result<BucketRule, ConfigError> {
        BucketRule::new(self.sensitive_op_burst, self.sensitive_op_rate).map_err(|e| {
            ConfigError::invalid("sensitiveOpRate/sensitiveOpBurst", e.to_string())
        })
    }

    pub fn breaker_config(&self) -> Result<CircuitBreakerConfig, ConfigError> {
        Ok(CircuitBreakerConfig::new(
            self.breaker_min_requests,
            self.breaker_failure_ratio,
            Duration::from_millis(self.breaker_open_cooldown),
            self.breaker_half_open_probes,
            Duration::from_millis(self.breaker_interval),
        )?)
    }

    /// Deadline for a route: its override if one exists, else the default.
    pub fn route_timeout(&self, route: &str) -> Duration {
        let ms = self
            .per_route_timeout_overrides
            .get(route)
            .copied()
            .unwrap_or(self.default_request_timeout);
        Duration::from_millis(ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_op_timeout)
    }

    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_request_threshold)
    }

    pub fn retry_backoff(&self) -> Backoff {
        let base = Duration::from_millis(self.retry_base_delay);
        let max = Duration::from_millis(self.retry_max_delay);
        Backoff::exponential(base).with_max(max).unwrap_or_else(|_| Backoff::constant(base))
    }
}
