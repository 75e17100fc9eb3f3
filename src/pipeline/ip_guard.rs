use super::guard::Guard;
use crate::context::AdmissionContext;
use crate::error::GatewayError;
use crate::rate_limit::{BlacklistCheck, ScopeKey, TokenBucketLimiter};
use async_trait::async_trait;
use axum::extract::Request;

/// Blacklist membership, then the per-IP bucket. Blacklisted clients spend no throttle budget.
#[derive(Debug, Clone)]
pub struct IpGuard {
    blacklist: BlacklistCheck,
    limiter: TokenBucketLimiter,
}

impl IpGuard {
    pub fn new(blacklist: BlacklistCheck, limiter: TokenBucketLimiter) -> Self {
        Self { blacklist, limiter }
    }

    pub fn limiter(&self) -> &TokenBucketLimiter {
        &self.limiter
    }
}

#[async_trait]
impl Guard for IpGuard {
    fn name(&self) -> &'static str {
        "ip_guard"
    }

    async fn check(&self, req: &mut Request) -> Result<(), GatewayError> {
        let Some(ip) = AdmissionContext::of_mut(req).client_ip() else {
            return Ok(());
        };
        if self.blacklist.is_blacklisted(&ip.to_string()).await {
            return Err(GatewayError::ClientBlacklisted);
        }
        let scope = ScopeKey::ip(ip);
        if !self.limiter.allow(&scope).await {
            return Err(GatewayError::RateLimited { scope: scope.to_string() });
        }
        Ok(())
    }
}
