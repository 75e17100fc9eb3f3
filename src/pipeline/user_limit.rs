use super::guard::Guard;
use crate::context::AdmissionContext;
use crate::error::GatewayError;
use crate::rate_limit::{ScopeKey, TokenBucketLimiter};
use async_trait::async_trait;
use axum::extract::Request;
use std::sync::Arc;

/// Per-user bucket. Runs behind authentication.
#[derive(Debug, Clone)]
pub struct UserLimitGuard {
    limiter: TokenBucketLimiter,
}

impl UserLimitGuard {
    pub fn new(limiter: TokenBucketLimiter) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &TokenBucketLimiter {
        &self.limiter
    }
}

#[async_trait]
impl Guard for UserLimitGuard {
    fn name(&self) -> &'static str {
        "user_limit"
    }

    async fn check(&self, req: &mut Request) -> Result<(), GatewayError> {
        let user_id = AdmissionContext::of_mut(req).require_subject()?.user_id;
        let scope = ScopeKey::user(&user_id);
        if !self.limiter.allow(&scope).await {
            return Err(GatewayError::RateLimited { scope: scope.to_string() });
        }
        Ok(())
    }
}

/// Stricter bucket for one route, keyed by route and user. Without a limiter it admits
/// everything.
#[derive(Debug, Clone)]
pub struct RouteLimitGuard {
    route: Arc<str>,
    limiter: Option<TokenBucketLimiter>,
}

impl RouteLimitGuard {
    pub fn new(route: Arc<str>, limiter: Option<TokenBucketLimiter>) -> Self {
        Self { route, limiter }
    }

    pub fn limiter(&self) -> Option<&TokenBucketLimiter> {
        self.limiter.as_ref()
    }
}

#[async_trait]
impl Guard for RouteLimitGuard {
    fn name(&self) -> &'static str {
        "route_limit"
    }

    async fn check(&self, req: &mut Request) -> Result<(), GatewayError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        let user_id = AdmissionContext::of_mut(req).require_subject()?.user_id;
        let scope = ScopeKey::route(&self.route, &user_id);
        if !limiter.allow(&scope).await {
            return Err(GatewayError::RateLimited { scope: scope.to_string() });
        }
        Ok(())
    }
}
