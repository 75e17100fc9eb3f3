use super::guard::Guard;
use crate::auth::{Authenticator, Credentials};
use crate::context::AdmissionContext;
use crate::error::GatewayError;
use async_trait::async_trait;
use axum::extract::Request;
use std::sync::Arc;

/// Binds the authenticated [`Subject`](crate::context::Subject) or answers 401.
#[derive(Debug, Clone)]
pub struct AuthGuard {
    authenticator: Arc<dyn Authenticator>,
}

impl AuthGuard {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }
}

#[async_trait]
impl Guard for AuthGuard {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    async fn check(&self, req: &mut Request) -> Result<(), GatewayError> {
        let credentials = Credentials::from_headers(req.headers());
        let subject = self
            .authenticator
            .authenticate(&credentials)
            .await
            .map_err(|err| GatewayError::Unauthenticated(err.to_string()))?;
        AdmissionContext::of_mut(req).set_subject(subject);
        Ok(())
    }
}
