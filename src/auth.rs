//! Authentication seam.
//!
//! Token issuing and parsing (JWT or otherwise) live outside the gateway core; the pipeline only
//! needs something that turns request [`Credentials`] into a [`Subject`].

use crate::context::Subject;
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Header carrying the client-declared device/session identifier.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Raw credentials pulled from request headers.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub bearer: Option<String>,
    pub device_id: Option<String>,
}

impl Credentials {
    /// `Authorization: Bearer <token>` plus the optional device header.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                let (scheme, token) = v.trim().split_once(' ')?;
                scheme.eq_ignore_ascii_case("bearer").then(|| token.trim().to_string())
            })
            .filter(|token| !token.is_empty());
        let device_id = headers
            .get(DEVICE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        Self { bearer, device_id }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .field("device_id", &self.device_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("credential expired")]
    Expired,
}

/// Validates credentials and resolves the caller.
#[async_trait]
pub trait Authenticator: Send + Sync + fmt::Debug {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Subject, AuthError>;
}

#[async_trait]
impl<A: Authenticator + ?Sized> Authenticator for Arc<A> {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Subject, AuthError> {
        (**self).authenticate(credentials).await
    }
}

/// Fixed token table for development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Uuid>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: Uuid) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Subject, AuthError> {
        let token = credentials.bearer.as_deref().ok_or(AuthError::MissingCredential)?;
        let user_id = self
            .tokens
            .get(token)
            .copied()
            .ok_or_else(|| AuthError::InvalidCredential("unknown token".into()))?;
        let subject = Subject::new(user_id);
        Ok(match &credentials.device_id {
            Some(device) => subject.with_device(device.clone()),
            None => subject,
        })
    }
}
