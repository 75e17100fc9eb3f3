//! Per-request admission state.
//!
//! The request-id stage creates an [`AdmissionContext`] and stores it in the request extensions;
//! later stages fill it in as they resolve identities, and handlers extract it as an axum
//! extractor.

use crate::error::GatewayError;
use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const MAX_REQUEST_ID_LEN: usize = 128;

/// Trace identifier for one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(Arc<str>);

impl RequestId {
    /// Fresh UUID v4.
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    /// Accepts 1..=128 visible ASCII characters; anything else is refused.
    pub fn parse(raw: &str) -> Option<Self> {
        let well_formed = !raw.is_empty()
            && raw.len() <= MAX_REQUEST_ID_LEN
            && raw.bytes().all(|b| b.is_ascii_graphic());
        well_formed.then(|| Self(Arc::from(raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub user_id: Uuid,
    pub device_id: Option<String>,
}

impl Subject {
    pub fn new(user_id: Uuid) -> Self {
        Self { user_id, device_id: None }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// One-shot "a response is on its way" flag shared by the handler and the deadline controller.
///
/// Whoever wins [`ResponseLatch::try_commit`] owns the response; the loser must not write one.
#[derive(Debug, Clone, Default)]
pub struct ResponseLatch(Arc<AtomicBool>);

impl ResponseLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` for exactly one caller.
    pub fn try_commit(&self) -> bool {
        self.0.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn is_committed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Typed per-request state threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct AdmissionContext {
    request_id: RequestId,
    started_at: Instant,
    client_ip: Option<IpAddr>,
    subject: Option<Subject>,
    route: Option<Arc<str>>,
    deadline: Option<Instant>,
    latch: ResponseLatch,
}

impl AdmissionContext {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            started_at: Instant::now(),
            client_ip: None,
            subject: None,
            route: None,
            deadline: None,
            latch: ResponseLatch::new(),
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    /// For stages and handlers behind authentication.
    pub fn require_subject(&self) -> Result<&Subject, GatewayError> {
        self.subject
            .as_ref()
            .ok_or_else(|| GatewayError::Unauthenticated("no authenticated subject".into()))
    }

    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when no deadline is bound.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn latch(&self) -> &ResponseLatch {
        &self.latch
    }

    /// Claim the response. Handlers that write their own timeout answer call this first.
    pub fn commit_response(&self) -> bool {
        self.latch.try_commit()
    }

    pub(crate) fn set_client_ip(&mut self, ip: IpAddr) {
        self.client_ip = Some(ip);
    }

    pub(crate) fn set_subject(&mut self, subject: Subject) {
        self.subject = Some(subject);
    }

    /// Binds the route and deadline. An earlier, tighter deadline is never extended.
    pub(crate) fn bind_deadline(&mut self, route: Arc<str>, deadline: Instant) -> Instant {
        let bound = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        self.route = Some(route);
        self.deadline = Some(bound);
        bound
    }

    /// Context of `req`, creating one with a fresh id if no earlier stage did.
    pub(crate) fn of_mut(req: &mut Request) -> &mut AdmissionContext {
        req.extensions_mut().get_or_insert_with(|| AdmissionContext::new(RequestId::generate()))
    }
}

impl<S> FromRequestParts<S> for AdmissionContext
where
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AdmissionContext>()
            .cloned()
            .ok_or_else(|| GatewayError::Internal("admission pipeline not installed".into()))
    }
}
