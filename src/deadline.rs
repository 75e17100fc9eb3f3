//! Deadline controller: bounded handler execution that never writes a second response.
//!
//! The handler future is polled in the caller's task. When the deadline passes first, the
//! controller claims the request's [`ResponseLatch`](crate::context::ResponseLatch); if it wins it
//! drops the handler (cancelling any downstream call in flight) and answers with a timeout. If
//! the handler already claimed the latch, the controller keeps waiting for the handler's own
//! response and adds nothing.

use crate::context::AdmissionContext;
use crate::error::GatewayError;
use crate::telemetry::{GatewayEvent, Telemetry, TimeoutEvent};
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower_layer::Layer;
use tower_service::Service;

#[derive(Debug, Clone)]
pub struct DeadlineLayer {
    route: Arc<str>,
    timeout: Duration,
    telemetry: Telemetry,
}

impl DeadlineLayer {
    pub fn new(route: impl Into<Arc<str>>, timeout: Duration) -> Self {
        Self { route: route.into(), timeout, telemetry: Telemetry::disabled() }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<S> Layer<S> for DeadlineLayer {
    type Service = DeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadlineService {
            inner,
            route: self.route.clone(),
            timeout: self.timeout,
            telemetry: self.telemetry.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadlineService<S> {
    inner: S,
    route: Arc<str>,
    timeout: Duration,
    telemetry: Telemetry,
}

impl<S> Service<Request> for DeadlineService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let started = Instant::now();
        let ctx = AdmissionContext::of_mut(&mut req);
        let deadline = ctx.bind_deadline(self.route.clone(), started + self.timeout);
        let latch = ctx.latch().clone();
        let request_id = ctx.request_id().clone();
        let route = self.route.clone();
        let telemetry = self.telemetry.clone();

        let handler = self.inner.call(req);
        Box::pin(async move {
            let mut handler = std::pin::pin!(handler);
            tokio::select! {
                biased;
                result = &mut handler => {
                    latch.try_commit();
                    result
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if !latch.try_commit() {
                        return handler.await;
                    }
                    let timeout = deadline.saturating_duration_since(started);
                    tracing::warn!(%request_id, route = %route, timeout_ms = timeout.as_millis() as u64, "request deadline exceeded");
                    telemetry.emit(GatewayEvent::Timeout(TimeoutEvent {
                        route: route.to_string(),
                        timeout,
                    }));
                    Ok(GatewayError::Timeout { timeout }.into_response())
                }
            }
        })
    }
}
