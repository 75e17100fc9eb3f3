use crate::context::AdmissionContext;
use crate::error::GatewayError;
use async_trait::async_trait;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// One admission decision. `Err` short-circuits the chain with that error's response.
///
/// Guards may annotate the request (typically its [`AdmissionContext`]) before it moves on.
#[async_trait]
pub trait Guard: Send + Sync + fmt::Debug + 'static {
    /// Stage name used in logs.
    fn name(&self) -> &'static str;

    async fn check(&self, req: &mut Request) -> Result<(), GatewayError>;
}

/// Wraps a service with a [`Guard`].
#[derive(Debug)]
pub struct GuardLayer<G> {
    guard: Arc<G>,
}

impl<G> GuardLayer<G> {
    pub fn new(guard: G) -> Self {
        Self { guard: Arc::new(guard) }
    }

    pub fn guard(&self) -> &G {
        &self.guard
    }
}

impl<G> Clone for GuardLayer<G> {
    fn clone(&self) -> Self {
        Self { guard: self.guard.clone() }
    }
}

impl<S, G: Guard> Layer<S> for GuardLayer<G> {
    type Service = GuardService<S, G>;

    fn layer(&self, inner: S) -> Self::Service {
        GuardService { inner, guard: self.guard.clone() }
    }
}

#[derive(Debug)]
pub struct GuardService<S, G> {
    inner: S,
    guard: Arc<G>,
}

impl<S: Clone, G> Clone for GuardService<S, G> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), guard: self.guard.clone() }
    }
}

impl<S, G> Service<Request> for GuardService<S, G>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    G: Guard,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let guard = self.guard.clone();
        // the clone we leave behind is not known to be ready; hand the ready one to this call
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if let Err(err) = guard.check(&mut req).await {
                let request_id = AdmissionContext::of_mut(&mut req).request_id().clone();
                if err.is_client_driven() {
                    tracing::debug!(stage = guard.name(), %request_id, error = %err, "request rejected");
                } else {
                    tracing::error!(stage = guard.name(), %request_id, error = %err, "admission stage failed");
                }
                return Ok(err.into_response());
            }
            inner.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    #[derive(Debug)]
    struct Deny;

    #[async_trait]
    impl Guard for Deny {
        fn name(&self) -> &'static str {
            "deny"
        }

        async fn check(&self, _req: &mut Request) -> Result<(), GatewayError> {
            Err(GatewayError::ClientBlacklisted)
        }
    }

    #[derive(Debug)]
    struct Allow;

    #[async_trait]
    impl Guard for Allow {
        fn name(&self) -> &'static str {
            "allow"
        }

        async fn check(&self, _req: &mut Request) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn rejection_skips_inner_service() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let svc = GuardLayer::new(Deny).layer(service_fn(move |_req: Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Infallible>(Response::new(Body::empty())) }
        }));

        let response = svc.oneshot(Request::new(Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pass_reaches_inner_service() {
        let svc = GuardLayer::new(Allow).layer(service_fn(|_req: Request| async {
            Ok::<_, Infallible>(Response::new(Body::from("ok")))
        }));
        let response = svc.oneshot(Request::new(Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
