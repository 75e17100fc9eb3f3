use crate::context::AdmissionContext;
use axum::extract::Request;
use axum::response::Response;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower_layer::Layer;
use tower_service::Service;

/// Logs server errors and slow requests only.
#[derive(Debug, Clone, Copy)]
pub struct AccessLogLayer {
    slow_threshold: Duration,
}

impl AccessLogLayer {
    pub fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService { inner, slow_threshold: self.slow_threshold }
    }
}

#[derive(Debug, Clone)]
pub struct AccessLogService<S> {
    inner: S,
    slow_threshold: Duration,
}

impl<S> Service<Request> for AccessLogService<S>
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
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let ctx = AdmissionContext::of_mut(&mut req);
        let request_id = ctx.request_id().clone();
        let client_ip = ctx.client_ip().map(|ip| ip.to_string()).unwrap_or_default();
        let slow_threshold = self.slow_threshold;

        let fut = self.inner.call(req);
        Box::pin(async move {
            let response = fut.await?;
            let status = response.status();
            let elapsed = started.elapsed();
            let duration_ms = elapsed.as_millis() as u64;
            if status.is_server_error() {
                tracing::error!(%request_id, client_ip, %method, path, status = status.as_u16(), duration_ms, "request failed");
            } else if elapsed > slow_threshold {
                tracing::warn!(%request_id, client_ip, %method, path, status = status.as_u16(), duration_ms, "slow request");
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::StatusCode;
    use tower::{service_fn, ServiceExt};

    #[tokio::test(start_paused = true)]
    async fn passes_responses_through_untouched() {
        let svc = AccessLogLayer::new(Duration::from_millis(100)).layer(service_fn(
            |_req: Request| async {
                tokio::time::sleep(Duration::from_millis(250)).await;
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                Ok::<_, Infallible>(response)
            },
        ));
        let response = svc.oneshot(Request::new(Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
