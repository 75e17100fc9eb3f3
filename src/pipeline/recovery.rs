use crate::error::GatewayError;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::any::Any;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Outermost stage: a panic anywhere below becomes an internal-error response.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryLayer;

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecoveryService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryService<S> {
    inner: S,
}

impl<S> Service<Request> for RecoveryService<S>
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

    fn call(&mut self, req: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| inner.call(req))) {
            Ok(fut) => fut,
            Err(payload) => return Box::pin(future::ready(Ok(recovered(payload)))),
        };
        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Ok(recovered(payload)),
            }
        })
    }
}

fn recovered(payload: Box<dyn Any + Send>) -> Response {
    let message = panic_message(payload.as_ref());
    tracing::error!(panic = %message, "recovered panic while handling request");
    GatewayError::Internal(message).into_response()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use axum::body::{to_bytes, Body};
    use axum::http::StatusCode;
    use tower::{service_fn, ServiceExt};

    #[tokio::test]
    async fn panic_in_handler_becomes_internal_error() {
        let svc = RecoveryLayer.layer(service_fn(|_req: Request| async {
            if true {
                panic!("handler exploded at 10.1.2.3");
            }
            Ok::<_, Infallible>(Response::new(Body::empty()))
        }));

        let response = svc.oneshot(Request::new(Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let envelope: Envelope<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(envelope.code, crate::error::codes::INTERNAL_ERROR);
        assert!(!envelope.message.contains("10.1.2.3"));
    }

    #[tokio::test]
    async fn panic_while_building_future_is_caught() {
        let svc = RecoveryLayer.layer(service_fn(|_req: Request| -> future::Ready<Result<Response, Infallible>> {
            panic!("sync panic")
        }));
        let response = svc.oneshot(Request::new(Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn normal_responses_pass_through() {
        let svc = RecoveryLayer.layer(service_fn(|_req: Request| async {
            Ok::<_, Infallible>(Response::new(Body::from("fine")))
        }));
        let response = svc.oneshot(Request::new(Body::empty())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn extracts_panic_messages() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "non-string panic payload");
    }
}
