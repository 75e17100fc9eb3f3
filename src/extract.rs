//! Extractors whose rejections render as the `40000` invalid-input envelope.
//!
//! axum's own `Path` and `Json` reject with a plain-text 4xx body. Wrapping them keeps every
//! malformed request inside the `{code, message, data}` contract.

use crate::error::GatewayError;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{FromRequest, FromRequestParts, Json, Path, Request};
use axum::http::request::Parts;
use serde::de::DeserializeOwned;

/// Path parameters deserialized into `T`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidPath<T>(pub T);

impl<T, S> FromRequestParts<S> for ValidPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Path::<T>::from_request_parts(parts, state)
            .await
            .map(|Path(value)| Self(value))
            .map_err(path_rejected)
    }
}

/// JSON request body deserialized into `T`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Json::<T>::from_request(req, state)
            .await
            .map(|Json(value)| Self(value))
            .map_err(body_rejected)
    }
}

// Parser detail goes to the log only; the public message stays fixed.
fn path_rejected(rejection: PathRejection) -> GatewayError {
    tracing::debug!(detail = %rejection.body_text(), "path parameters rejected");
    GatewayError::InvalidInput("invalid path parameter".into())
}

fn body_rejected(rejection: JsonRejection) -> GatewayError {
    tracing::debug!(detail = %rejection.body_text(), "request body rejected");
    GatewayError::InvalidInput("invalid request body".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use axum::body::{to_bytes, Body};
    use axum::http::StatusCode;
    use axum::response::Response;
    use axum::routing::{get, post};
    use axum::Router;
    use serde::Deserialize;
    use tower::ServiceExt;
    use uuid::Uuid;

    #[derive(Debug, Deserialize)]
    struct Greeting {
        name: String,
    }

    fn app() -> Router {
        Router::new()
            .route(
                "/items/{id}",
                get(|ValidPath(id): ValidPath<Uuid>| async move { Envelope::ok(id.to_string()) }),
            )
            .route(
                "/greet",
                post(|ValidJson(body): ValidJson<Greeting>| async move { Envelope::ok(body.name) }),
            )
    }

    async fn call(req: Request) -> (StatusCode, serde_json::Value) {
        let response: Response = app().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn json_post(body: &'static str) -> Request {
        Request::builder()
            .method("POST")
            .uri("/greet")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn well_formed_path_passes_through() {
        let id = Uuid::from_u128(7);
        let req = Request::builder().uri(format!("/items/{id}")).body(Body::empty()).unwrap();
        let (status, body) = call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"], id.to_string());
    }

    #[tokio::test]
    async fn malformed_path_is_an_invalid_input_envelope() {
        let req = Request::builder().uri("/items/not-a-uuid").body(Body::empty()).unwrap();
        let (status, body) = call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 40000);
        assert_eq!(body["message"], "invalid path parameter");
        assert!(body["data"].is_null());
    }

    #[tokio::test]
    async fn malformed_json_is_an_invalid_input_envelope() {
        let (status, body) = call(json_post("{\"name\":")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 40000);
        assert_eq!(body["message"], "invalid request body");

        let (_, body) = call(json_post("{\"name\":\"ada\"}")).await;
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"], "ada");
    }
}
