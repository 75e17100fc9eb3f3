//! JSON response envelope: `{"code": <int>, "message": <string>, "data": <any|null>}`.

use crate::error::codes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Uniform response body. `code == 0` is success; anything else is a taxonomy code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub code: i32,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    /// Successful response carrying `data`.
    pub fn ok(data: T) -> Self {
        Self { code: codes::OK, message: "success".to_string(), data: Some(data) }
    }

    /// Failure carrying only a code and a client-safe message.
    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn is_success(&self) -> bool {
        self.code == codes::OK
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}
