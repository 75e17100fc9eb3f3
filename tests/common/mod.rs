#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::Request;
use axum::response::Response;
use axum::routing;
use axum::Router;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tollgate::rate_limit::{BucketStore, InMemoryBucketStore, StoreError, TakeRequest};
use tollgate::{
    AdmissionContext, AdmissionPipeline, Envelope, GatewayConfig, ManualClock,
    StaticTokenAuthenticator,
};
use tower::ServiceExt;
use uuid::Uuid;

pub const ALICE: Uuid = Uuid::from_u128(0xa);
pub const BOB: Uuid = Uuid::from_u128(0xb);
pub const BANNED_IP: &str = "203.0.113.66";

pub fn authenticator() -> Arc<StaticTokenAuthenticator> {
    Arc::new(
        StaticTokenAuthenticator::new()
            .with_token("alice-token", ALICE)
            .with_token("bob-token", BOB),
    )
}

pub fn pipeline(config: GatewayConfig, store: Arc<dyn BucketStore>, clock: ManualClock) -> AdmissionPipeline {
    AdmissionPipeline::new(config, store, authenticator()).unwrap().with_clock(clock)
}

/// `/whoami` behind the shared stages plus a route layer; `/sensitive` uses the sensitive bucket.
pub fn router(pipeline: &AdmissionPipeline) -> Router {
    Router::new()
        .route("/whoami", routing::get(whoami).layer(pipeline.route("/whoami").build()))
        .route("/sensitive", routing::get(whoami).layer(pipeline.route("/sensitive").sensitive().build()))
        .layer(pipeline.layer())
}

async fn whoami(ctx: AdmissionContext) -> Envelope<String> {
    let user = ctx.subject().map(|s| s.user_id.to_string()).unwrap_or_default();
    Envelope::ok(user)
}

pub fn get(uri: &str, token: Option<&str>, ip: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    if let Some(ip) = ip {
        builder = builder.header("x-real-ip", ip);
    }
    builder.body(Body::empty()).unwrap()
}

pub async fn send(app: &Router, req: Request<Body>) -> Response {
    app.clone().oneshot(req).await.unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn blacklisting_store(config: &GatewayConfig) -> InMemoryBucketStore {
    let store = InMemoryBucketStore::new();
    store.add_member(&config.blacklist_key, BANNED_IP);
    store
}

/// Store whose every call fails, counting attempts.
#[derive(Debug, Default)]
pub struct BrokenStore {
    pub calls: AtomicUsize,
}

#[async_trait]
impl BucketStore for BrokenStore {
    async fn take(&self, _key: &str, _req: TakeRequest) -> Result<bool, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn is_member(&self, _set_key: &str, _member: &str) -> Result<bool, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".into()))
    }
}
