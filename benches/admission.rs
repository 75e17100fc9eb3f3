use axum::body::Body;
use axum::http::Request;
use axum::routing::get;
use axum::Router;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tollgate::rate_limit::{BucketRule, InMemoryBucketStore, ScopeKey, TokenBucketLimiter};
use tollgate::{
    AdmissionPipeline, CircuitBreaker, CircuitBreakerConfig, GatewayConfig,
    StaticTokenAuthenticator,
};
use tower::ServiceExt;
use uuid::Uuid;

fn limiter_allow(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(InMemoryBucketStore::new());
    let limiter = TokenBucketLimiter::new(store, BucketRule::new(1e9, 1e9).unwrap());
    let scope = ScopeKey::ip(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)));

    c.bench_function("limiter_allow_in_memory", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(limiter.allow(black_box(&scope)).await);
        });
    });
}

fn breaker_execute(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config =
        CircuitBreakerConfig::new(5, 0.5, Duration::from_secs(45), 3, Duration::from_secs(15))
            .unwrap();
    let healthy = CircuitBreaker::new("bench", config.clone());
    let open = CircuitBreaker::new("bench-open", config);
    rt.block_on(async {
        for _ in 0..5 {
            let _ = open.execute(|| async { Err::<(), _>("down") }).await;
        }
    });

    c.bench_function("breaker_execute_closed", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(healthy.execute(|| async { Ok::<_, ()>(1u32) }).await);
        });
    });
    c.bench_function("breaker_execute_short_circuit", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(open.execute(|| async { Ok::<_, ()>(1u32) }).await);
        });
    });
}

fn full_pipeline(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = GatewayConfig {
        ip_burst: 1e9,
        ip_rate: 1e9,
        user_burst: 1e9,
        user_rate: 1e9,
        ..GatewayConfig::default()
    };
    let auth = StaticTokenAuthenticator::new().with_token("bench-token", Uuid::from_u128(1));
    let pipeline =
        AdmissionPipeline::new(config, Arc::new(InMemoryBucketStore::new()), Arc::new(auth))
            .unwrap();
    let app = Router::new()
        .route("/ping", get(|| async { "pong" }).layer(pipeline.route("/ping").build()))
        .layer(pipeline.layer());

    c.bench_function("admission_pipeline_admit", |b| {
        b.to_async(&rt).iter(|| async {
            let req = Request::builder()
                .uri("/ping")
                .header("authorization", "Bearer bench-token")
                .header("x-real-ip", "198.51.100.7")
                .body(Body::empty())
                .unwrap();
            black_box(app.clone().oneshot(req).await.unwrap());
        });
    });
}

criterion_group!(benches, limiter_allow, breaker_execute, full_pipeline);
criterion_main!(benches);
