//! Demo gateway on 127.0.0.1:3000.
//!
//! ```text
//! curl -H 'Authorization: Bearer alice-token' localhost:3000/v1/profile
//! curl -X POST -H 'Authorization: Bearer alice-token' \
//!      localhost:3000/v1/friends/00000000-0000-0000-0000-00000000000b
//! curl -H 'X-Real-IP: 203.0.113.66' localhost:3000/v1/profile   # blacklisted: 403
//! ```
//!
//! Pass a JSON config path as the first argument to override defaults.

use std::net::SocketAddr;
use std::sync::Arc;
use tollgate::rate_limit::InMemoryBucketStore;
use tollgate::telemetry::LogSink;
use tollgate::{AdmissionPipeline, GatewayConfig, StaticTokenAuthenticator, Telemetry};
use tollgate_cookbook::{demo_router, executor_from_config, FakeDownstream};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tollgate=debug")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::from_path(path)?,
        None => GatewayConfig::default(),
    };
    let telemetry = Telemetry::spawn(LogSink, config.telemetry_buffer);

    let store = InMemoryBucketStore::new();
    store.add_member(&config.blacklist_key, "203.0.113.66");

    let alice = Uuid::from_u128(0xa);
    let bob = Uuid::from_u128(0xb);
    let authenticator = StaticTokenAuthenticator::new()
        .with_token("alice-token", alice)
        .with_token("bob-token", bob);
    let downstream = FakeDownstream::new().with_profile(alice, "Alice").with_profile(bob, "Bob");

    let pipeline = AdmissionPipeline::new(config.clone(), Arc::new(store), Arc::new(authenticator))?
        .with_telemetry(telemetry.clone());
    let executor = executor_from_config(&config, telemetry)?;
    let app = demo_router(&pipeline, executor, downstream);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    tracing::info!(addr = %listener.local_addr()?, "gateway listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
