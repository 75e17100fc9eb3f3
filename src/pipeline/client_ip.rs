use super::guard::Guard;
use crate::context::AdmissionContext;
use crate::error::GatewayError;
use async_trait::async_trait;
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, HeaderName};
use std::net::{IpAddr, SocketAddr};

const FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Resolves the client address: trusted proxy header, then the first `X-Forwarded-For` hop,
/// then the peer address. Never rejects; an unresolvable address leaves the IP stages idle.
#[derive(Debug, Clone)]
pub struct ClientIpResolver {
    trusted_header: HeaderName,
}

impl ClientIpResolver {
    pub fn new(trusted_header: HeaderName) -> Self {
        Self { trusted_header }
    }

    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
        header_ip(headers, &self.trusted_header)
            .or_else(|| {
                headers
                    .get(&FORWARDED_FOR)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.split(',').next())
                    .and_then(parse_ip)
            })
            .or_else(|| peer.map(|addr| addr.ip()))
    }
}

impl Default for ClientIpResolver {
    fn default() -> Self {
        Self::new(HeaderName::from_static("x-real-ip"))
    }
}

fn header_ip(headers: &HeaderMap, name: &HeaderName) -> Option<IpAddr> {
    headers.get(name).and_then(|v| v.to_str().ok()).and_then(parse_ip)
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.parse::<IpAddr>().ok().or_else(|| raw.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

#[async_trait]
impl Guard for ClientIpResolver {
    fn name(&self) -> &'static str {
        "client_ip"
    }

    async fn check(&self, req: &mut Request) -> Result<(), GatewayError> {
        let peer = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0);
        match self.resolve(req.headers(), peer) {
            Some(ip) => AdmissionContext::of_mut(req).set_client_ip(ip),
            None => tracing::debug!("client address unresolved"),
        }
        Ok(())
    }
}
