//! Caller identity from proxy headers and the socket

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

/// Get the real client IP address, checking proxy headers first
/// Priority: X-Real-IP > X-Forwarded-For (first IP) > ConnectInfo
pub fn real_ip(headers: &HeaderMap, fallback: Option<IpAddr>) -> Option<IpAddr> {
    // Set by Caddy/nginx
    if let Some(ip) = header_str(headers, "x-real-ip").and_then(parse_ip) {
        return Some(ip);
    }

    // May contain a chain of IPs, first is the original client
    if let Some(ip) = header_str(headers, "x-forwarded-for")
        .and_then(|ips| ips.split(',').next())
        .and_then(parse_ip)
    {
        return Some(ip);
    }

    fallback
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}

/// What the request itself says about the visitor
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let socket_ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        Ok(ClientInfo {
            ip: real_ip(&parts.headers, socket_ip),
            user_agent: header_str(&parts.headers, header::USER_AGENT.as_str())
                .map(|ua| ua.to_string())
                .filter(|ua| !ua.is_empty()),
        })
    }
}
