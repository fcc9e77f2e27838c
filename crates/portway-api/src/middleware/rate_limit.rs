//! Rate limiting middleware
//!
//! Classifies each request by path, charges one token from the caller's
//! bucket and rejects with 429 once the bucket is empty.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use crate::models::ApiResponse;
use crate::rate_limit::{classify, RateLimiter};

pub const REMAINING_HEADER: &str = "x-rate-limit-remaining";
pub const RETRY_AFTER_SECONDS_HEADER: &str = "x-rate-limit-retry-after-seconds";

/// Caller identity: first `X-Forwarded-For` entry, then `X-Real-IP`, then the peer address
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn enforce_rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    if !limiter.is_enabled() {
        return next.run(request).await;
    }
    let Some(class) = classify(request.uri().path()) else {
        return next.run(request).await;
    };

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = client_identity(request.headers(), peer);
    let admission = limiter.admit(&identity, class);

    if !admission.allowed {
        let retry_after = admission.retry_after_secs();
        warn!(
            identity = %identity,
            class = class.as_str(),
            path = %request.uri().path(),
            retry_after,
            "Request rejected by rate limiter"
        );
        let body = ApiResponse::error(
            StatusCode::TOO_MANY_REQUESTS.as_u16(),
            format!("Too many requests, retry after {} seconds", retry_after),
        );
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(REMAINING_HEADER, HeaderValue::from(0u32));
        headers.insert(RETRY_AFTER_SECONDS_HEADER, HeaderValue::from(retry_after));
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(REMAINING_HEADER, HeaderValue::from(admission.remaining));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        assert_eq!(client_identity(&headers, Some(peer)), "203.0.113.7");

        headers.remove("x-forwarded-for");
        assert_eq!(client_identity(&headers, Some(peer)), "198.51.100.2");

        headers.remove("x-real-ip");
        assert_eq!(client_identity(&headers, Some(peer)), "127.0.0.1");
        assert_eq!(client_identity(&headers, None), "unknown");
    }
}
