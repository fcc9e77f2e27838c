//! Rate limiting through the full middleware stack

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::*;
use portway_api::{BucketLimit, RateLimitConfig};

fn limited(capacity: u32) -> RateLimitConfig {
    RateLimitConfig {
        enabled: true,
        api: BucketLimit::new(capacity, 60),
        ..Default::default()
    }
}

fn from_client(uri: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method("GET")
        .header("x-forwarded-for", ip)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_capacity_admitted_then_rejected() {
    let (app, _plane) = test_app_with_limits(StubEngine::new(), limited(3));

    for expected_remaining in ["2", "1", "0"] {
        let response = send(&app, from_client("/api/nodes", "203.0.113.9")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["x-rate-limit-remaining"],
            expected_remaining
        );
    }

    let response = send(&app, from_client("/api/nodes", "203.0.113.9")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["x-rate-limit-remaining"], "0");

    let retry_after: u64 = response.headers()["x-rate-limit-retry-after-seconds"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(
        response.headers()["retry-after"],
        response.headers()["x-rate-limit-retry-after-seconds"]
    );

    let body = body_json(response).await;
    assert_eq!(body["code"], 429);
    assert!(body["data"].is_null());
}

#[tokio::test]
async fn test_clients_have_separate_buckets() {
    let (app, _plane) = test_app_with_limits(StubEngine::new(), limited(1));

    let response = send(&app, from_client("/api/nodes", "198.51.100.1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = send(&app, from_client("/api/nodes", "198.51.100.1")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = send(&app, from_client("/api/nodes", "198.51.100.2")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_and_openapi_are_exempt() {
    let (app, _plane) = test_app_with_limits(StubEngine::new(), limited(1));

    for _ in 0..5 {
        let response = send(&app, from_client("/api/health", "192.0.2.1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-rate-limit-remaining").is_none());

        let response = send(&app, from_client("/api/openapi.json", "192.0.2.1")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    // The API bucket is still full
    let response = send(&app, from_client("/api/nodes", "192.0.2.1")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_websocket_path_uses_its_own_bucket() {
    let (app, _plane) = test_app_with_limits(
        StubEngine::new(),
        RateLimitConfig {
            enabled: true,
            api: BucketLimit::new(1, 60),
            websocket: BucketLimit::new(1, 60),
            ..Default::default()
        },
    );

    // Not an upgrade request, so the handler refuses it, but the token is spent
    let response = send(&app, from_client("/ws/node", "192.0.2.7")).await;
    assert_ne!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let response = send(&app, from_client("/ws/node", "192.0.2.7")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = send(&app, from_client("/api/nodes", "192.0.2.7")).await;
    assert_eq!(response.status(), StatusCode::OK);
}
