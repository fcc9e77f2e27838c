//! Helpers shared by the API integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use portway_api::{ApiServer, ApiServerConfig, RateLimitConfig};
use portway_control::{ControlPlane, ControlPlaneConfig, PortRange};
use portway_engine::{
    CreateTunnelRequest, EngineError, EngineTunnel, EngineTunnelStatus, TrafficStats,
    TunnelEngine,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt; // For `oneshot` method

pub const NODE: &str = "node_test123456789";

/// Engine that hands out `t1`, `t2`, ...
#[derive(Default)]
pub struct StubEngine {
    pub creates: AtomicUsize,
    pub deletes: Mutex<Vec<String>>,
    pub fail_create: AtomicBool,
}

impl StubEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TunnelEngine for StubEngine {
    async fn create_tunnel(
        &self,
        _request: CreateTunnelRequest,
    ) -> Result<EngineTunnel, EngineError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::Status {
                status: 500,
                body: "engine down".into(),
            });
        }
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(EngineTunnel {
            tunnel_id: format!("t{}", n),
            public_url: Some(format!("https://t{}.example", n)),
            status: "active".into(),
            message: None,
            public_port: None,
        })
    }

    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<bool, EngineError> {
        self.deletes.lock().unwrap().push(tunnel_id.to_string());
        Ok(true)
    }

    async fn tunnel_status(&self, tunnel_id: &str) -> Result<EngineTunnelStatus, EngineError> {
        Ok(EngineTunnelStatus {
            tunnel_id: Some(tunnel_id.to_string()),
            status: "active".into(),
            connections: 3,
            uptime: 120,
        })
    }

    async fn traffic_stats(&self, tunnel_id: &str) -> Result<TrafficStats, EngineError> {
        Ok(TrafficStats {
            tunnel_id: Some(tunnel_id.to_string()),
            bytes_in: 2048,
            bytes_out: 512,
            request_count: 7,
            last_activity: 1_700_000_000_000,
        })
    }

    async fn health(&self) -> Result<bool, EngineError> {
        Ok(true)
    }
}

/// Router over an in-memory control plane, rate limiting disabled
pub fn test_app(engine: Arc<StubEngine>) -> (Router, ControlPlane) {
    test_app_with_limits(
        engine,
        RateLimitConfig {
            enabled: false,
            ..Default::default()
        },
    )
}

pub fn test_app_with_limits(
    engine: Arc<StubEngine>,
    rate_limit: RateLimitConfig,
) -> (Router, ControlPlane) {
    let plane = ControlPlane::in_memory(
        engine,
        ControlPlaneConfig {
            port_range: PortRange::new(10000, 20000).unwrap(),
            ..Default::default()
        },
    );
    let config = ApiServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(), // Random port
        enable_cors: false,
        rate_limit,
    };
    let server = ApiServer::new(config, plane.clone());
    (server.build_router(), plane)
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .body(Body::empty())
        .unwrap()
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub async fn register_node(app: &Router) -> Value {
    let response = send(
        app,
        json_request(
            "POST",
            "/api/nodes",
            serde_json::json!({ "nodeId": NODE, "name": "edge", "ownerId": 42 }),
        ),
    )
    .await;
    body_json(response).await
}

pub async fn create_route(app: &Router, local_port: u16) -> Value {
    let response = send(
        app,
        json_request(
            "POST",
            "/api/routes",
            serde_json::json!({
                "name": format!("svc-{}", local_port),
                "nodeId": NODE,
                "localIp": "127.0.0.1",
                "localPort": local_port,
            }),
        ),
    )
    .await;
    body_json(response).await
}
