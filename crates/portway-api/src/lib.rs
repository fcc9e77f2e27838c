//! HTTP and WebSocket surface of the relay
//!
//! Exposes node, route and tunnel management over a JSON REST API, the
//! `/ws/node` control channel, and rate limiting in front of both.

pub mod handlers;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod ws;

use axum::{
    http::{header, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Json, Router,
};
use portway_control::ControlPlane;
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use utoipa::OpenApi;

pub use rate_limit::{Admission, BucketClass, BucketLimit, RateLimitConfig, RateLimiter};

/// Application state shared across handlers
pub struct AppState {
    pub plane: ControlPlane,
    pub limiter: Arc<RateLimiter>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Portway API",
        version = "0.1.0",
        description = "REST API for managing relay nodes, port routes and their tunnels",
        contact(
            name = "Portway Team",
            email = "team@portway.dev"
        )
    ),
    paths(
        handlers::health_check,
        handlers::register_node,
        handlers::list_nodes,
        handlers::get_node,
        handlers::update_node,
        handlers::delete_node,
        handlers::node_heartbeat,
        handlers::node_telemetry,
        handlers::node_telemetry_history,
        handlers::create_route,
        handlers::list_routes,
        handlers::get_route,
        handlers::update_route,
        handlers::delete_route,
        handlers::record_route_stats,
        handlers::start_tunnel,
        handlers::stop_tunnel,
        handlers::tunnel_status,
        handlers::tunnel_traffic,
        handlers::tunnel_stats,
        handlers::online_nodes,
    ),
    components(
        schemas(
            portway_proto::Protocol,
            models::EmptyData,
            models::HealthResponse,
            models::RegisterNodeRequest,
            models::UpdateNodeRequest,
            models::NodeView,
            models::HeartbeatView,
            models::NodeStatusView,
            models::CreateRouteRequest,
            models::UpdateRouteRequest,
            models::RouteStatsRequest,
            models::RouteView,
            models::TunnelBindingView,
            models::TunnelStatusView,
            models::TrafficView,
            models::TunnelStatsView,
            models::OnlineCountView,
        )
    ),
    tags(
        (name = "nodes", description = "Node registration and telemetry"),
        (name = "routes", description = "Port route management"),
        (name = "tunnels", description = "Tunnel lifecycle against the engine"),
        (name = "stats", description = "Aggregate counters"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable permissive CORS (for browser dashboards)
    pub enable_cors: bool,
    pub rate_limit: RateLimitConfig,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enable_cors: true,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, plane: ControlPlane) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let state = Arc::new(AppState { plane, limiter });
        Self { config, state }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Shared limiter, for scheduling bucket GC
    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.state.limiter.clone()
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/openapi.json", get(openapi_json))
            .route(
                "/api/nodes",
                get(handlers::list_nodes).post(handlers::register_node),
            )
            .route(
                "/api/nodes/{node_id}",
                get(handlers::get_node)
                    .put(handlers::update_node)
                    .delete(handlers::delete_node),
            )
            .route(
                "/api/nodes/{node_id}/heartbeat",
                post(handlers::node_heartbeat),
            )
            .route(
                "/api/nodes/{node_id}/telemetry",
                get(handlers::node_telemetry),
            )
            .route(
                "/api/nodes/{node_id}/telemetry/history",
                get(handlers::node_telemetry_history),
            )
            .route(
                "/api/routes",
                get(handlers::list_routes).post(handlers::create_route),
            )
            .route(
                "/api/routes/{id}",
                get(handlers::get_route)
                    .put(handlers::update_route)
                    .delete(handlers::delete_route),
            )
            .route("/api/routes/{id}/stats", post(handlers::record_route_stats))
            .route(
                "/api/tunnels/{route_id}/start",
                post(handlers::start_tunnel),
            )
            .route("/api/tunnels/{route_id}/stop", post(handlers::stop_tunnel))
            .route(
                "/api/tunnels/{route_id}/status",
                get(handlers::tunnel_status),
            )
            .route(
                "/api/tunnels/{route_id}/traffic",
                get(handlers::tunnel_traffic),
            )
            .route("/api/stats/tunnels", get(handlers::tunnel_stats))
            .route("/api/stats/online-nodes", get(handlers::online_nodes))
            .route("/ws/node", get(ws::node_socket))
            .with_state(self.state.clone());

        let mut router = api_router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .allow_origin(Any);
            router = router.layer(cors);
        }

        // Outermost, so rejected requests never reach a handler
        router.layer(axum_middleware::from_fn_with_state(
            self.state.limiter.clone(),
            middleware::enforce_rate_limit,
        ))
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );
        info!("Node channel: ws://{}/ws/node", self.config.bind_addr);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        info!("API server stopped");
        Ok(())
    }
}
