use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use portway_control::{
    ControlError, ErrorKind, NewNode, NewRoute, NodeUpdate, RouteId, RouteStatus, RouteUpdate,
    StartOutcome, StopOutcome, Transition,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info};
use utoipa::IntoParams;

use crate::models::*;
use crate::AppState;

pub type ApiError = (StatusCode, Json<ApiResponse<EmptyData>>);
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

/// HTTP status for a control plane error category
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::ExternalEngine => StatusCode::BAD_GATEWAY,
        ErrorKind::Transport => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: ControlError) -> ApiError {
    let status = status_for(err.kind());
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        debug!("Request rejected: {}", err);
    }
    (
        status,
        Json(ApiResponse::error(status.as_u16(), err.to_string())),
    )
}

fn not_found(message: impl Into<String>) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error(StatusCode::NOT_FOUND.as_u16(), message)),
    )
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = ApiResponse<HealthResponse>)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        online_nodes: state.plane.registry.count(),
        active_tunnels: state.plane.orchestrator.active_count(),
    }))
}

// ============================================================================
// Nodes
// ============================================================================

/// Register a node
#[utoipa::path(
    post,
    path = "/api/nodes",
    request_body = RegisterNodeRequest,
    responses(
        (status = 201, description = "Node registered", body = ApiResponse<NodeView>),
        (status = 400, description = "Invalid node id or missing name", body = ApiResponse<EmptyData>),
        (status = 409, description = "Node id already taken", body = ApiResponse<EmptyData>)
    ),
    tag = "nodes"
)]
pub async fn register_node(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterNodeRequest>,
) -> Result<(StatusCode, Json<ApiResponse<NodeView>>), ApiError> {
    debug!("Registering node {:?} for owner {}", req.node_id, req.owner_id);

    let node = state
        .plane
        .nodes
        .register(NewNode {
            node_id: req.node_id,
            name: req.name,
            description: req.description,
            owner_id: req.owner_id,
            protocol: req.protocol.unwrap_or_default(),
            max_connections: req.max_connections,
        })
        .await
        .map_err(error_response)?;

    let mut body = ApiResponse::with_message("Node registered", NodeView::from_node(node, false));
    body.code = StatusCode::CREATED.as_u16();
    Ok((StatusCode::CREATED, Json(body)))
}

/// List all nodes
#[utoipa::path(
    get,
    path = "/api/nodes",
    responses(
        (status = 200, description = "All registered nodes", body = ApiResponse<Vec<NodeView>>)
    ),
    tag = "nodes"
)]
pub async fn list_nodes(State(state): State<Arc<AppState>>) -> ApiResult<Vec<NodeView>> {
    let nodes = state.plane.nodes.list().await.map_err(error_response)?;
    let views = nodes
        .into_iter()
        .map(|node| {
            let connected = state.plane.registry.is_connected(&node.node_id);
            NodeView::from_node(node, connected)
        })
        .collect();
    Ok(Json(ApiResponse::success(views)))
}

/// Get a node
#[utoipa::path(
    get,
    path = "/api/nodes/{node_id}",
    params(
        ("node_id" = String, Path, description = "Node ID")
    ),
    responses(
        (status = 200, description = "Node information", body = ApiResponse<NodeView>),
        (status = 404, description = "Node not found", body = ApiResponse<EmptyData>)
    ),
    tag = "nodes"
)]
pub async fn get_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> ApiResult<NodeView> {
    let node = state.plane.nodes.get(&node_id).await.map_err(error_response)?;
    let connected = state.plane.registry.is_connected(&node_id);
    Ok(Json(ApiResponse::success(NodeView::from_node(node, connected))))
}

/// Update a node's editable fields
#[utoipa::path(
    put,
    path = "/api/nodes/{node_id}",
    params(
        ("node_id" = String, Path, description = "Node ID")
    ),
    request_body = UpdateNodeRequest,
    responses(
        (status = 200, description = "Node updated", body = ApiResponse<NodeView>),
        (status = 404, description = "Node not found", body = ApiResponse<EmptyData>)
    ),
    tag = "nodes"
)]
pub async fn update_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    Json(req): Json<UpdateNodeRequest>,
) -> ApiResult<NodeView> {
    let node = state
        .plane
        .nodes
        .update(
            &node_id,
            NodeUpdate {
                name: req.name,
                description: req.description,
                protocol: req.protocol,
                max_connections: req.max_connections,
            },
        )
        .await
        .map_err(error_response)?;
    let connected = state.plane.registry.is_connected(&node_id);
    Ok(Json(ApiResponse::with_message(
        "Node updated",
        NodeView::from_node(node, connected),
    )))
}

/// Unregister a node, closing its channel
#[utoipa::path(
    delete,
    path = "/api/nodes/{node_id}",
    params(
        ("node_id" = String, Path, description = "Node ID")
    ),
    responses(
        (status = 200, description = "Node unregistered", body = ApiResponse<EmptyData>),
        (status = 404, description = "Node not found", body = ApiResponse<EmptyData>),
        (status = 409, description = "Node still has routes", body = ApiResponse<EmptyData>)
    ),
    tag = "nodes"
)]
pub async fn delete_node(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> ApiResult<EmptyData> {
    state
        .plane
        .nodes
        .unregister(&node_id)
        .await
        .map_err(error_response)?;
    Ok(Json(ApiResponse::ok("Node unregistered")))
}

/// Heartbeat for nodes that report over HTTP
#[utoipa::path(
    post,
    path = "/api/nodes/{node_id}/heartbeat",
    params(
        ("node_id" = String, Path, description = "Node ID")
    ),
    responses(
        (status = 200, description = "Heartbeat recorded", body = ApiResponse<HeartbeatView>),
        (status = 404, description = "Node not found", body = ApiResponse<EmptyData>)
    ),
    tag = "nodes"
)]
pub async fn node_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> ApiResult<HeartbeatView> {
    let transition = state
        .plane
        .liveness
        .record_heartbeat(&node_id)
        .await
        .map_err(error_response)?;
    if transition == Transition::UnknownNode {
        return Err(error_response(ControlError::NodeNotFound(node_id)));
    }
    Ok(Json(ApiResponse::success(HeartbeatView {
        node_id,
        transition: transition.as_str().to_string(),
    })))
}

/// Latest telemetry snapshot of a node
#[utoipa::path(
    get,
    path = "/api/nodes/{node_id}/telemetry",
    params(
        ("node_id" = String, Path, description = "Node ID")
    ),
    responses(
        (status = 200, description = "Latest telemetry", body = ApiResponse<NodeStatusView>),
        (status = 404, description = "Node not found or no telemetry yet", body = ApiResponse<EmptyData>)
    ),
    tag = "nodes"
)]
pub async fn node_telemetry(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> ApiResult<NodeStatusView> {
    state.plane.nodes.get(&node_id).await.map_err(error_response)?;
    let latest = state
        .plane
        .statuses
        .latest_status(&node_id)
        .await
        .map_err(|e| error_response(e.into()))?;

    match latest {
        Some(snapshot) => Ok(Json(ApiResponse::success(snapshot.into()))),
        None => Err(not_found(format!("No telemetry reported by node {}", node_id))),
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// Number of snapshots, newest first (default 20, max 500)
    pub limit: Option<usize>,
}

/// Recent telemetry snapshots of a node
#[utoipa::path(
    get,
    path = "/api/nodes/{node_id}/telemetry/history",
    params(
        ("node_id" = String, Path, description = "Node ID"),
        HistoryQuery
    ),
    responses(
        (status = 200, description = "Telemetry history, newest first", body = ApiResponse<Vec<NodeStatusView>>),
        (status = 404, description = "Node not found", body = ApiResponse<EmptyData>)
    ),
    tag = "nodes"
)]
pub async fn node_telemetry_history(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<NodeStatusView>> {
    state.plane.nodes.get(&node_id).await.map_err(error_response)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let history = state
        .plane
        .statuses
        .status_history(&node_id, limit)
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(ApiResponse::success(
        history.into_iter().map(NodeStatusView::from).collect(),
    )))
}

// ============================================================================
// Routes
// ============================================================================

/// Create a route; the remote port is allocated unless one is requested
#[utoipa::path(
    post,
    path = "/api/routes",
    request_body = CreateRouteRequest,
    responses(
        (status = 201, description = "Route created", body = ApiResponse<RouteView>),
        (status = 400, description = "Invalid route", body = ApiResponse<EmptyData>),
        (status = 404, description = "Node not found", body = ApiResponse<EmptyData>),
        (status = 409, description = "Port in use, range exhausted or duplicate local endpoint", body = ApiResponse<EmptyData>)
    ),
    tag = "routes"
)]
pub async fn create_route(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRouteRequest>,
) -> Result<(StatusCode, Json<ApiResponse<RouteView>>), ApiError> {
    debug!(
        "Creating route {}:{} on node {}",
        req.local_ip, req.local_port, req.node_id
    );

    let route = state
        .plane
        .routes
        .create(NewRoute {
            name: req.name,
            description: req.description,
            node_id: req.node_id,
            local_ip: req.local_ip,
            local_port: req.local_port,
            remote_port: req.remote_port,
            protocol: req.protocol.unwrap_or_default(),
            max_connections: req.max_connections,
        })
        .await
        .map_err(error_response)?;

    let mut body = ApiResponse::with_message("Route created", RouteView::from(route));
    body.code = StatusCode::CREATED.as_u16();
    Ok((StatusCode::CREATED, Json(body)))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RouteListQuery {
    /// Only routes of this node
    pub node_id: Option<String>,
}

/// List routes
#[utoipa::path(
    get,
    path = "/api/routes",
    params(RouteListQuery),
    responses(
        (status = 200, description = "Routes", body = ApiResponse<Vec<RouteView>>)
    ),
    tag = "routes"
)]
pub async fn list_routes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RouteListQuery>,
) -> ApiResult<Vec<RouteView>> {
    let routes = match query.node_id {
        Some(node_id) => state.plane.routes.list_for_node(&node_id).await,
        None => state.plane.routes.list().await,
    }
    .map_err(error_response)?;
    Ok(Json(ApiResponse::success(
        routes.into_iter().map(RouteView::from).collect(),
    )))
}

/// Get a route
#[utoipa::path(
    get,
    path = "/api/routes/{id}",
    params(
        ("id" = i64, Path, description = "Route ID")
    ),
    responses(
        (status = 200, description = "Route", body = ApiResponse<RouteView>),
        (status = 404, description = "Route not found", body = ApiResponse<EmptyData>)
    ),
    tag = "routes"
)]
pub async fn get_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RouteId>,
) -> ApiResult<RouteView> {
    let route = state.plane.routes.get(id).await.map_err(error_response)?;
    Ok(Json(ApiResponse::success(route.into())))
}

/// Update a route's editable fields
#[utoipa::path(
    put,
    path = "/api/routes/{id}",
    params(
        ("id" = i64, Path, description = "Route ID")
    ),
    request_body = UpdateRouteRequest,
    responses(
        (status = 200, description = "Route updated", body = ApiResponse<RouteView>),
        (status = 404, description = "Route not found", body = ApiResponse<EmptyData>)
    ),
    tag = "routes"
)]
pub async fn update_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RouteId>,
    Json(req): Json<UpdateRouteRequest>,
) -> ApiResult<RouteView> {
    let route = state
        .plane
        .routes
        .update(
            id,
            RouteUpdate {
                name: req.name,
                description: req.description,
                max_connections: req.max_connections,
            },
        )
        .await
        .map_err(error_response)?;
    Ok(Json(ApiResponse::with_message("Route updated", route.into())))
}

/// Delete a route, stopping its tunnel first
#[utoipa::path(
    delete,
    path = "/api/routes/{id}",
    params(
        ("id" = i64, Path, description = "Route ID")
    ),
    responses(
        (status = 200, description = "Route deleted", body = ApiResponse<EmptyData>),
        (status = 404, description = "Route not found", body = ApiResponse<EmptyData>),
        (status = 502, description = "Engine refused to stop the tunnel", body = ApiResponse<EmptyData>)
    ),
    tag = "routes"
)]
pub async fn delete_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RouteId>,
) -> ApiResult<EmptyData> {
    state.plane.routes.delete(id).await.map_err(error_response)?;
    Ok(Json(ApiResponse::ok("Route deleted")))
}

/// Add traffic reported by a node to a route's totals
#[utoipa::path(
    post,
    path = "/api/routes/{id}/stats",
    params(
        ("id" = i64, Path, description = "Route ID")
    ),
    request_body = RouteStatsRequest,
    responses(
        (status = 200, description = "Totals updated", body = ApiResponse<RouteView>),
        (status = 404, description = "Route not found", body = ApiResponse<EmptyData>)
    ),
    tag = "routes"
)]
pub async fn record_route_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RouteId>,
    Json(req): Json<RouteStatsRequest>,
) -> ApiResult<RouteView> {
    let route = state
        .plane
        .routes
        .record_traffic(id, req.bytes_in, req.bytes_out)
        .await
        .map_err(error_response)?;
    Ok(Json(ApiResponse::success(route.into())))
}

// ============================================================================
// Tunnels
// ============================================================================

/// Start the tunnel of a route
#[utoipa::path(
    post,
    path = "/api/tunnels/{route_id}/start",
    params(
        ("route_id" = i64, Path, description = "Route ID")
    ),
    responses(
        (status = 200, description = "Tunnel started or already running", body = ApiResponse<TunnelBindingView>),
        (status = 404, description = "Route not found", body = ApiResponse<EmptyData>),
        (status = 409, description = "Another operation is in flight for this route", body = ApiResponse<EmptyData>),
        (status = 502, description = "Engine failure", body = ApiResponse<EmptyData>)
    ),
    tag = "tunnels"
)]
pub async fn start_tunnel(
    State(state): State<Arc<AppState>>,
    Path(route_id): Path<RouteId>,
) -> ApiResult<TunnelBindingView> {
    let orchestrator = &state.plane.orchestrator;
    match orchestrator.start(route_id).await.map_err(error_response)? {
        StartOutcome::Started(binding) => {
            info!(route_id, tunnel_id = %binding.tunnel_id, "Tunnel started via API");
            Ok(Json(ApiResponse::with_message(
                "Tunnel started",
                binding.into(),
            )))
        }
        StartOutcome::AlreadyRunning => {
            let body = match orchestrator.binding(route_id) {
                Some(binding) => ApiResponse::with_message("Tunnel already running", binding.into()),
                None => ApiResponse::ok("Tunnel already running"),
            };
            Ok(Json(body))
        }
    }
}

/// Stop the tunnel of a route
#[utoipa::path(
    post,
    path = "/api/tunnels/{route_id}/stop",
    params(
        ("route_id" = i64, Path, description = "Route ID")
    ),
    responses(
        (status = 200, description = "Tunnel stopped or not running", body = ApiResponse<TunnelBindingView>),
        (status = 404, description = "Route not found", body = ApiResponse<EmptyData>),
        (status = 502, description = "Engine refused the stop; the tunnel stays bound", body = ApiResponse<EmptyData>)
    ),
    tag = "tunnels"
)]
pub async fn stop_tunnel(
    State(state): State<Arc<AppState>>,
    Path(route_id): Path<RouteId>,
) -> ApiResult<TunnelBindingView> {
    state.plane.routes.get(route_id).await.map_err(error_response)?;
    match state
        .plane
        .orchestrator
        .stop(route_id)
        .await
        .map_err(error_response)?
    {
        StopOutcome::Stopped(binding) => Ok(Json(ApiResponse::with_message(
            "Tunnel stopped",
            binding.into(),
        ))),
        StopOutcome::NotRunning => Ok(Json(ApiResponse::ok("Tunnel not running"))),
    }
}

/// Engine status of a route's tunnel
#[utoipa::path(
    get,
    path = "/api/tunnels/{route_id}/status",
    params(
        ("route_id" = i64, Path, description = "Route ID")
    ),
    responses(
        (status = 200, description = "Tunnel status", body = ApiResponse<TunnelStatusView>),
        (status = 404, description = "Route not found", body = ApiResponse<EmptyData>),
        (status = 502, description = "Engine failure", body = ApiResponse<EmptyData>)
    ),
    tag = "tunnels"
)]
pub async fn tunnel_status(
    State(state): State<Arc<AppState>>,
    Path(route_id): Path<RouteId>,
) -> ApiResult<TunnelStatusView> {
    state.plane.routes.get(route_id).await.map_err(error_response)?;
    let orchestrator = &state.plane.orchestrator;
    let view = match orchestrator.status(route_id).await.map_err(error_response)? {
        Some(status) => {
            let tunnel_id = orchestrator.binding(route_id).map(|b| b.tunnel_id);
            TunnelStatusView::from_engine(route_id, tunnel_id, status)
        }
        None => TunnelStatusView::not_running(route_id),
    };
    Ok(Json(ApiResponse::success(view)))
}

/// Traffic counters of a route's tunnel
///
/// Falls back to the stored route totals when no tunnel is bound.
#[utoipa::path(
    get,
    path = "/api/tunnels/{route_id}/traffic",
    params(
        ("route_id" = i64, Path, description = "Route ID")
    ),
    responses(
        (status = 200, description = "Traffic counters", body = ApiResponse<TrafficView>),
        (status = 404, description = "Route not found", body = ApiResponse<EmptyData>),
        (status = 502, description = "Engine failure", body = ApiResponse<EmptyData>)
    ),
    tag = "tunnels"
)]
pub async fn tunnel_traffic(
    State(state): State<Arc<AppState>>,
    Path(route_id): Path<RouteId>,
) -> ApiResult<TrafficView> {
    let route = state.plane.routes.get(route_id).await.map_err(error_response)?;
    let stats = state
        .plane
        .orchestrator
        .traffic_stats(route_id)
        .await
        .map_err(error_response)?;

    let view = match stats {
        Some(stats) => TrafficView::from_stats(route_id, stats),
        None => TrafficView {
            route_id,
            bytes_in: route.total_bytes_in,
            bytes_out: route.total_bytes_out,
            total_bytes: route.total_bytes_in.saturating_add(route.total_bytes_out),
            request_count: 0,
            last_activity: route
                .last_used_at
                .map(|t| t.timestamp_millis())
                .unwrap_or(0),
        },
    };
    Ok(Json(ApiResponse::success(view)))
}

// ============================================================================
// Stats
// ============================================================================

/// Tunnel and route counters
#[utoipa::path(
    get,
    path = "/api/stats/tunnels",
    responses(
        (status = 200, description = "Tunnel counters", body = ApiResponse<TunnelStatsView>)
    ),
    tag = "stats"
)]
pub async fn tunnel_stats(State(state): State<Arc<AppState>>) -> ApiResult<TunnelStatsView> {
    let routes = state.plane.routes.list().await.map_err(error_response)?;
    let active_routes = routes
        .iter()
        .filter(|r| r.status == RouteStatus::Active)
        .count();
    Ok(Json(ApiResponse::success(TunnelStatsView {
        active_tunnels: state.plane.orchestrator.active_count(),
        total_routes: routes.len(),
        active_routes,
    })))
}

/// Number of nodes with an attached channel
#[utoipa::path(
    get,
    path = "/api/stats/online-nodes",
    responses(
        (status = 200, description = "Online node count", body = ApiResponse<OnlineCountView>)
    ),
    tag = "stats"
)]
pub async fn online_nodes(State(state): State<Arc<AppState>>) -> ApiResult<OnlineCountView> {
    Ok(Json(ApiResponse::success(OnlineCountView {
        online_nodes: state.plane.nodes.online_count(),
    })))
}
