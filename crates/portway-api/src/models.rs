use chrono::{DateTime, Utc};
use portway_control::{
    Node, NodeState, NodeStatusSnapshot, Route, RouteId, RouteStatus, TunnelBinding,
};
use portway_engine::{EngineTunnelStatus, TrafficStats};
use portway_proto::Protocol;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Uniform response envelope
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse<T> {
    /// HTTP status code mirrored in the body
    pub code: u16,
    pub message: String,
    pub data: Option<T>,
    /// Epoch milliseconds
    pub timestamp: i64,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self::with_message("success", data)
    }

    pub fn with_message(message: impl Into<String>, data: T) -> Self {
        Self {
            code: 200,
            message: message.into(),
            data: Some(data),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Successful response carrying only a message
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            code: 200,
            message: message.into(),
            data: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

impl ApiResponse<EmptyData> {
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Placeholder payload for responses without data
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EmptyData {}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub online_nodes: usize,
    pub active_tunnels: usize,
}

/// Request to register a node
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterNodeRequest {
    /// Generated when omitted
    #[serde(default)]
    pub node_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub owner_id: i64,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateNodeRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub protocol: Option<Protocol>,
    pub max_connections: Option<u32>,
}

/// Node as exposed over HTTP
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub node_id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: i64,
    pub protocol: Protocol,
    /// ONLINE, OFFLINE or ERROR
    pub status: String,
    /// Whether a channel is currently attached
    pub connected: bool,
    pub max_connections: u32,
    pub current_connections: u32,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub client_addr: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeView {
    pub fn from_node(node: Node, connected: bool) -> Self {
        let status = match node.state {
            NodeState::Online => "ONLINE",
            NodeState::Offline => "OFFLINE",
            NodeState::Error => "ERROR",
        };
        Self {
            node_id: node.node_id,
            name: node.name,
            description: node.description,
            owner_id: node.owner_id,
            protocol: node.protocol,
            status: status.to_string(),
            connected,
            max_connections: node.max_connections,
            current_connections: node.current_connections,
            total_bytes_in: node.total_bytes_in,
            total_bytes_out: node.total_bytes_out,
            client_addr: node.client_addr,
            last_heartbeat: node.last_heartbeat,
            created_at: node.created_at,
            updated_at: node.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatView {
    pub node_id: String,
    /// Liveness transition caused by this heartbeat
    pub transition: String,
}

/// Latest telemetry reported by a node
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusView {
    pub node_id: String,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub disk_usage: Option<f64>,
    pub network_in: Option<u64>,
    pub network_out: Option<u64>,
    pub connection_count: Option<u32>,
    pub uptime: Option<u64>,
    pub load_average: Option<f64>,
    pub temperature: Option<f64>,
    pub ping_latency: Option<u32>,
    pub bandwidth_in: Option<u64>,
    pub bandwidth_out: Option<u64>,
    pub error_count: u32,
    pub warning_count: u32,
    pub recorded_at: DateTime<Utc>,
}

impl From<NodeStatusSnapshot> for NodeStatusView {
    fn from(s: NodeStatusSnapshot) -> Self {
        Self {
            node_id: s.node_id,
            cpu_usage: s.cpu_usage,
            memory_usage: s.memory_usage,
            disk_usage: s.disk_usage,
            network_in: s.network_in,
            network_out: s.network_out,
            connection_count: s.connection_count,
            uptime: s.uptime,
            load_average: s.load_average,
            temperature: s.temperature,
            ping_latency: s.ping_latency,
            bandwidth_in: s.bandwidth_in,
            bandwidth_out: s.bandwidth_out,
            error_count: s.error_count,
            warning_count: s.warning_count,
            recorded_at: s.recorded_at,
        }
    }
}

/// Request to create a route
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateRouteRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub node_id: String,
    pub local_ip: String,
    pub local_port: u16,
    /// Allocated from the configured range when omitted
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateRouteRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub max_connections: Option<u32>,
}

/// Traffic reported for a route outside the engine
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatsRequest {
    #[serde(default)]
    pub bytes_in: u64,
    #[serde(default)]
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteView {
    pub id: RouteId,
    pub name: String,
    pub description: Option<String>,
    pub node_id: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: Protocol,
    /// ACTIVE, INACTIVE or ERROR
    pub status: String,
    pub max_connections: u32,
    pub current_connections: u32,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub public_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<Route> for RouteView {
    fn from(route: Route) -> Self {
        let status = match route.status {
            RouteStatus::Active => "ACTIVE",
            RouteStatus::Inactive => "INACTIVE",
            RouteStatus::Error => "ERROR",
        };
        Self {
            id: route.id,
            name: route.name,
            description: route.description,
            node_id: route.node_id,
            local_ip: route.local_ip,
            local_port: route.local_port,
            remote_port: route.remote_port,
            protocol: route.protocol,
            status: status.to_string(),
            max_connections: route.max_connections,
            current_connections: route.current_connections,
            total_bytes_in: route.total_bytes_in,
            total_bytes_out: route.total_bytes_out,
            public_url: route.public_url,
            created_at: route.created_at,
            updated_at: route.updated_at,
            last_used_at: route.last_used_at,
        }
    }
}

/// A route's binding to an engine tunnel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelBindingView {
    pub route_id: RouteId,
    pub tunnel_id: String,
    pub public_url: Option<String>,
    pub bound_at: DateTime<Utc>,
}

impl From<TunnelBinding> for TunnelBindingView {
    fn from(binding: TunnelBinding) -> Self {
        Self {
            route_id: binding.route_id,
            tunnel_id: binding.tunnel_id,
            public_url: binding.public_url,
            bound_at: binding.bound_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatusView {
    pub route_id: RouteId,
    pub running: bool,
    pub tunnel_id: Option<String>,
    /// Status string reported by the engine
    pub status: Option<String>,
    pub connections: u64,
    /// Seconds
    pub uptime: u64,
}

impl TunnelStatusView {
    pub fn not_running(route_id: RouteId) -> Self {
        Self {
            route_id,
            running: false,
            tunnel_id: None,
            status: None,
            connections: 0,
            uptime: 0,
        }
    }

    pub fn from_engine(route_id: RouteId, tunnel_id: Option<String>, s: EngineTunnelStatus) -> Self {
        Self {
            route_id,
            running: true,
            tunnel_id: s.tunnel_id.or(tunnel_id),
            status: Some(s.status),
            connections: s.connections,
            uptime: s.uptime,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrafficView {
    pub route_id: RouteId,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub total_bytes: u64,
    pub request_count: u64,
    /// Epoch milliseconds, 0 when unknown
    pub last_activity: i64,
}

impl TrafficView {
    pub fn from_stats(route_id: RouteId, stats: TrafficStats) -> Self {
        Self {
            route_id,
            bytes_in: stats.bytes_in,
            bytes_out: stats.bytes_out,
            total_bytes: stats.total_bytes(),
            request_count: stats.request_count,
            last_activity: stats.last_activity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatsView {
    pub active_tunnels: usize,
    pub total_routes: usize,
    pub active_routes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OnlineCountView {
    pub online_nodes: usize,
}
