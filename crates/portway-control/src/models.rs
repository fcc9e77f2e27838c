//! Persistent records managed by the control plane

use chrono::{DateTime, Utc};
use portway_proto::{HardwareStatusPayload, Protocol};
use serde::{Deserialize, Serialize};

pub type RouteId = i64;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Liveness state of a node as recorded in storage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeState {
    Online,
    #[default]
    Offline,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub node_id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: i64,
    pub protocol: Protocol,
    pub max_connections: u32,
    pub current_connections: u32,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub state: NodeState,
    pub client_addr: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when registering a node
#[derive(Debug, Clone, Default)]
pub struct NewNode {
    /// Generated when absent
    pub node_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: i64,
    pub protocol: Protocol,
    pub max_connections: Option<u32>,
}

impl Node {
    pub fn from_new(node_id: String, new: NewNode, now: DateTime<Utc>) -> Self {
        Self {
            node_id,
            name: new.name,
            description: new.description,
            owner_id: new.owner_id,
            protocol: new.protocol,
            max_connections: new.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            current_connections: 0,
            total_bytes_in: 0,
            total_bytes_out: 0,
            state: NodeState::Offline,
            client_addr: None,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == NodeState::Online
    }
}

/// Generate a node id of the form `node_<16 hex chars>`
pub fn generate_node_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("node_{}", &hex[..16])
}

/// Node ids are 8-64 characters of `[A-Za-z0-9_-]`
pub fn is_valid_node_id(id: &str) -> bool {
    (8..=64).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteStatus {
    #[default]
    Inactive,
    Active,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub id: RouteId,
    pub name: String,
    pub description: Option<String>,
    pub node_id: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub status: RouteStatus,
    pub max_connections: u32,
    pub current_connections: u32,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub public_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Fields supplied when creating a route
#[derive(Debug, Clone)]
pub struct NewRoute {
    pub name: String,
    pub description: Option<String>,
    pub node_id: String,
    pub local_ip: String,
    pub local_port: u16,
    /// Allocated from the configured range when absent
    pub remote_port: Option<u16>,
    pub protocol: Protocol,
    pub max_connections: Option<u32>,
}

/// A route as handed to storage, remote port already settled
#[derive(Debug, Clone)]
pub struct RouteDraft {
    pub name: String,
    pub description: Option<String>,
    pub node_id: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub max_connections: u32,
}

impl RouteDraft {
    pub fn into_route(self, id: RouteId, now: DateTime<Utc>) -> Route {
        Route {
            id,
            name: self.name,
            description: self.description,
            node_id: self.node_id,
            local_ip: self.local_ip,
            local_port: self.local_port,
            remote_port: self.remote_port,
            protocol: self.protocol,
            status: RouteStatus::Inactive,
            max_connections: self.max_connections,
            current_connections: 0,
            total_bytes_in: 0,
            total_bytes_out: 0,
            public_url: None,
            created_at: now,
            updated_at: now,
            last_used_at: None,
        }
    }
}

/// Point-in-time telemetry of a node. Never modified after it is recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeStatusSnapshot {
    pub id: i64,
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

impl NodeStatusSnapshot {
    pub fn from_report(node_id: &str, report: &HardwareStatusPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            node_id: node_id.to_string(),
            cpu_usage: report.cpu_usage,
            memory_usage: report.memory_usage,
            disk_usage: report.disk_usage,
            network_in: report.network_in,
            network_out: report.network_out,
            connection_count: report.connection_count,
            uptime: report.uptime,
            load_average: report.load_average,
            temperature: report.temperature,
            ping_latency: report.ping_latency,
            bandwidth_in: report.bandwidth_in,
            bandwidth_out: report.bandwidth_out,
            error_count: 0,
            warning_count: 0,
            recorded_at: now,
        }
    }
}
