//! Engine request and response types

use portway_proto::Protocol;
use serde::{Deserialize, Serialize};

/// Request to open a tunnel for a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTunnelRequest {
    /// Owning user of the route's node
    pub user_id: String,
    pub local_address: String,
    pub local_port: u16,
    pub protocol: Protocol,
    /// Defaults to `user-<user_id>-<epoch millis>` when not set
    pub subdomain: Option<String>,
}

impl CreateTunnelRequest {
    pub fn subdomain_or_default(&self) -> String {
        self.subdomain.clone().unwrap_or_else(|| {
            format!(
                "user-{}-{}",
                self.user_id,
                chrono::Utc::now().timestamp_millis()
            )
        })
    }
}

/// Handle returned by the engine for an opened tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineTunnel {
    pub tunnel_id: String,
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    /// Public port chosen by the engine, when it picks one
    #[serde(default)]
    pub public_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineTunnelStatus {
    pub tunnel_id: Option<String>,
    pub status: String,
    pub connections: u64,
    /// Seconds since the tunnel was opened
    pub uptime: u64,
}

impl EngineTunnelStatus {
    /// Whether the engine reports the tunnel as broken
    pub fn is_failed(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "error" | "failed" | "closed" | "not_found"
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TrafficStats {
    pub tunnel_id: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub request_count: u64,
    /// Epoch millis of the last forwarded byte, 0 when unknown
    pub last_activity: i64,
}

impl TrafficStats {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_in.saturating_add(self.bytes_out)
    }
}
