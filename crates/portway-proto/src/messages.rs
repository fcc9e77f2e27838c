//! Channel message types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport protocol of a node or route
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "HTTP" => Ok(Protocol::Http),
            "HTTPS" => Ok(Protocol::Https),
            other => Err(format!("unknown protocol: {}", other)),
        }
    }
}

/// Discriminator carried in the `type` field of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Register,
    Heartbeat,
    StatusUpdate,
    HardwareStatus,
    HardwareStatusAck,
    TunnelStart,
    TunnelStop,
    DataResponse,
    ConnectionResponse,
    Error,
    Info,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Register => "register",
            MessageType::Heartbeat => "heartbeat",
            MessageType::StatusUpdate => "status_update",
            MessageType::HardwareStatus => "hardware_status",
            MessageType::HardwareStatusAck => "hardware_status_ack",
            MessageType::TunnelStart => "tunnel_start",
            MessageType::TunnelStop => "tunnel_stop",
            MessageType::DataResponse => "data_response",
            MessageType::ConnectionResponse => "connection_response",
            MessageType::Error => "error",
            MessageType::Info => "info",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s {
            "register" => MessageType::Register,
            "heartbeat" => MessageType::Heartbeat,
            "status_update" => MessageType::StatusUpdate,
            "hardware_status" => MessageType::HardwareStatus,
            "hardware_status_ack" => MessageType::HardwareStatusAck,
            "tunnel_start" => MessageType::TunnelStart,
            "tunnel_stop" => MessageType::TunnelStop,
            "data_response" => MessageType::DataResponse,
            "connection_response" => MessageType::ConnectionResponse,
            "error" => MessageType::Error,
            "info" => MessageType::Info,
            other => return Err(other.to_string()),
        };
        Ok(ty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub node_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// Connection counters reported by a node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusUpdatePayload {
    pub connections: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Host telemetry reported by a node. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HardwareStatusPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_out: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_average: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_latency: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_out: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStartPayload {
    pub route_id: i64,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStopPayload {
    pub route_id: i64,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataResponsePayload {
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResponsePayload {
    pub connection_id: String,
    pub action: String,
}

/// Typed body of a channel frame
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    // Node -> relay
    Register(RegisterPayload),
    Heartbeat(HeartbeatPayload),
    StatusUpdate(StatusUpdatePayload),
    HardwareStatus(HardwareStatusPayload),
    DataResponse(DataResponsePayload),
    ConnectionResponse(ConnectionResponsePayload),

    // Relay -> node
    HardwareStatusAck,
    TunnelStart(TunnelStartPayload),
    TunnelStop(TunnelStopPayload),
    Error,
    Info,
}

impl ControlMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ControlMessage::Register(_) => MessageType::Register,
            ControlMessage::Heartbeat(_) => MessageType::Heartbeat,
            ControlMessage::StatusUpdate(_) => MessageType::StatusUpdate,
            ControlMessage::HardwareStatus(_) => MessageType::HardwareStatus,
            ControlMessage::DataResponse(_) => MessageType::DataResponse,
            ControlMessage::ConnectionResponse(_) => MessageType::ConnectionResponse,
            ControlMessage::HardwareStatusAck => MessageType::HardwareStatusAck,
            ControlMessage::TunnelStart(_) => MessageType::TunnelStart,
            ControlMessage::TunnelStop(_) => MessageType::TunnelStop,
            ControlMessage::Error => MessageType::Error,
            ControlMessage::Info => MessageType::Info,
        }
    }

    /// Whether a node is allowed to send this message to the relay
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            ControlMessage::Register(_)
                | ControlMessage::Heartbeat(_)
                | ControlMessage::StatusUpdate(_)
                | ControlMessage::HardwareStatus(_)
                | ControlMessage::DataResponse(_)
                | ControlMessage::ConnectionResponse(_)
        )
    }
}
