//! Control plane errors

use crate::models::RouteId;
use crate::storage::StorageError;
use portway_engine::EngineError;
use portway_proto::CodecError;
use thiserror::Error;

/// Failure delivering a frame to a node
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Node {0} is not connected")]
    NotConnected(String),

    #[error("Channel closed")]
    Closed,

    #[error("Channel outbound queue is full")]
    Backpressure,

    #[error("Failed to encode frame: {0}")]
    Codec(#[from] CodecError),
}

/// Coarse error category, used by outer surfaces to pick a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidInput,
    ExternalEngine,
    Transport,
    Storage,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Route not found: {0}")]
    RouteNotFound(RouteId),

    #[error("Node already exists: {0}")]
    DuplicateNode(String),

    #[error("Invalid node id {0:?}: expected 8-64 characters of [A-Za-z0-9_-]")]
    InvalidNodeId(String),

    #[error("Local endpoint {ip}:{port} is already mapped on node {node_id}")]
    DuplicateLocalEndpoint {
        node_id: String,
        ip: String,
        port: u16,
    },

    #[error("Remote port {0} is already in use")]
    PortInUse(u16),

    #[error("No available port in range {start}-{end}")]
    PortRangeExhausted { start: u16, end: u16 },

    #[error("Invalid port range {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("Node {node_id} still has {routes} route(s); delete them first")]
    NodeHasRoutes { node_id: String, routes: usize },

    #[error("Tunnel for route {0} is busy with another operation")]
    TunnelBusy(RouteId),

    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Tunnel engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::NodeNotFound(_) | ControlError::RouteNotFound(_) => ErrorKind::NotFound,
            ControlError::DuplicateNode(_)
            | ControlError::DuplicateLocalEndpoint { .. }
            | ControlError::PortInUse(_)
            | ControlError::PortRangeExhausted { .. }
            | ControlError::NodeHasRoutes { .. }
            | ControlError::TunnelBusy(_) => ErrorKind::Conflict,
            ControlError::InvalidNodeId(_)
            | ControlError::InvalidPortRange { .. }
            | ControlError::InvalidInput(_)
            | ControlError::Codec(_) => ErrorKind::InvalidInput,
            ControlError::Engine(_) => ErrorKind::ExternalEngine,
            ControlError::Channel(_) => ErrorKind::Transport,
            ControlError::Storage(_) => ErrorKind::Storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ControlError::RouteNotFound(3).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ControlError::PortRangeExhausted {
                start: 10000,
                end: 10001
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            ControlError::from(EngineError::Timeout(Duration::from_secs(1))).kind(),
            ErrorKind::ExternalEngine
        );
        assert_eq!(
            ControlError::from(ChannelError::Closed).kind(),
            ErrorKind::Transport
        );
    }

    #[test]
    fn test_error_messages() {
        let err = ControlError::PortRangeExhausted {
            start: 10000,
            end: 10002,
        };
        assert_eq!(err.to_string(), "No available port in range 10000-10002");
    }
}
