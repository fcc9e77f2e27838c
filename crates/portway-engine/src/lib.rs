//! External tunneling engine
//!
//! The relay never forwards tunnel bytes itself. It asks an external engine
//! to open and close tunnels and reads their status and traffic counters
//! back. [`TunnelEngine`] is the seam; [`HttpEngineClient`] talks to the
//! engine's REST API.

pub mod client;
pub mod types;

pub use client::{EngineConfig, HttpEngineClient};
pub use types::{CreateTunnelRequest, EngineTunnel, EngineTunnelStatus, TrafficStats};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Engine client errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Engine request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Engine returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid engine response: {0}")]
    InvalidResponse(String),

    #[error("Engine rejected request: {0}")]
    Rejected(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Operations the control plane needs from a tunneling engine
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Open a tunnel; the returned handle identifies it in later calls
    async fn create_tunnel(&self, request: CreateTunnelRequest)
        -> Result<EngineTunnel, EngineError>;

    /// Close a tunnel. `Ok(false)` means the engine refused.
    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<bool, EngineError>;

    async fn tunnel_status(&self, tunnel_id: &str) -> Result<EngineTunnelStatus, EngineError>;

    async fn traffic_stats(&self, tunnel_id: &str) -> Result<TrafficStats, EngineError>;

    async fn health(&self) -> Result<bool, EngineError>;
}
