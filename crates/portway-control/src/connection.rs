//! Live node connection directory
//!
//! Holds at most one channel per node. A node that reconnects replaces its
//! previous channel, and the close path of the old channel can never remove
//! the new one because removal is guarded by [`ChannelId`].

use crate::error::ChannelError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use portway_proto::{Frame, FrameCodec};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of one physical channel, distinct across reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outbound side of a node's control channel
///
/// Implementations must not block: `send_text` queues the frame or fails.
pub trait NodeChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    fn send_text(&self, text: &str) -> Result<(), ChannelError>;

    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Encode a frame and queue it on a channel
pub fn send_frame(channel: &dyn NodeChannel, frame: &Frame) -> Result<(), ChannelError> {
    let text = FrameCodec::encode(frame)?;
    channel.send_text(&text)
}

/// A registered node channel
#[derive(Clone)]
pub struct NodeConnection {
    pub node_id: String,
    pub channel: Arc<dyn NodeChannel>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Manages all live node channels
pub struct ConnectionRegistry {
    connections: DashMap<String, NodeConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Install `channel` for `node_id`, closing and returning any channel it replaced
    pub fn register(
        &self,
        node_id: &str,
        channel: Arc<dyn NodeChannel>,
    ) -> Option<Arc<dyn NodeChannel>> {
        let now = Utc::now();
        let new_id = channel.id();
        let previous = self.connections.insert(
            node_id.to_string(),
            NodeConnection {
                node_id: node_id.to_string(),
                channel,
                connected_at: now,
                last_heartbeat: now,
            },
        );

        let replaced = previous.map(|p| p.channel)?;
        if replaced.id() != new_id {
            info!(
                node_id = %node_id,
                old_channel = %replaced.id(),
                new_channel = %new_id,
                "Node reconnected, closing previous channel"
            );
            replaced.close();
        }
        Some(replaced)
    }

    /// Remove the node's entry only if it still belongs to `channel_id`
    pub fn unregister(&self, node_id: &str, channel_id: ChannelId) -> bool {
        let removed = self
            .connections
            .remove_if(node_id, |_, conn| conn.channel.id() == channel_id)
            .is_some();
        if removed {
            debug!(node_id = %node_id, channel = %channel_id, "Node channel unregistered");
        } else {
            debug!(node_id = %node_id, channel = %channel_id, "Ignoring stale unregister");
        }
        removed
    }

    pub fn lookup(&self, node_id: &str) -> Option<Arc<dyn NodeChannel>> {
        self.connections.get(node_id).map(|c| c.channel.clone())
    }

    pub fn connection(&self, node_id: &str) -> Option<NodeConnection> {
        self.connections.get(node_id).map(|c| c.clone())
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.connections.contains_key(node_id)
    }

    /// Record a heartbeat on the node's live connection
    pub fn touch(&self, node_id: &str, at: DateTime<Utc>) -> bool {
        match self.connections.get_mut(node_id) {
            Some(mut conn) => {
                conn.last_heartbeat = at;
                true
            }
            None => false,
        }
    }

    /// Remove and close the node's connection if its last heartbeat is older than `cutoff`
    pub fn evict_if_stale(&self, node_id: &str, cutoff: DateTime<Utc>) -> bool {
        match self
            .connections
            .remove_if(node_id, |_, conn| conn.last_heartbeat < cutoff)
        {
            Some((_, conn)) => {
                conn.channel.close();
                true
            }
            None => false,
        }
    }

    /// Remove and close the node's connection regardless of channel
    pub fn evict(&self, node_id: &str) -> bool {
        match self.connections.remove(node_id) {
            Some((_, conn)) => {
                conn.channel.close();
                true
            }
            None => false,
        }
    }

    pub fn send(&self, node_id: &str, frame: &Frame) -> Result<(), ChannelError> {
        let channel = self
            .lookup(node_id)
            .ok_or_else(|| ChannelError::NotConnected(node_id.to_string()))?;
        send_frame(channel.as_ref(), frame)
    }

    /// Deliver a frame to every connected node, returning how many accepted it
    pub fn broadcast(&self, frame: &Frame) -> usize {
        let text = match FrameCodec::encode(frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode broadcast frame: {}", e);
                return 0;
            }
        };

        let targets: Vec<(String, Arc<dyn NodeChannel>)> = self
            .connections
            .iter()
            .map(|c| (c.key().clone(), c.channel.clone()))
            .collect();

        let mut delivered = 0;
        for (node_id, channel) in targets {
            match channel.send_text(&text) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(node_id = %node_id, "Broadcast delivery failed: {}", e),
            }
        }
        delivered
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn connected_nodes(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
