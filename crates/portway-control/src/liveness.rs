//! Node liveness tracking
//!
//! Every change to a node's recorded state goes through one of the named
//! transitions below so the state machine can be driven directly in tests.
//! Losing the control channel only marks the node OFFLINE; the node's
//! routes and any tunnels bound to them are left alone.

use crate::connection::ConnectionRegistry;
use crate::error::ControlError;
use crate::models::Node;
use crate::storage::{Applied, NodeChange, NodeStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub heartbeat_interval: Duration,
    /// Heartbeats a node may miss before it is considered gone
    pub missed_heartbeats: u32,
    pub sweep_interval: Duration,
}

impl LivenessConfig {
    pub fn timeout(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            missed_heartbeats: 3,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Outcome of a liveness transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CameOnline,
    /// Heartbeat from a node recorded as OFFLINE
    HeartbeatRevival,
    StillOnline,
    WentOffline,
    AlreadyOffline,
    UnknownNode,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::CameOnline => "came_online",
            Transition::HeartbeatRevival => "heartbeat_revival",
            Transition::StillOnline => "still_online",
            Transition::WentOffline => "went_offline",
            Transition::AlreadyOffline => "already_offline",
            Transition::UnknownNode => "unknown_node",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    ChannelClosed,
    HeartbeatTimeout,
    Unregistered,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub evicted: Vec<String>,
    pub failed: usize,
}

pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    nodes: Arc<dyn NodeStore>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        nodes: Arc<dyn NodeStore>,
        config: LivenessConfig,
    ) -> Self {
        Self {
            registry,
            nodes,
            config,
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    fn timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(90))
    }

    /// Channel registered for `node_id`
    pub async fn mark_online(
        &self,
        node_id: &str,
        client_addr: Option<String>,
    ) -> Result<Transition, ControlError> {
        let change = NodeChange::Online {
            at: Utc::now(),
            client_addr,
        };
        let Some(applied) = self.nodes.apply_node_change(node_id, change).await? else {
            warn!(node_id = %node_id, "Cannot mark unknown node online");
            return Ok(Transition::UnknownNode);
        };

        if applied.previous.is_online() {
            return Ok(Transition::StillOnline);
        }
        info!(node_id = %node_id, "Node online");
        Ok(Transition::CameOnline)
    }

    pub async fn record_heartbeat(&self, node_id: &str) -> Result<Transition, ControlError> {
        self.record_heartbeat_at(node_id, Utc::now()).await
    }

    pub async fn record_heartbeat_at(
        &self,
        node_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition, ControlError> {
        self.registry.touch(node_id, at);

        let change = NodeChange::Online {
            at,
            client_addr: None,
        };
        let Some(applied) = self.nodes.apply_node_change(node_id, change).await? else {
            debug!(node_id = %node_id, "Heartbeat from unknown node");
            return Ok(Transition::UnknownNode);
        };

        if applied.previous.is_online() {
            return Ok(Transition::StillOnline);
        }
        info!(node_id = %node_id, "Heartbeat revived offline node");
        Ok(Transition::HeartbeatRevival)
    }

    /// Record a node as OFFLINE. Routes and tunnel bindings are untouched.
    pub async fn mark_offline(
        &self,
        node_id: &str,
        reason: OfflineReason,
    ) -> Result<Transition, ControlError> {
        if reason != OfflineReason::ChannelClosed {
            self.registry.evict(node_id);
        }

        let applied = self
            .nodes
            .apply_node_change(node_id, NodeChange::Offline)
            .await?;
        let Some(applied) = applied else {
            debug!(node_id = %node_id, ?reason, "Offline transition for unknown node");
            return Ok(Transition::UnknownNode);
        };
        Ok(offline_transition(node_id, &applied, reason))
    }

    pub async fn sweep(&self) -> Result<SweepReport, ControlError> {
        self.sweep_at(Utc::now()).await
    }

    /// Mark every node whose last heartbeat is older than the timeout as OFFLINE
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, ControlError> {
        let cutoff = now - self.timeout();
        let mut report = SweepReport::default();

        let stale: Vec<String> = self
            .nodes
            .list_nodes()
            .await?
            .into_iter()
            .filter(|n| n.is_online() && is_stale(n, cutoff))
            .map(|n| n.node_id)
            .collect();

        for node_id in stale {
            report.examined += 1;
            match self.expire(&node_id, cutoff).await {
                Ok(true) => report.evicted.push(node_id),
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    error!(node_id = %node_id, "Liveness sweep failed for node: {}", e);
                }
            }
        }

        if !report.evicted.is_empty() {
            info!(
                evicted = report.evicted.len(),
                examined = report.examined,
                "Liveness sweep expired stale nodes"
            );
        }
        Ok(report)
    }

    /// Staleness is re-checked inside the store write, so a heartbeat that
    /// lands after the listing wins
    async fn expire(&self, node_id: &str, cutoff: DateTime<Utc>) -> Result<bool, ControlError> {
        let applied = self
            .nodes
            .apply_node_change(node_id, NodeChange::ExpireIfStale { cutoff })
            .await?;
        let Some(applied) = applied else {
            return Ok(false);
        };

        let transition = offline_transition(node_id, &applied, OfflineReason::HeartbeatTimeout);
        if transition != Transition::WentOffline {
            return Ok(false);
        }
        self.registry.evict_if_stale(node_id, cutoff);
        Ok(true)
    }
}

fn offline_transition(node_id: &str, applied: &Applied<Node>, reason: OfflineReason) -> Transition {
    if applied.previous.state == applied.current.state {
        return Transition::AlreadyOffline;
    }
    info!(node_id = %node_id, ?reason, "Node offline");
    Transition::WentOffline
}

fn is_stale(node: &Node, cutoff: DateTime<Utc>) -> bool {
    node.last_heartbeat.map(|t| t < cutoff).unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingChannel;
    use crate::connection::NodeChannel;
    use crate::models::{NewNode, NodeState};
    use crate::storage::MemoryStore;

    async fn setup() -> (Arc<ConnectionRegistry>, Arc<MemoryStore>, LivenessMonitor) {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(MemoryStore::new());
        store
            .insert_node(Node::from_new(
                "node_test123456789".to_string(),
                NewNode {
                    name: "office".to_string(),
                    owner_id: 1,
                    ..Default::default()
                },
                Utc::now(),
            ))
            .await
            .unwrap();
        let monitor = LivenessMonitor::new(registry.clone(), store.clone(), LivenessConfig::default());
        (registry, store, monitor)
    }

    #[tokio::test]
    async fn test_online_offline_cycle() {
        let (_registry, store, monitor) = setup().await;
        let id = "node_test123456789";

        assert_eq!(
            monitor.mark_online(id, Some("10.0.0.2:5000".into())).await.unwrap(),
            Transition::CameOnline
        );
        assert_eq!(monitor.mark_online(id, None).await.unwrap(), Transition::StillOnline);

        let node = store.get_node(id).await.unwrap().unwrap();
        assert_eq!(node.client_addr.as_deref(), Some("10.0.0.2:5000"));

        assert_eq!(
            monitor.mark_offline(id, OfflineReason::ChannelClosed).await.unwrap(),
            Transition::WentOffline
        );
        assert_eq!(
            monitor.mark_offline(id, OfflineReason::ChannelClosed).await.unwrap(),
            Transition::AlreadyOffline
        );
    }

    #[tokio::test]
    async fn test_heartbeat_revives_offline_node() {
        let (_registry, store, monitor) = setup().await;
        let id = "node_test123456789";

        assert_eq!(
            monitor.record_heartbeat(id).await.unwrap(),
            Transition::HeartbeatRevival
        );
        assert_eq!(
            monitor.record_heartbeat(id).await.unwrap(),
            Transition::StillOnline
        );
        assert!(store.get_node(id).await.unwrap().unwrap().is_online());
    }

    #[tokio::test]
    async fn test_unknown_node_is_not_an_error() {
        let (_registry, _store, monitor) = setup().await;
        assert_eq!(
            monitor.record_heartbeat("node_missing000").await.unwrap(),
            Transition::UnknownNode
        );
        assert_eq!(
            monitor
                .mark_offline("node_missing000", OfflineReason::HeartbeatTimeout)
                .await
                .unwrap(),
            Transition::UnknownNode
        );
    }

    #[tokio::test]
    async fn test_offline_resets_connection_count() {
        let (_registry, store, monitor) = setup().await;
        let id = "node_test123456789";
        monitor.mark_online(id, None).await.unwrap();

        store
            .apply_node_change(
                id,
                NodeChange::Traffic {
                    connections: 4,
                    bytes_in: 0,
                    bytes_out: 0,
                },
            )
            .await
            .unwrap();

        monitor.mark_offline(id, OfflineReason::ChannelClosed).await.unwrap();
        assert_eq!(store.get_node(id).await.unwrap().unwrap().current_connections, 0);
    }

    #[tokio::test]
    async fn test_sweep_expires_silent_node() {
        let (registry, store, monitor) = setup().await;
        let id = "node_test123456789";
        let channel = RecordingChannel::new();
        registry.register(id, channel.clone());
        monitor.mark_online(id, None).await.unwrap();

        // Within the timeout nothing happens
        let report = monitor.sweep_at(Utc::now()).await.unwrap();
        assert!(report.evicted.is_empty());
        assert!(registry.is_connected(id));

        let later = Utc::now() + chrono::Duration::seconds(91);
        let report = monitor.sweep_at(later).await.unwrap();
        assert_eq!(report.evicted, vec![id.to_string()]);
        assert!(!registry.is_connected(id));
        assert!(!channel.is_open());
        assert_eq!(
            store.get_node(id).await.unwrap().unwrap().state,
            NodeState::Offline
        );
    }

    #[tokio::test]
    async fn test_sweep_spares_node_with_recent_heartbeat() {
        let (registry, _store, monitor) = setup().await;
        let id = "node_test123456789";
        registry.register(id, RecordingChannel::new());
        monitor.mark_online(id, None).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(91);
        monitor
            .record_heartbeat_at(id, later - chrono::Duration::seconds(10))
            .await
            .unwrap();

        let report = monitor.sweep_at(later).await.unwrap();
        assert!(report.evicted.is_empty());
        assert!(registry.is_connected(id));
    }
}
