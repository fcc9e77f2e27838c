//! Storage seams for nodes, routes and node telemetry
//!
//! The relational database lives outside the control plane. Everything here
//! is expressed as async traits so a database-backed implementation can be
//! dropped in; [`MemoryStore`] implements all of them for single-process
//! deployments and tests.

use crate::models::{Node, NodeState, NodeStatusSnapshot, Route, RouteDraft, RouteId, RouteStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use portway_proto::Protocol;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record already exists: {0}")]
    Conflict(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// A row before and after a change was applied to it
#[derive(Debug, Clone, PartialEq)]
pub struct Applied<T> {
    pub previous: T,
    pub current: T,
}

/// Field-level node write. A store applies each one atomically to a single
/// row, so writers touching different fields never undo each other.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeChange {
    /// Editable metadata; `None` leaves a field unchanged
    Details {
        name: Option<String>,
        description: Option<String>,
        protocol: Option<Protocol>,
        max_connections: Option<u32>,
    },
    /// Channel attached, or heartbeat received
    Online {
        at: DateTime<Utc>,
        client_addr: Option<String>,
    },
    Offline,
    /// OFFLINE only while the node is ONLINE with no heartbeat at or after `cutoff`
    ExpireIfStale { cutoff: DateTime<Utc> },
    /// Node-reported counters; traffic is added to the totals
    Traffic {
        connections: u32,
        bytes_in: u64,
        bytes_out: u64,
    },
}

impl NodeChange {
    /// Apply to a row in place. Stores call this inside their row lock.
    pub fn apply(&self, node: &mut Node, now: DateTime<Utc>) {
        match self {
            NodeChange::Details {
                name,
                description,
                protocol,
                max_connections,
            } => {
                if let Some(name) = name {
                    node.name = name.clone();
                }
                if description.is_some() {
                    node.description = description.clone();
                }
                if let Some(protocol) = protocol {
                    node.protocol = *protocol;
                }
                if let Some(max) = max_connections {
                    node.max_connections = *max;
                }
            }
            NodeChange::Online { at, client_addr } => {
                node.state = NodeState::Online;
                node.last_heartbeat = Some(*at);
                if client_addr.is_some() {
                    node.client_addr = client_addr.clone();
                }
            }
            NodeChange::Offline => {
                node.state = NodeState::Offline;
                node.current_connections = 0;
            }
            NodeChange::ExpireIfStale { cutoff } => {
                let stale = node.last_heartbeat.map(|t| t < *cutoff).unwrap_or(true);
                if !(node.is_online() && stale) {
                    return;
                }
                node.state = NodeState::Offline;
                node.current_connections = 0;
            }
            NodeChange::Traffic {
                connections,
                bytes_in,
                bytes_out,
            } => {
                node.current_connections = *connections;
                node.total_bytes_in = node.total_bytes_in.saturating_add(*bytes_in);
                node.total_bytes_out = node.total_bytes_out.saturating_add(*bytes_out);
            }
        }
        node.updated_at = now;
    }
}

/// Field-level route write, applied atomically to a single row
#[derive(Debug, Clone, PartialEq)]
pub enum RouteChange {
    /// Editable metadata; `None` leaves a field unchanged
    Details {
        name: Option<String>,
        description: Option<String>,
        max_connections: Option<u32>,
    },
    /// Add reported traffic to the totals
    AddTraffic { bytes_in: u64, bytes_out: u64 },
    /// Replace the totals with engine counters
    SetTraffic {
        bytes_in: u64,
        bytes_out: u64,
        last_activity: Option<DateTime<Utc>>,
    },
    /// Tunnel bound on the engine
    Activated {
        public_url: Option<String>,
        remote_port: u16,
    },
    /// Tunnel gone
    Deactivated,
    /// Set `to` only while the route is in `from`
    Status { from: RouteStatus, to: RouteStatus },
}

impl RouteChange {
    /// Apply to a row in place. Stores call this inside their row lock.
    pub fn apply(&self, route: &mut Route, now: DateTime<Utc>) {
        match self {
            RouteChange::Details {
                name,
                description,
                max_connections,
            } => {
                if let Some(name) = name {
                    route.name = name.clone();
                }
                if description.is_some() {
                    route.description = description.clone();
                }
                if let Some(max) = max_connections {
                    route.max_connections = *max;
                }
            }
            RouteChange::AddTraffic {
                bytes_in,
                bytes_out,
            } => {
                route.total_bytes_in = route.total_bytes_in.saturating_add(*bytes_in);
                route.total_bytes_out = route.total_bytes_out.saturating_add(*bytes_out);
                route.last_used_at = Some(now);
            }
            RouteChange::SetTraffic {
                bytes_in,
                bytes_out,
                last_activity,
            } => {
                route.total_bytes_in = *bytes_in;
                route.total_bytes_out = *bytes_out;
                if last_activity.is_some() {
                    route.last_used_at = *last_activity;
                }
            }
            RouteChange::Activated {
                public_url,
                remote_port,
            } => {
                route.status = RouteStatus::Active;
                route.public_url = public_url.clone();
                route.remote_port = *remote_port;
                route.last_used_at = Some(now);
            }
            RouteChange::Deactivated => {
                route.status = RouteStatus::Inactive;
                route.current_connections = 0;
            }
            RouteChange::Status { from, to } => {
                if route.status != *from {
                    return;
                }
                route.status = *to;
            }
        }
        route.updated_at = now;
    }
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Fails with [`StorageError::Conflict`] when the id is taken
    async fn insert_node(&self, node: Node) -> Result<(), StorageError>;

    async fn get_node(&self, node_id: &str) -> Result<Option<Node>, StorageError>;

    async fn list_nodes(&self) -> Result<Vec<Node>, StorageError>;

    /// Apply `change` atomically; `None` when the node does not exist
    async fn apply_node_change(
        &self,
        node_id: &str,
        change: NodeChange,
    ) -> Result<Option<Applied<Node>>, StorageError>;

    async fn delete_node(&self, node_id: &str) -> Result<bool, StorageError>;
}

#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Persist a new route and assign its id
    async fn insert_route(&self, draft: RouteDraft) -> Result<Route, StorageError>;

    async fn get_route(&self, id: RouteId) -> Result<Option<Route>, StorageError>;

    async fn list_routes(&self) -> Result<Vec<Route>, StorageError>;

    async fn list_routes_for_node(&self, node_id: &str) -> Result<Vec<Route>, StorageError>;

    /// Apply `change` atomically; `None` when the route does not exist
    async fn apply_route_change(
        &self,
        id: RouteId,
        change: RouteChange,
    ) -> Result<Option<Applied<Route>>, StorageError>;

    async fn delete_route(&self, id: RouteId) -> Result<bool, StorageError>;

    async fn find_by_local_endpoint(
        &self,
        node_id: &str,
        local_ip: &str,
        local_port: u16,
    ) -> Result<Option<Route>, StorageError>;

    async fn is_remote_port_used(&self, port: u16) -> Result<bool, StorageError>;

    /// Remote ports held by routes within `start..=end`
    async fn used_remote_ports(&self, start: u16, end: u16) -> Result<HashSet<u16>, StorageError>;
}

#[async_trait]
pub trait NodeStatusStore: Send + Sync {
    /// Append a snapshot and assign its id
    async fn record_status(
        &self,
        snapshot: NodeStatusSnapshot,
    ) -> Result<NodeStatusSnapshot, StorageError>;

    async fn latest_status(&self, node_id: &str)
        -> Result<Option<NodeStatusSnapshot>, StorageError>;

    /// Most recent first
    async fn status_history(
        &self,
        node_id: &str,
        limit: usize,
    ) -> Result<Vec<NodeStatusSnapshot>, StorageError>;

    /// Delete snapshots recorded before `cutoff`, returning how many went
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;
}

/// In-memory implementation of every store trait
pub struct MemoryStore {
    nodes: DashMap<String, Node>,
    routes: DashMap<RouteId, Route>,
    statuses: DashMap<i64, NodeStatusSnapshot>,
    next_route_id: AtomicI64,
    next_status_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            routes: DashMap::new(),
            statuses: DashMap::new(),
            next_route_id: AtomicI64::new(1),
            next_status_id: AtomicI64::new(1),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn insert_node(&self, node: Node) -> Result<(), StorageError> {
        match self.nodes.entry(node.node_id.clone()) {
            Entry::Occupied(_) => Err(StorageError::Conflict(node.node_id)),
            Entry::Vacant(slot) => {
                slot.insert(node);
                Ok(())
            }
        }
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<Node>, StorageError> {
        Ok(self.nodes.get(node_id).map(|n| n.clone()))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StorageError> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(nodes)
    }

    async fn apply_node_change(
        &self,
        node_id: &str,
        change: NodeChange,
    ) -> Result<Option<Applied<Node>>, StorageError> {
        Ok(self.nodes.get_mut(node_id).map(|mut node| {
            let previous = node.clone();
            change.apply(&mut node, Utc::now());
            Applied {
                previous,
                current: node.clone(),
            }
        }))
    }

    async fn delete_node(&self, node_id: &str) -> Result<bool, StorageError> {
        Ok(self.nodes.remove(node_id).is_some())
    }
}

#[async_trait]
impl RouteStore for MemoryStore {
    async fn insert_route(&self, draft: RouteDraft) -> Result<Route, StorageError> {
        let id = self.next_route_id.fetch_add(1, Ordering::SeqCst);
        let route = draft.into_route(id, Utc::now());
        self.routes.insert(id, route.clone());
        Ok(route)
    }

    async fn get_route(&self, id: RouteId) -> Result<Option<Route>, StorageError> {
        Ok(self.routes.get(&id).map(|r| r.clone()))
    }

    async fn list_routes(&self) -> Result<Vec<Route>, StorageError> {
        let mut routes: Vec<Route> = self.routes.iter().map(|r| r.value().clone()).collect();
        routes.sort_by_key(|r| r.id);
        Ok(routes)
    }

    async fn list_routes_for_node(&self, node_id: &str) -> Result<Vec<Route>, StorageError> {
        let mut routes: Vec<Route> = self
            .routes
            .iter()
            .filter(|r| r.node_id == node_id)
            .map(|r| r.value().clone())
            .collect();
        routes.sort_by_key(|r| r.id);
        Ok(routes)
    }

    async fn apply_route_change(
        &self,
        id: RouteId,
        change: RouteChange,
    ) -> Result<Option<Applied<Route>>, StorageError> {
        Ok(self.routes.get_mut(&id).map(|mut route| {
            let previous = route.clone();
            change.apply(&mut route, Utc::now());
            Applied {
                previous,
                current: route.clone(),
            }
        }))
    }

    async fn delete_route(&self, id: RouteId) -> Result<bool, StorageError> {
        Ok(self.routes.remove(&id).is_some())
    }

    async fn find_by_local_endpoint(
        &self,
        node_id: &str,
        local_ip: &str,
        local_port: u16,
    ) -> Result<Option<Route>, StorageError> {
        Ok(self
            .routes
            .iter()
            .find(|r| r.node_id == node_id && r.local_ip == local_ip && r.local_port == local_port)
            .map(|r| r.value().clone()))
    }

    async fn is_remote_port_used(&self, port: u16) -> Result<bool, StorageError> {
        Ok(self.routes.iter().any(|r| r.remote_port == port))
    }

    async fn used_remote_ports(&self, start: u16, end: u16) -> Result<HashSet<u16>, StorageError> {
        Ok(self
            .routes
            .iter()
            .map(|r| r.remote_port)
            .filter(|p| (start..=end).contains(p))
            .collect())
    }
}

#[async_trait]
impl NodeStatusStore for MemoryStore {
    async fn record_status(
        &self,
        mut snapshot: NodeStatusSnapshot,
    ) -> Result<NodeStatusSnapshot, StorageError> {
        snapshot.id = self.next_status_id.fetch_add(1, Ordering::SeqCst);
        self.statuses.insert(snapshot.id, snapshot.clone());
        Ok(snapshot)
    }

    async fn latest_status(
        &self,
        node_id: &str,
    ) -> Result<Option<NodeStatusSnapshot>, StorageError> {
        Ok(self.status_history(node_id, 1).await?.into_iter().next())
    }

    async fn status_history(
        &self,
        node_id: &str,
        limit: usize,
    ) -> Result<Vec<NodeStatusSnapshot>, StorageError> {
        let mut history: Vec<NodeStatusSnapshot> = self
            .statuses
            .iter()
            .filter(|s| s.node_id == node_id)
            .map(|s| s.value().clone())
            .collect();
        history.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at).then(b.id.cmp(&a.id)));
        history.truncate(limit);
        Ok(history)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let before = self.statuses.len();
        self.statuses.retain(|_, s| s.recorded_at >= cutoff);
        Ok(before.saturating_sub(self.statuses.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewNode;
    use chrono::Duration;

    fn draft(node_id: &str, local_port: u16, remote_port: u16) -> RouteDraft {
        RouteDraft {
            name: format!("route-{}", local_port),
            description: None,
            node_id: node_id.to_string(),
            local_ip: "127.0.0.1".to_string(),
            local_port,
            remote_port,
            protocol: Protocol::Tcp,
            max_connections: 10,
        }
    }

    #[tokio::test]
    async fn test_node_insert_conflict() {
        let store = MemoryStore::new();
        let node = Node::from_new(
            "node_aaaaaaaa".to_string(),
            NewNode::default(),
            Utc::now(),
        );
        store.insert_node(node.clone()).await.unwrap();
        assert!(matches!(
            store.insert_node(node).await,
            Err(StorageError::Conflict(_))
        ));
        assert_eq!(store.list_nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_route_port_queries() {
        let store = MemoryStore::new();
        let first = store.insert_route(draft("node_a", 8080, 10001)).await.unwrap();
        store.insert_route(draft("node_a", 8081, 20500)).await.unwrap();

        assert_eq!(first.id, 1);
        assert!(store.is_remote_port_used(10001).await.unwrap());
        assert!(!store.is_remote_port_used(10002).await.unwrap());

        let used = store.used_remote_ports(10000, 20000).await.unwrap();
        assert_eq!(used, HashSet::from([10001]));

        assert!(store
            .find_by_local_endpoint("node_a", "127.0.0.1", 8081)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_by_local_endpoint("node_b", "127.0.0.1", 8081)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_route_changes_touch_only_their_fields() {
        let store = MemoryStore::new();
        let route = store.insert_route(draft("node_a", 8080, 10001)).await.unwrap();

        store
            .apply_route_change(
                route.id,
                RouteChange::Activated {
                    public_url: Some("https://t1.example".into()),
                    remote_port: 10001,
                },
            )
            .await
            .unwrap();
        let applied = store
            .apply_route_change(
                route.id,
                RouteChange::AddTraffic {
                    bytes_in: 100,
                    bytes_out: 50,
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(applied.current.status, RouteStatus::Active);
        assert_eq!(applied.current.total_bytes_in, 100);

        store
            .apply_route_change(route.id, RouteChange::Deactivated)
            .await
            .unwrap();
        let applied = store
            .apply_route_change(
                route.id,
                RouteChange::Status {
                    from: RouteStatus::Active,
                    to: RouteStatus::Error,
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(applied.current.status, RouteStatus::Inactive);
        assert_eq!(applied.current.total_bytes_in, 100);

        assert!(store
            .apply_route_change(99, RouteChange::Deactivated)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expire_if_stale_respects_fresh_heartbeat() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_node(Node::from_new(
                "node_aaaaaaaa".to_string(),
                NewNode::default(),
                now,
            ))
            .await
            .unwrap();
        store
            .apply_node_change(
                "node_aaaaaaaa",
                NodeChange::Online {
                    at: now,
                    client_addr: None,
                },
            )
            .await
            .unwrap();

        let applied = store
            .apply_node_change(
                "node_aaaaaaaa",
                NodeChange::ExpireIfStale {
                    cutoff: now - Duration::seconds(90),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(applied.current.is_online());
        assert_eq!(applied.current.last_heartbeat, Some(now));

        let applied = store
            .apply_node_change(
                "node_aaaaaaaa",
                NodeChange::ExpireIfStale {
                    cutoff: now + Duration::seconds(1),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(applied.previous.is_online());
        assert_eq!(applied.current.state, NodeState::Offline);
    }

    #[tokio::test]
    async fn test_status_history_and_pruning() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for days_ago in [40, 10, 0] {
            store
                .record_status(NodeStatusSnapshot {
                    node_id: "node_a".to_string(),
                    uptime: Some(days_ago),
                    recorded_at: now - Duration::days(days_ago as i64),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let latest = store.latest_status("node_a").await.unwrap().unwrap();
        assert_eq!(latest.uptime, Some(0));

        let pruned = store.prune_before(now - Duration::days(30)).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.status_history("node_a", 10).await.unwrap().len(), 2);
    }
}
