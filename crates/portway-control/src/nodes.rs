//! Node registration and lookup

use crate::connection::ConnectionRegistry;
use crate::error::ControlError;
use crate::liveness::{LivenessMonitor, OfflineReason};
use crate::models::{generate_node_id, is_valid_node_id, NewNode, Node};
use crate::storage::{NodeChange, NodeStore, RouteStore, StorageError};
use chrono::Utc;
use portway_proto::Protocol;
use std::sync::Arc;
use tracing::info;

/// Editable node fields; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub protocol: Option<Protocol>,
    pub max_connections: Option<u32>,
}

pub struct NodeManager {
    nodes: Arc<dyn NodeStore>,
    routes: Arc<dyn RouteStore>,
    registry: Arc<ConnectionRegistry>,
    liveness: Arc<LivenessMonitor>,
}

impl NodeManager {
    pub fn new(
        nodes: Arc<dyn NodeStore>,
        routes: Arc<dyn RouteStore>,
        registry: Arc<ConnectionRegistry>,
        liveness: Arc<LivenessMonitor>,
    ) -> Self {
        Self {
            nodes,
            routes,
            registry,
            liveness,
        }
    }

    pub async fn register(&self, new: NewNode) -> Result<Node, ControlError> {
        let node_id = match new.node_id.clone() {
            Some(id) if !is_valid_node_id(&id) => return Err(ControlError::InvalidNodeId(id)),
            Some(id) => id,
            None => generate_node_id(),
        };
        if new.name.trim().is_empty() {
            return Err(ControlError::InvalidInput("node name is required".into()));
        }

        let node = Node::from_new(node_id.clone(), new, Utc::now());
        match self.nodes.insert_node(node.clone()).await {
            Ok(()) => {}
            Err(StorageError::Conflict(_)) => return Err(ControlError::DuplicateNode(node_id)),
            Err(e) => return Err(e.into()),
        }

        info!(node_id = %node_id, owner_id = node.owner_id, "Node registered");
        Ok(node)
    }

    pub async fn get(&self, node_id: &str) -> Result<Node, ControlError> {
        self.nodes
            .get_node(node_id)
            .await?
            .ok_or_else(|| ControlError::NodeNotFound(node_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Node>, ControlError> {
        Ok(self.nodes.list_nodes().await?)
    }

    pub async fn update(&self, node_id: &str, update: NodeUpdate) -> Result<Node, ControlError> {
        let change = NodeChange::Details {
            name: update.name,
            description: update.description,
            protocol: update.protocol,
            max_connections: update.max_connections,
        };
        self.nodes
            .apply_node_change(node_id, change)
            .await?
            .map(|applied| applied.current)
            .ok_or_else(|| ControlError::NodeNotFound(node_id.to_string()))
    }

    /// Drop a node: its channel is closed and its record deleted. Refused
    /// while routes still point at the node.
    pub async fn unregister(&self, node_id: &str) -> Result<(), ControlError> {
        self.get(node_id).await?;
        let routes = self.routes.list_routes_for_node(node_id).await?.len();
        if routes > 0 {
            return Err(ControlError::NodeHasRoutes {
                node_id: node_id.to_string(),
                routes,
            });
        }

        self.liveness
            .mark_offline(node_id, OfflineReason::Unregistered)
            .await?;
        if !self.nodes.delete_node(node_id).await? {
            return Err(ControlError::NodeNotFound(node_id.to_string()));
        }
        info!(node_id = %node_id, "Node unregistered");
        Ok(())
    }

    pub fn online_count(&self) -> usize {
        self.registry.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::RecordingChannel;
    use crate::connection::NodeChannel;
    use crate::liveness::LivenessConfig;
    use crate::models::RouteDraft;
    use crate::storage::MemoryStore;

    fn manager() -> (Arc<ConnectionRegistry>, NodeManager) {
        let (registry, _store, manager) = manager_with_store();
        (registry, manager)
    }

    fn manager_with_store() -> (Arc<ConnectionRegistry>, Arc<MemoryStore>, NodeManager) {
        let registry = Arc::new(ConnectionRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let liveness = Arc::new(LivenessMonitor::new(
            registry.clone(),
            store.clone(),
            LivenessConfig::default(),
        ));
        let manager = NodeManager::new(store.clone(), store.clone(), registry.clone(), liveness);
        (registry, store, manager)
    }

    fn new_node(id: Option<&str>) -> NewNode {
        NewNode {
            node_id: id.map(str::to_string),
            name: "home-lab".to_string(),
            owner_id: 3,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_generates_id() {
        let (_registry, manager) = manager();
        let node = manager.register(new_node(None)).await.unwrap();
        assert!(node.node_id.starts_with("node_"));
        assert!(!node.is_online());
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_ids() {
        let (_registry, manager) = manager();
        manager
            .register(new_node(Some("node_test123456789")))
            .await
            .unwrap();

        assert!(matches!(
            manager.register(new_node(Some("node_test123456789"))).await,
            Err(ControlError::DuplicateNode(_))
        ));
        assert!(matches!(
            manager.register(new_node(Some("bad id!"))).await,
            Err(ControlError::InvalidNodeId(_))
        ));
    }

    #[tokio::test]
    async fn test_update_fields() {
        let (_registry, manager) = manager();
        let node = manager.register(new_node(None)).await.unwrap();
        let updated = manager
            .update(
                &node.node_id,
                NodeUpdate {
                    name: Some("renamed".into()),
                    max_connections: Some(50),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.max_connections, 50);
        assert_eq!(updated.owner_id, 3);
    }

    #[tokio::test]
    async fn test_unregister_closes_channel() {
        let (registry, manager) = manager();
        let node = manager.register(new_node(None)).await.unwrap();
        let channel = RecordingChannel::new();
        registry.register(&node.node_id, channel.clone());
        assert_eq!(manager.online_count(), 1);

        manager.unregister(&node.node_id).await.unwrap();
        assert!(!channel.is_open());
        assert_eq!(manager.online_count(), 0);
        assert!(matches!(
            manager.get(&node.node_id).await,
            Err(ControlError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unregister_refused_while_routes_exist() {
        let (_registry, store, manager) = manager_with_store();
        let node = manager.register(new_node(None)).await.unwrap();
        let route = store
            .insert_route(RouteDraft {
                name: "ssh".to_string(),
                description: None,
                node_id: node.node_id.clone(),
                local_ip: "127.0.0.1".to_string(),
                local_port: 22,
                remote_port: 10022,
                protocol: Protocol::Tcp,
                max_connections: 10,
            })
            .await
            .unwrap();

        let err = manager.unregister(&node.node_id).await.unwrap_err();
        assert!(matches!(err, ControlError::NodeHasRoutes { routes: 1, .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
        assert!(manager.get(&node.node_id).await.is_ok());

        store.delete_route(route.id).await.unwrap();
        manager.unregister(&node.node_id).await.unwrap();
    }
}
