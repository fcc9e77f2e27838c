//! Route definitions and their remote port assignment

use crate::error::ControlError;
use crate::models::{NewRoute, Route, RouteDraft, RouteId, DEFAULT_MAX_CONNECTIONS};
use crate::orchestrator::TunnelOrchestrator;
use crate::port_allocator::{PortAllocator, PortRange};
use crate::storage::{NodeStore, RouteChange, RouteStore};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

/// Editable route fields; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct RouteUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub max_connections: Option<u32>,
}

pub struct RouteManager {
    routes: Arc<dyn RouteStore>,
    nodes: Arc<dyn NodeStore>,
    allocator: Arc<PortAllocator>,
    orchestrator: Arc<TunnelOrchestrator>,
    port_range: PortRange,
    // Serializes the local endpoint check with the insert
    create_lock: tokio::sync::Mutex<()>,
}

impl RouteManager {
    pub fn new(
        routes: Arc<dyn RouteStore>,
        nodes: Arc<dyn NodeStore>,
        allocator: Arc<PortAllocator>,
        orchestrator: Arc<TunnelOrchestrator>,
        port_range: PortRange,
    ) -> Self {
        Self {
            routes,
            nodes,
            allocator,
            orchestrator,
            port_range,
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn port_range(&self) -> PortRange {
        self.port_range
    }

    /// Create a route, allocating its remote port unless one was requested
    pub async fn create(&self, new: NewRoute) -> Result<Route, ControlError> {
        if new.name.trim().is_empty() {
            return Err(ControlError::InvalidInput("route name is required".into()));
        }
        if new.local_ip.parse::<IpAddr>().is_err() {
            return Err(ControlError::InvalidInput(format!(
                "invalid local ip: {}",
                new.local_ip
            )));
        }
        if new.local_port == 0 {
            return Err(ControlError::InvalidInput("local port must be non-zero".into()));
        }
        if self.nodes.get_node(&new.node_id).await?.is_none() {
            return Err(ControlError::NodeNotFound(new.node_id));
        }

        let _guard = self.create_lock.lock().await;
        if self
            .routes
            .find_by_local_endpoint(&new.node_id, &new.local_ip, new.local_port)
            .await?
            .is_some()
        {
            return Err(ControlError::DuplicateLocalEndpoint {
                node_id: new.node_id,
                ip: new.local_ip,
                port: new.local_port,
            });
        }

        let reservation = match new.remote_port {
            Some(port) => self.allocator.reserve(port).await?,
            None => self.allocator.allocate(self.port_range).await?,
        };

        let route = self
            .routes
            .insert_route(RouteDraft {
                name: new.name,
                description: new.description,
                node_id: new.node_id,
                local_ip: new.local_ip,
                local_port: new.local_port,
                remote_port: reservation.port(),
                protocol: new.protocol,
                max_connections: new.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            })
            .await?;
        // Stored now, the pending hold can go
        drop(reservation);

        info!(
            route_id = route.id,
            node_id = %route.node_id,
            remote_port = route.remote_port,
            "Route created"
        );
        Ok(route)
    }

    pub async fn get(&self, id: RouteId) -> Result<Route, ControlError> {
        self.routes
            .get_route(id)
            .await?
            .ok_or(ControlError::RouteNotFound(id))
    }

    pub async fn list(&self) -> Result<Vec<Route>, ControlError> {
        Ok(self.routes.list_routes().await?)
    }

    pub async fn list_for_node(&self, node_id: &str) -> Result<Vec<Route>, ControlError> {
        Ok(self.routes.list_routes_for_node(node_id).await?)
    }

    pub async fn update(&self, id: RouteId, update: RouteUpdate) -> Result<Route, ControlError> {
        let change = RouteChange::Details {
            name: update.name,
            description: update.description,
            max_connections: update.max_connections,
        };
        self.apply(id, change).await
    }

    /// Record per-route traffic reported outside the engine
    pub async fn record_traffic(
        &self,
        id: RouteId,
        bytes_in: u64,
        bytes_out: u64,
    ) -> Result<Route, ControlError> {
        self.apply(id, RouteChange::AddTraffic { bytes_in, bytes_out })
            .await
    }

    async fn apply(&self, id: RouteId, change: RouteChange) -> Result<Route, ControlError> {
        self.routes
            .apply_route_change(id, change)
            .await?
            .map(|applied| applied.current)
            .ok_or(ControlError::RouteNotFound(id))
    }

    /// Delete a route, stopping its tunnel first. The remote port is freed.
    pub async fn delete(&self, id: RouteId) -> Result<(), ControlError> {
        self.get(id).await?;
        if self.orchestrator.is_bound(id) {
            self.orchestrator.stop(id).await?;
        }
        if !self.routes.delete_route(id).await? {
            return Err(ControlError::RouteNotFound(id));
        }
        info!(route_id = id, "Route deleted");
        Ok(())
    }
}
