//! Wiring of the control plane components

use crate::connection::ConnectionRegistry;
use crate::dispatcher::MessageDispatcher;
use crate::liveness::{LivenessConfig, LivenessMonitor};
use crate::nodes::NodeManager;
use crate::orchestrator::{OrchestratorConfig, TunnelOrchestrator};
use crate::port_allocator::{PortAllocator, PortRange, DEFAULT_RANDOM_ATTEMPTS};
use crate::routes::RouteManager;
use crate::storage::{MemoryStore, NodeStatusStore, NodeStore, RouteStore};
use portway_engine::TunnelEngine;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub port_range: PortRange,
    pub max_random_attempts: usize,
    pub liveness: LivenessConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            max_random_attempts: DEFAULT_RANDOM_ATTEMPTS,
            liveness: LivenessConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// Every control plane component, sharing one set of stores
#[derive(Clone)]
pub struct ControlPlane {
    pub registry: Arc<ConnectionRegistry>,
    pub liveness: Arc<LivenessMonitor>,
    pub allocator: Arc<PortAllocator>,
    pub orchestrator: Arc<TunnelOrchestrator>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub nodes: Arc<NodeManager>,
    pub routes: Arc<RouteManager>,
    pub statuses: Arc<dyn NodeStatusStore>,
}

impl ControlPlane {
    pub fn new(
        node_store: Arc<dyn NodeStore>,
        route_store: Arc<dyn RouteStore>,
        status_store: Arc<dyn NodeStatusStore>,
        engine: Arc<dyn TunnelEngine>,
        config: ControlPlaneConfig,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let liveness = Arc::new(LivenessMonitor::new(
            registry.clone(),
            node_store.clone(),
            config.liveness.clone(),
        ));
        let allocator = Arc::new(PortAllocator::with_attempts(
            route_store.clone(),
            config.max_random_attempts,
        ));
        let orchestrator = Arc::new(TunnelOrchestrator::new(
            engine,
            route_store.clone(),
            node_store.clone(),
            registry.clone(),
            config.orchestrator.clone(),
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(
            registry.clone(),
            liveness.clone(),
            node_store.clone(),
            status_store.clone(),
        ));
        let nodes = Arc::new(NodeManager::new(
            node_store.clone(),
            route_store.clone(),
            registry.clone(),
            liveness.clone(),
        ));
        let routes = Arc::new(RouteManager::new(
            route_store,
            node_store,
            allocator.clone(),
            orchestrator.clone(),
            config.port_range,
        ));

        Self {
            registry,
            liveness,
            allocator,
            orchestrator,
            dispatcher,
            nodes,
            routes,
            statuses: status_store,
        }
    }

    /// Control plane over a single [`MemoryStore`]
    pub fn in_memory(engine: Arc<dyn TunnelEngine>, config: ControlPlaneConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(store.clone(), store.clone(), store, engine, config)
    }
}
