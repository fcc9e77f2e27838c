//! Fakes shared by the control plane integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use portway_control::{
    Applied, ChannelError, ChannelId, ControlPlane, ControlPlaneConfig, MemoryStore, NewNode,
    NewRoute, Node, NodeChange, NodeChannel, NodeStore, PortRange, Route, RouteChange,
    RouteDraft, RouteId, RouteStore, StorageError,
};
use portway_engine::{
    CreateTunnelRequest, EngineError, EngineTunnel, EngineTunnelStatus, TrafficStats,
    TunnelEngine,
};
use portway_proto::{Frame, FrameCodec, Protocol};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NODE: &str = "node_test123456789";

/// Engine that hands out `t1`, `t2`, ... and can be told to fail
#[derive(Default)]
pub struct FakeEngine {
    pub creates: AtomicUsize,
    pub deletes: Mutex<Vec<String>>,
    pub requests: Mutex<Vec<CreateTunnelRequest>>,
    pub fail_create: AtomicBool,
    pub fail_delete: AtomicBool,
    pub report_failed: AtomicBool,
    pub create_delay: Mutex<Option<Duration>>,
    /// Public port the engine reports instead of the requested one
    pub public_port: Mutex<Option<u16>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelEngine for FakeEngine {
    async fn create_tunnel(
        &self,
        request: CreateTunnelRequest,
    ) -> Result<EngineTunnel, EngineError> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::Status {
                status: 500,
                body: "engine down".into(),
            });
        }
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request);
        Ok(EngineTunnel {
            tunnel_id: format!("t{}", n),
            public_url: Some(format!("https://t{}.example", n)),
            status: "active".into(),
            message: None,
            public_port: *self.public_port.lock().unwrap(),
        })
    }

    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<bool, EngineError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(EngineError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.deletes.lock().unwrap().push(tunnel_id.to_string());
        Ok(true)
    }

    async fn tunnel_status(&self, tunnel_id: &str) -> Result<EngineTunnelStatus, EngineError> {
        let status = if self.report_failed.load(Ordering::SeqCst) {
            "error"
        } else {
            "active"
        };
        Ok(EngineTunnelStatus {
            tunnel_id: Some(tunnel_id.to_string()),
            status: status.into(),
            connections: 2,
            uptime: 60,
        })
    }

    async fn traffic_stats(&self, tunnel_id: &str) -> Result<TrafficStats, EngineError> {
        Ok(TrafficStats {
            tunnel_id: Some(tunnel_id.to_string()),
            bytes_in: 4096,
            bytes_out: 1024,
            request_count: 12,
            last_activity: 1_700_000_000_000,
        })
    }

    async fn health(&self) -> Result<bool, EngineError> {
        Ok(true)
    }
}

/// Channel that keeps every text frame it is given
pub struct TestChannel {
    id: ChannelId,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl TestChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::new(),
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|t| FrameCodec::decode(t).unwrap())
            .collect()
    }
}

impl NodeChannel for TestChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub fn plane(engine: Arc<FakeEngine>, range: PortRange) -> ControlPlane {
    ControlPlane::in_memory(
        engine,
        ControlPlaneConfig {
            port_range: range,
            ..Default::default()
        },
    )
}

pub async fn register_node(plane: &ControlPlane, node_id: &str) {
    plane
        .nodes
        .register(NewNode {
            node_id: Some(node_id.to_string()),
            name: "edge".to_string(),
            owner_id: 42,
            ..Default::default()
        })
        .await
        .unwrap();
}

pub fn route_request(node_id: &str, local_port: u16) -> NewRoute {
    NewRoute {
        name: format!("svc-{}", local_port),
        description: None,
        node_id: node_id.to_string(),
        local_ip: "127.0.0.1".to_string(),
        local_port,
        remote_port: None,
        protocol: Protocol::Tcp,
        max_connections: None,
    }
}

/// Store that can hold back its next node or route change, letting another
/// writer land while a read-modify-write would be in flight
pub struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
    hold_node_change: AtomicBool,
    hold_route_change: AtomicBool,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            delay,
            hold_node_change: AtomicBool::new(false),
            hold_route_change: AtomicBool::new(false),
        })
    }

    pub fn hold_next_node_change(&self) {
        self.hold_node_change.store(true, Ordering::SeqCst);
    }

    pub fn hold_next_route_change(&self) {
        self.hold_route_change.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeStore for SlowStore {
    async fn insert_node(&self, node: Node) -> Result<(), StorageError> {
        self.inner.insert_node(node).await
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<Node>, StorageError> {
        self.inner.get_node(node_id).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StorageError> {
        self.inner.list_nodes().await
    }

    async fn apply_node_change(
        &self,
        node_id: &str,
        change: NodeChange,
    ) -> Result<Option<Applied<Node>>, StorageError> {
        if self.hold_node_change.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.apply_node_change(node_id, change).await
    }

    async fn delete_node(&self, node_id: &str) -> Result<bool, StorageError> {
        self.inner.delete_node(node_id).await
    }
}

#[async_trait]
impl RouteStore for SlowStore {
    async fn insert_route(&self, draft: RouteDraft) -> Result<Route, StorageError> {
        self.inner.insert_route(draft).await
    }

    async fn get_route(&self, id: RouteId) -> Result<Option<Route>, StorageError> {
        self.inner.get_route(id).await
    }

    async fn list_routes(&self) -> Result<Vec<Route>, StorageError> {
        self.inner.list_routes().await
    }

    async fn list_routes_for_node(&self, node_id: &str) -> Result<Vec<Route>, StorageError> {
        self.inner.list_routes_for_node(node_id).await
    }

    async fn apply_route_change(
        &self,
        id: RouteId,
        change: RouteChange,
    ) -> Result<Option<Applied<Route>>, StorageError> {
        if self.hold_route_change.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.apply_route_change(id, change).await
    }

    async fn delete_route(&self, id: RouteId) -> Result<bool, StorageError> {
        self.inner.delete_route(id).await
    }

    async fn find_by_local_endpoint(
        &self,
        node_id: &str,
        local_ip: &str,
        local_port: u16,
    ) -> Result<Option<Route>, StorageError> {
        self.inner
            .find_by_local_endpoint(node_id, local_ip, local_port)
            .await
    }

    async fn is_remote_port_used(&self, port: u16) -> Result<bool, StorageError> {
        self.inner.is_remote_port_used(port).await
    }

    async fn used_remote_ports(&self, start: u16, end: u16) -> Result<HashSet<u16>, StorageError> {
        self.inner.used_remote_ports(start, end).await
    }
}

/// Control plane whose node and route rows live in `store`
pub fn plane_over(engine: Arc<FakeEngine>, store: Arc<SlowStore>) -> ControlPlane {
    ControlPlane::new(
        store.clone(),
        store,
        Arc::new(MemoryStore::new()),
        engine,
        ControlPlaneConfig::default(),
    )
}
