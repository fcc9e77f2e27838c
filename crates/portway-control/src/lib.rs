//! Control plane for node connections and tunnel orchestration
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod liveness;
pub mod maintenance;
pub mod models;
pub mod nodes;
pub mod orchestrator;
pub mod plane;
pub mod port_allocator;
pub mod routes;
pub mod storage;
pub mod task_tracker;

pub use connection::{send_frame, ChannelId, ConnectionRegistry, NodeChannel, NodeConnection};
pub use dispatcher::{AlertThresholds, MessageDispatcher};
pub use error::{ChannelError, ControlError, ErrorKind};
pub use liveness::{LivenessConfig, LivenessMonitor, OfflineReason, SweepReport, Transition};
pub use maintenance::{Maintenance, MaintenanceConfig};
pub use models::{
    NewNode, NewRoute, Node, NodeState, NodeStatusSnapshot, Route, RouteDraft, RouteId,
    RouteStatus,
};
pub use nodes::{NodeManager, NodeUpdate};
pub use orchestrator::{
    HealthReport, OrchestratorConfig, StartOutcome, StopAllReport, StopOutcome,
    TunnelBinding, TunnelOrchestrator,
};
pub use plane::{ControlPlane, ControlPlaneConfig};
pub use port_allocator::{PortAllocator, PortRange, PortReservation};
pub use routes::{RouteManager, RouteUpdate};
pub use storage::{
    Applied, MemoryStore, NodeChange, NodeStatusStore, NodeStore, RouteChange, RouteStore,
    StorageError,
};
pub use task_tracker::TaskTracker;
