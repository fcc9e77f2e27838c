//! Routing of inbound node frames
//!
//! The transport layer owns the socket; it hands each decoded text frame to
//! [`MessageDispatcher::handle_text`] and sends back whatever reply comes
//! out. Connection lifecycle (bind, disconnect) also passes through here so
//! registry and liveness updates stay in one place.

use crate::connection::{send_frame, ChannelId, ConnectionRegistry, NodeChannel};
use crate::error::ControlError;
use crate::liveness::{LivenessMonitor, OfflineReason, Transition};
use crate::models::NodeStatusSnapshot;
use crate::storage::{NodeChange, NodeStatusStore, NodeStore};
use chrono::Utc;
use portway_proto::{
    ControlMessage, Frame, FrameCodec, HardwareStatusPayload, StatusUpdatePayload,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Warning and critical levels for node telemetry
#[derive(Debug, Clone, Copy)]
pub struct AlertThresholds {
    pub cpu: (f64, f64),
    pub memory: (f64, f64),
    pub disk: (f64, f64),
    pub ping_ms: (u32, u32),
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu: (80.0, 95.0),
            memory: (85.0, 95.0),
            disk: (90.0, 98.0),
            ping_ms: (200, 500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Normal,
    Warning,
    Critical,
}

fn grade<T: PartialOrd>(value: Option<T>, (warning, critical): (T, T)) -> Severity {
    match value {
        Some(v) if v >= critical => Severity::Critical,
        Some(v) if v >= warning => Severity::Warning,
        _ => Severity::Normal,
    }
}

impl AlertThresholds {
    /// Fill the warning and error counters of a snapshot
    pub fn evaluate(&self, snapshot: &mut NodeStatusSnapshot) {
        let checks = [
            ("cpu", grade(snapshot.cpu_usage, self.cpu)),
            ("memory", grade(snapshot.memory_usage, self.memory)),
            ("disk", grade(snapshot.disk_usage, self.disk)),
            ("ping", grade(snapshot.ping_latency, self.ping_ms)),
        ];
        for (metric, severity) in checks {
            match severity {
                Severity::Critical => {
                    snapshot.error_count += 1;
                    warn!(node_id = %snapshot.node_id, metric, "Node telemetry critical");
                }
                Severity::Warning => {
                    snapshot.warning_count += 1;
                    warn!(node_id = %snapshot.node_id, metric, "Node telemetry above warning level");
                }
                Severity::Normal => {}
            }
        }
    }
}

pub struct MessageDispatcher {
    registry: Arc<ConnectionRegistry>,
    liveness: Arc<LivenessMonitor>,
    nodes: Arc<dyn NodeStore>,
    statuses: Arc<dyn NodeStatusStore>,
    thresholds: AlertThresholds,
}

impl MessageDispatcher {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        liveness: Arc<LivenessMonitor>,
        nodes: Arc<dyn NodeStore>,
        statuses: Arc<dyn NodeStatusStore>,
    ) -> Self {
        Self {
            registry,
            liveness,
            nodes,
            statuses,
            thresholds: AlertThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Bind a freshly opened channel to a registered node
    pub async fn on_connect(
        &self,
        node_id: &str,
        channel: Arc<dyn NodeChannel>,
        client_addr: Option<String>,
    ) -> Result<(), ControlError> {
        if self.nodes.get_node(node_id).await?.is_none() {
            return Err(ControlError::NodeNotFound(node_id.to_string()));
        }

        self.registry.register(node_id, channel.clone());
        self.liveness.mark_online(node_id, client_addr).await?;

        if let Err(e) = send_frame(channel.as_ref(), &Frame::info("connected")) {
            warn!(node_id = %node_id, "Welcome frame not delivered: {}", e);
        }
        info!(node_id = %node_id, channel = %channel.id(), "Node channel bound");
        Ok(())
    }

    /// Channel closed or errored
    pub async fn on_disconnect(&self, node_id: &str, channel_id: ChannelId) {
        if !self.registry.unregister(node_id, channel_id) {
            // A newer channel owns the node now
            return;
        }
        if let Err(e) = self
            .liveness
            .mark_offline(node_id, OfflineReason::ChannelClosed)
            .await
        {
            warn!(node_id = %node_id, "Failed to record node offline: {}", e);
        }
    }

    /// Decode and dispatch one text frame, returning the reply to send back
    pub async fn handle_text(&self, node_id: &str, text: &str) -> Option<Frame> {
        let frame = match FrameCodec::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node_id = %node_id, "Rejected frame: {}", e);
                return Some(Frame::error(format!("invalid message: {}", e)));
            }
        };

        match self.dispatch(node_id, frame).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(node_id = %node_id, "Failed to process frame: {}", e);
                Some(Frame::error(format!("failed to process message: {}", e)))
            }
        }
    }

    pub async fn dispatch(&self, node_id: &str, frame: Frame) -> Result<Option<Frame>, ControlError> {
        debug!(node_id = %node_id, ty = %frame.message_type(), "Dispatching frame");

        if !frame.body.is_inbound() {
            return Err(ControlError::InvalidInput(format!(
                "unexpected message type from node: {}",
                frame.message_type()
            )));
        }

        match frame.body {
            ControlMessage::Register(payload) => {
                if payload.node_id != node_id {
                    return Err(ControlError::InvalidInput(format!(
                        "channel is bound to {}, not {}",
                        node_id, payload.node_id
                    )));
                }
                Ok(Some(Frame::info("already registered")))
            }
            ControlMessage::Heartbeat(_) => {
                if self.liveness.record_heartbeat(node_id).await? == Transition::UnknownNode {
                    return Err(ControlError::NodeNotFound(node_id.to_string()));
                }
                Ok(Some(Frame::heartbeat_ack()))
            }
            ControlMessage::StatusUpdate(update) => {
                self.apply_status_update(node_id, update).await?;
                Ok(None)
            }
            ControlMessage::HardwareStatus(report) => {
                self.record_hardware_status(node_id, &report).await?;
                Ok(Some(Frame::with_message(
                    ControlMessage::HardwareStatusAck,
                    "hardware status received",
                )))
            }
            ControlMessage::DataResponse(payload) => {
                debug!(
                    node_id = %node_id,
                    connection_id = %payload.connection_id,
                    bytes = payload.data.as_ref().map(|d| d.len()).unwrap_or(0),
                    "Data response from node"
                );
                Ok(None)
            }
            ControlMessage::ConnectionResponse(payload) => {
                debug!(
                    node_id = %node_id,
                    connection_id = %payload.connection_id,
                    action = %payload.action,
                    "Connection response from node"
                );
                Ok(None)
            }
            // Outbound-only types are refused above
            _ => Ok(None),
        }
    }

    async fn apply_status_update(
        &self,
        node_id: &str,
        update: StatusUpdatePayload,
    ) -> Result<(), ControlError> {
        let change = NodeChange::Traffic {
            connections: update.connections,
            bytes_in: update.bytes_in,
            bytes_out: update.bytes_out,
        };
        let applied = self
            .nodes
            .apply_node_change(node_id, change)
            .await?
            .ok_or_else(|| ControlError::NodeNotFound(node_id.to_string()))?;

        // A node reporting over a live channel is online
        if !applied.current.is_online() && self.registry.is_connected(node_id) {
            self.liveness.mark_online(node_id, None).await?;
        }
        Ok(())
    }

    async fn record_hardware_status(
        &self,
        node_id: &str,
        report: &HardwareStatusPayload,
    ) -> Result<NodeStatusSnapshot, ControlError> {
        let mut snapshot = NodeStatusSnapshot::from_report(node_id, report, Utc::now());
        self.thresholds.evaluate(&mut snapshot);
        Ok(self.statuses.record_status(snapshot).await?)
    }
}
