//! Tunnel lifecycle against the external engine
//!
//! A route is ACTIVE exactly when a binding to an engine tunnel exists.
//! Binding slots move through `Starting`, `Bound` and `Stopping` under
//! per-route atomic map operations, so two concurrent starts never create
//! two engine tunnels and a failed stop never forgets a live one.

use crate::connection::ConnectionRegistry;
use crate::error::ControlError;
use crate::models::{Route, RouteId, RouteStatus};
use crate::storage::{NodeStore, RouteChange, RouteStore};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use portway_engine::{
    CreateTunnelRequest, EngineError, EngineTunnel, EngineTunnelStatus, TrafficStats,
    TunnelEngine,
};
use portway_proto::{ControlMessage, Frame, TunnelStartPayload, TunnelStopPayload};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub engine_timeout: Duration,
    /// Mark the route ERROR when the engine refuses to start its tunnel
    pub mark_error_on_start_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            engine_timeout: Duration::from_secs(30),
            mark_error_on_start_failure: false,
        }
    }
}

/// Association between a route and its engine tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelBinding {
    pub route_id: RouteId,
    pub tunnel_id: String,
    pub public_url: Option<String>,
    pub bound_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum BindingSlot {
    Starting,
    Bound(TunnelBinding),
    Stopping(TunnelBinding),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(TunnelBinding),
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped(TunnelBinding),
    NotRunning,
}

#[derive(Debug, Default, Clone)]
pub struct StopAllReport {
    pub stopped: Vec<RouteId>,
    pub failed: Vec<(RouteId, String)>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub failed_routes: Vec<RouteId>,
}

pub struct TunnelOrchestrator {
    engine: Arc<dyn TunnelEngine>,
    routes: Arc<dyn RouteStore>,
    nodes: Arc<dyn NodeStore>,
    registry: Arc<ConnectionRegistry>,
    bindings: DashMap<RouteId, BindingSlot>,
    config: OrchestratorConfig,
}

impl TunnelOrchestrator {
    pub fn new(
        engine: Arc<dyn TunnelEngine>,
        routes: Arc<dyn RouteStore>,
        nodes: Arc<dyn NodeStore>,
        registry: Arc<ConnectionRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            engine,
            routes,
            nodes,
            registry,
            bindings: DashMap::new(),
            config,
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        match tokio::time::timeout(self.config.engine_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.config.engine_timeout)),
        }
    }

    async fn load_route(&self, route_id: RouteId) -> Result<Route, ControlError> {
        self.routes
            .get_route(route_id)
            .await?
            .ok_or(ControlError::RouteNotFound(route_id))
    }

    pub async fn start(&self, route_id: RouteId) -> Result<StartOutcome, ControlError> {
        let claimed = match self.bindings.entry(route_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(BindingSlot::Starting);
                true
            }
        };
        if !claimed {
            warn!(route_id, "Tunnel already running or in transition, ignoring start");
            return Ok(StartOutcome::AlreadyRunning);
        }

        match self.start_claimed(route_id).await {
            Ok(binding) => Ok(StartOutcome::Started(binding)),
            Err(e) => {
                self.bindings
                    .remove_if(&route_id, |_, slot| matches!(slot, BindingSlot::Starting));
                Err(e)
            }
        }
    }

    async fn start_claimed(&self, route_id: RouteId) -> Result<TunnelBinding, ControlError> {
        let route = self.load_route(route_id).await?;
        let node = self
            .nodes
            .get_node(&route.node_id)
            .await?
            .ok_or_else(|| ControlError::NodeNotFound(route.node_id.clone()))?;

        let request = CreateTunnelRequest {
            user_id: node.owner_id.to_string(),
            local_address: route.local_ip.clone(),
            local_port: route.local_port,
            protocol: route.protocol,
            subdomain: None,
        };

        let tunnel = match self.bounded(self.engine.create_tunnel(request)).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                error!(route_id, "Engine failed to start tunnel: {}", e);
                if self.config.mark_error_on_start_failure {
                    self.set_status(route_id, RouteStatus::Inactive, RouteStatus::Error)
                        .await;
                }
                return Err(e.into());
            }
        };

        let binding = TunnelBinding {
            route_id,
            tunnel_id: tunnel.tunnel_id.clone(),
            public_url: tunnel.public_url.clone(),
            bound_at: Utc::now(),
        };
        // The slot stays `Starting` until the route row is ACTIVE, so a stop
        // can never land between the two
        let route = match self.commit_active(route, &tunnel).await {
            Ok(route) => route,
            Err(e) => {
                self.compensate_start(&binding).await;
                return Err(e);
            }
        };
        self.bindings
            .insert(route_id, BindingSlot::Bound(binding.clone()));

        info!(
            route_id,
            tunnel_id = %binding.tunnel_id,
            remote_port = route.remote_port,
            "Tunnel started"
        );
        self.notify_start(&route);
        Ok(binding)
    }

    async fn commit_active(
        &self,
        route: Route,
        tunnel: &EngineTunnel,
    ) -> Result<Route, ControlError> {
        let remote_port = match tunnel.public_port {
            Some(port) if port != route.remote_port => {
                self.adopt_public_port(&route, port).await?
            }
            _ => route.remote_port,
        };

        let change = RouteChange::Activated {
            public_url: tunnel.public_url.clone(),
            remote_port,
        };
        self.routes
            .apply_route_change(route.id, change)
            .await?
            .map(|applied| applied.current)
            .ok_or(ControlError::RouteNotFound(route.id))
    }

    /// The engine picked its own public port; keep ours if another route holds it
    async fn adopt_public_port(&self, route: &Route, port: u16) -> Result<u16, ControlError> {
        if self.routes.is_remote_port_used(port).await? {
            warn!(
                route_id = route.id,
                requested = route.remote_port,
                assigned = port,
                "Engine assigned a public port held by another route, keeping the allocated one"
            );
            return Ok(route.remote_port);
        }
        info!(
            route_id = route.id,
            requested = route.remote_port,
            assigned = port,
            "Engine assigned a different public port"
        );
        Ok(port)
    }

    /// Undo an engine tunnel whose route could not be committed
    async fn compensate_start(&self, binding: &TunnelBinding) {
        match self.bounded(self.engine.delete_tunnel(&binding.tunnel_id)).await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                self.bindings
                    .insert(binding.route_id, BindingSlot::Bound(binding.clone()));
                error!(
                    route_id = binding.route_id,
                    tunnel_id = %binding.tunnel_id,
                    "Could not roll back engine tunnel, keeping binding for a later stop"
                );
            }
        }
    }

    fn notify_start(&self, route: &Route) {
        let frame = Frame::with_message(
            ControlMessage::TunnelStart(TunnelStartPayload {
                route_id: route.id,
                local_ip: route.local_ip.clone(),
                local_port: route.local_port,
                remote_port: route.remote_port,
                protocol: route.protocol,
            }),
            "start tunnel",
        );
        if let Err(e) = self.registry.send(&route.node_id, &frame) {
            warn!(node_id = %route.node_id, route_id = route.id, "tunnel_start not delivered: {}", e);
        }
    }

    fn notify_stop(&self, node_id: &str, route_id: RouteId, remote_port: u16) {
        let frame = Frame::with_message(
            ControlMessage::TunnelStop(TunnelStopPayload {
                route_id,
                remote_port,
            }),
            "stop tunnel",
        );
        if let Err(e) = self.registry.send(node_id, &frame) {
            warn!(node_id = %node_id, route_id, "tunnel_stop not delivered: {}", e);
        }
    }

    pub async fn stop(&self, route_id: RouteId) -> Result<StopOutcome, ControlError> {
        let binding = match self.bindings.get_mut(&route_id) {
            None => None,
            Some(mut slot) => match slot.value().clone() {
                BindingSlot::Bound(binding) => {
                    *slot = BindingSlot::Stopping(binding.clone());
                    Some(binding)
                }
                BindingSlot::Starting | BindingSlot::Stopping(_) => {
                    return Err(ControlError::TunnelBusy(route_id));
                }
            },
        };

        let Some(binding) = binding else {
            warn!(route_id, "Stop requested for route without a running tunnel");
            return Ok(StopOutcome::NotRunning);
        };

        let deleted = self.bounded(self.engine.delete_tunnel(&binding.tunnel_id)).await;
        let failure = match deleted {
            Ok(true) => None,
            Ok(false) => Some(ControlError::Engine(EngineError::Rejected(format!(
                "engine refused to delete tunnel {}",
                binding.tunnel_id
            )))),
            Err(e) => Some(ControlError::Engine(e)),
        };

        if let Some(err) = failure {
            error!(route_id, tunnel_id = %binding.tunnel_id, "Failed to stop tunnel: {}", err);
            self.bindings
                .insert(route_id, BindingSlot::Bound(binding));
            return Err(err);
        }

        self.bindings.remove(&route_id);
        info!(route_id, tunnel_id = %binding.tunnel_id, "Tunnel stopped");

        match self
            .routes
            .apply_route_change(route_id, RouteChange::Deactivated)
            .await
        {
            Ok(Some(applied)) => {
                let route = applied.current;
                self.notify_stop(&route.node_id, route_id, route.remote_port);
            }
            Ok(None) => debug!(route_id, "Stopped tunnel for a deleted route"),
            Err(e) => error!(route_id, "Tunnel stopped but route status not saved: {}", e),
        }

        Ok(StopOutcome::Stopped(binding))
    }

    /// Engine status of the route's tunnel, `None` when not bound
    pub async fn status(
        &self,
        route_id: RouteId,
    ) -> Result<Option<EngineTunnelStatus>, ControlError> {
        let Some(binding) = self.binding(route_id) else {
            return Ok(None);
        };
        let status = self
            .bounded(self.engine.tunnel_status(&binding.tunnel_id))
            .await?;
        Ok(Some(status))
    }

    pub async fn traffic_stats(
        &self,
        route_id: RouteId,
    ) -> Result<Option<TrafficStats>, ControlError> {
        let Some(binding) = self.binding(route_id) else {
            return Ok(None);
        };
        let stats = self
            .bounded(self.engine.traffic_stats(&binding.tunnel_id))
            .await?;
        Ok(Some(stats))
    }

    /// Best-effort stop of every bound tunnel
    pub async fn stop_all(&self) -> StopAllReport {
        let mut report = StopAllReport::default();
        for route_id in self.bound_routes() {
            match self.stop(route_id).await {
                Ok(StopOutcome::Stopped(_)) => report.stopped.push(route_id),
                Ok(StopOutcome::NotRunning) => {}
                Err(e) => report.failed.push((route_id, e.to_string())),
            }
        }
        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "Some tunnels could not be stopped");
        }
        report
    }

    /// Mark routes ERROR whose engine tunnel reports a failure
    pub async fn check_health(&self) -> HealthReport {
        let mut report = HealthReport::default();
        for route_id in self.bound_routes() {
            let Some(binding) = self.binding(route_id) else {
                continue;
            };
            report.checked += 1;

            let failed = match self.bounded(self.engine.tunnel_status(&binding.tunnel_id)).await {
                Ok(status) => status.is_failed(),
                Err(EngineError::Status { status: 404, .. }) => true,
                Err(e) => {
                    warn!(route_id, "Tunnel health check inconclusive: {}", e);
                    false
                }
            };

            if failed
                && self
                    .set_status(route_id, RouteStatus::Active, RouteStatus::Error)
                    .await
            {
                warn!(route_id, tunnel_id = %binding.tunnel_id, "Engine reports tunnel failure");
                report.failed_routes.push(route_id);
            }
        }
        report
    }

    /// Copy engine traffic counters onto bound routes
    pub async fn refresh_traffic(&self) -> usize {
        let mut refreshed = 0;
        for route_id in self.bound_routes() {
            let stats = match self.traffic_stats(route_id).await {
                Ok(Some(stats)) => stats,
                Ok(None) => continue,
                Err(e) => {
                    debug!(route_id, "Traffic refresh skipped: {}", e);
                    continue;
                }
            };

            let change = RouteChange::SetTraffic {
                bytes_in: stats.bytes_in,
                bytes_out: stats.bytes_out,
                last_activity: (stats.last_activity > 0)
                    .then(|| Utc.timestamp_millis_opt(stats.last_activity).single())
                    .flatten(),
            };
            match self.routes.apply_route_change(route_id, change).await {
                Ok(Some(_)) => refreshed += 1,
                Ok(None) => {}
                Err(e) => warn!(route_id, "Failed to save traffic stats: {}", e),
            }
        }
        refreshed
    }

    /// Move the route from `from` to `to`; false when it was in another state
    async fn set_status(&self, route_id: RouteId, from: RouteStatus, to: RouteStatus) -> bool {
        match self
            .routes
            .apply_route_change(route_id, RouteChange::Status { from, to })
            .await
        {
            Ok(Some(applied)) => applied.current.status == to && applied.previous.status == from,
            Ok(None) => false,
            Err(e) => {
                error!(route_id, "Failed to update route status: {}", e);
                false
            }
        }
    }

    fn bound_routes(&self) -> Vec<RouteId> {
        let mut ids: Vec<RouteId> = self
            .bindings
            .iter()
            .filter(|slot| matches!(slot.value(), BindingSlot::Bound(_)))
            .map(|slot| *slot.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// The route's binding, also while a stop is in flight
    pub fn binding(&self, route_id: RouteId) -> Option<TunnelBinding> {
        self.bindings.get(&route_id).and_then(|slot| match slot.value() {
            BindingSlot::Bound(b) | BindingSlot::Stopping(b) => Some(b.clone()),
            BindingSlot::Starting => None,
        })
    }

    pub fn is_bound(&self, route_id: RouteId) -> bool {
        self.binding(route_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.bound_routes().len()
    }
}
