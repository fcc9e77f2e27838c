//! Scheduled upkeep: liveness sweeps, telemetry retention, tunnel health
//! checks and traffic refresh.

use crate::error::ControlError;
use crate::liveness::LivenessMonitor;
use crate::orchestrator::TunnelOrchestrator;
use crate::storage::NodeStatusStore;
use crate::task_tracker::TaskTracker;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub status_retention_days: u32,
    pub retention_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub traffic_refresh_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            status_retention_days: 30,
            retention_interval_secs: 24 * 60 * 60,
            health_check_interval_secs: 600,
            traffic_refresh_interval_secs: 300,
        }
    }
}

pub struct Maintenance {
    liveness: Arc<LivenessMonitor>,
    orchestrator: Arc<TunnelOrchestrator>,
    statuses: Arc<dyn NodeStatusStore>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(
        liveness: Arc<LivenessMonitor>,
        orchestrator: Arc<TunnelOrchestrator>,
        statuses: Arc<dyn NodeStatusStore>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            liveness,
            orchestrator,
            statuses,
            config,
        }
    }

    /// Drop telemetry older than the retention window
    pub async fn prune_status_history(&self) -> Result<u64, ControlError> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.status_retention_days as i64);
        let pruned = self.statuses.prune_before(cutoff).await?;
        if pruned > 0 {
            info!(pruned, "Pruned old node telemetry");
        }
        Ok(pruned)
    }

    /// Schedule every job on `tracker`
    pub fn spawn_all(self: Arc<Self>, tracker: &TaskTracker) {
        let sweep_interval = self.liveness.config().sweep_interval;
        let this = self.clone();
        tracker.spawn_periodic("liveness-sweep", sweep_interval, move || {
            let this = this.clone();
            async move {
                if let Err(e) = this.liveness.sweep().await {
                    error!("Liveness sweep failed: {}", e);
                }
            }
        });

        let this = self.clone();
        tracker.spawn_periodic(
            "status-retention",
            Duration::from_secs(self.config.retention_interval_secs),
            move || {
                let this = this.clone();
                async move {
                    if let Err(e) = this.prune_status_history().await {
                        error!("Telemetry retention failed: {}", e);
                    }
                }
            },
        );

        let this = self.clone();
        tracker.spawn_periodic(
            "tunnel-health",
            Duration::from_secs(self.config.health_check_interval_secs),
            move || {
                let this = this.clone();
                async move {
                    let report = this.orchestrator.check_health().await;
                    if !report.failed_routes.is_empty() {
                        info!(
                            checked = report.checked,
                            failed = report.failed_routes.len(),
                            "Tunnel health check found failures"
                        );
                    }
                }
            },
        );

        let this = self.clone();
        tracker.spawn_periodic(
            "traffic-refresh",
            Duration::from_secs(self.config.traffic_refresh_interval_secs),
            move || {
                let this = this.clone();
                async move {
                    this.orchestrator.refresh_traffic().await;
                }
            },
        );
    }
}
