//! Relay configuration file
//!
//! Every section is optional; missing fields fall back to defaults and
//! command line flags override whatever the file says.

use anyhow::{Context, Result};
use portway_api::{ApiServerConfig, RateLimitConfig};
use portway_control::{
    ControlPlaneConfig, LivenessConfig, MaintenanceConfig, OrchestratorConfig, PortRange,
};
use portway_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub api: ApiSection,
    pub tunnel: TunnelSection,
    pub engine: EngineSection,
    pub rate_limit: RateLimitConfig,
    pub maintenance: MaintenanceSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiSection {
    pub bind_addr: SocketAddr,
    pub enable_cors: bool,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            enable_cors: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TunnelSection {
    pub port_range: PortRange,
    pub max_random_attempts: usize,
    pub heartbeat_interval_secs: u64,
    pub missed_heartbeats: u32,
    pub sweep_interval_secs: u64,
    pub mark_error_on_start_failure: bool,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            port_range: PortRange::default(),
            max_random_attempts: 100,
            heartbeat_interval_secs: 30,
            missed_heartbeats: 3,
            sweep_interval_secs: 300,
            mark_error_on_start_failure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSection {
    pub base_url: String,
    /// Empty means no bearer token
    pub token: String,
    pub timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:18080".to_string(),
            token: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaintenanceSection {
    #[serde(flatten)]
    pub tasks: MaintenanceConfig,
    pub bucket_gc_interval_secs: u64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            tasks: MaintenanceConfig::default(),
            bucket_gc_interval_secs: 300,
        }
    }
}

impl RelayConfig {
    /// Load config from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: RelayConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let range = self.tunnel.port_range;
        PortRange::new(range.start, range.end)
            .with_context(|| format!("Invalid port range {}-{}", range.start, range.end))?;

        let periods = [
            ("tunnel.heartbeat_interval_secs", self.tunnel.heartbeat_interval_secs),
            ("tunnel.sweep_interval_secs", self.tunnel.sweep_interval_secs),
            ("engine.timeout_secs", self.engine.timeout_secs),
            ("maintenance.retention_interval_secs", self.maintenance.tasks.retention_interval_secs),
            ("maintenance.health_check_interval_secs", self.maintenance.tasks.health_check_interval_secs),
            ("maintenance.traffic_refresh_interval_secs", self.maintenance.tasks.traffic_refresh_interval_secs),
            ("maintenance.bucket_gc_interval_secs", self.maintenance.bucket_gc_interval_secs),
            ("rate_limit.api.refill_period_secs", self.rate_limit.api.refill_period_secs),
            ("rate_limit.login.refill_period_secs", self.rate_limit.login.refill_period_secs),
            ("rate_limit.websocket.refill_period_secs", self.rate_limit.websocket.refill_period_secs),
        ];
        for (name, value) in periods {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }

        if self.tunnel.missed_heartbeats == 0 {
            anyhow::bail!("tunnel.missed_heartbeats must be greater than zero");
        }
        if self.engine.base_url.trim().is_empty() {
            anyhow::bail!("engine.base_url is required");
        }
        Ok(())
    }

    pub fn api_server_config(&self) -> ApiServerConfig {
        ApiServerConfig {
            bind_addr: self.api.bind_addr,
            enable_cors: self.api.enable_cors,
            rate_limit: self.rate_limit.clone(),
        }
    }

    pub fn control_plane_config(&self) -> ControlPlaneConfig {
        ControlPlaneConfig {
            port_range: self.tunnel.port_range,
            max_random_attempts: self.tunnel.max_random_attempts,
            liveness: LivenessConfig {
                heartbeat_interval: Duration::from_secs(self.tunnel.heartbeat_interval_secs),
                missed_heartbeats: self.tunnel.missed_heartbeats,
                sweep_interval: Duration::from_secs(self.tunnel.sweep_interval_secs),
            },
            orchestrator: OrchestratorConfig {
                engine_timeout: Duration::from_secs(self.engine.timeout_secs),
                mark_error_on_start_failure: self.tunnel.mark_error_on_start_failure,
            },
        }
    }

    /// Copy safe to print; a configured engine token shows as `***`
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.engine.token.trim().is_empty() {
            config.engine.token = "***".to_string();
        }
        config
    }

    pub fn engine_config(&self) -> EngineConfig {
        let token = self.engine.token.trim();
        EngineConfig {
            base_url: self.engine.base_url.clone(),
            token: (!token.is_empty()).then(|| token.to_string()),
            timeout: Duration::from_secs(self.engine.timeout_secs),
        }
    }
}

/// Parse a `START-END` port range
pub fn parse_port_range(value: &str) -> Result<PortRange> {
    let (start, end) = value
        .split_once('-')
        .with_context(|| format!("Port range must look like START-END, got '{}'", value))?;
    let start: u16 = start
        .trim()
        .parse()
        .with_context(|| format!("Invalid range start '{}'", start))?;
    let end: u16 = end
        .trim()
        .parse()
        .with_context(|| format!("Invalid range end '{}'", end))?;
    Ok(PortRange::new(start, end)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RelayConfig::parse("{}").unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.tunnel.port_range, PortRange { start: 10000, end: 20000 });
        assert_eq!(config.rate_limit.login.capacity, 5);
        assert_eq!(config.maintenance.tasks.status_retention_days, 30);
        assert!(config.engine_config().token.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
api:
  bind_addr: "127.0.0.1:9000"
  enable_cors: false
tunnel:
  port_range: { start: 30000, end: 30100 }
  heartbeat_interval_secs: 10
  missed_heartbeats: 2
engine:
  base_url: "http://engine.internal:18080"
  token: "secret"
  timeout_secs: 5
rate_limit:
  api: { capacity: 50, refill_period_secs: 30 }
maintenance:
  status_retention_days: 7
  bucket_gc_interval_secs: 120
"#;
        let config = RelayConfig::parse(yaml).unwrap();

        assert_eq!(config.api.bind_addr.port(), 9000);
        assert!(!config.api.enable_cors);
        assert_eq!(config.rate_limit.api.capacity, 50);
        assert_eq!(config.rate_limit.login.capacity, 5);
        assert_eq!(config.maintenance.tasks.status_retention_days, 7);
        assert_eq!(config.maintenance.tasks.health_check_interval_secs, 600);
        assert_eq!(config.maintenance.bucket_gc_interval_secs, 120);

        let plane = config.control_plane_config();
        assert_eq!(plane.port_range.size(), 101);
        assert_eq!(plane.liveness.timeout(), Duration::from_secs(20));
        assert_eq!(plane.orchestrator.engine_timeout, Duration::from_secs(5));

        let engine = config.engine_config();
        assert_eq!(engine.token.as_deref(), Some("secret"));
        assert_eq!(engine.base_url, "http://engine.internal:18080");
    }

    #[test]
    fn test_redacted_hides_engine_token() {
        let config = RelayConfig::parse("engine:\n  token: \"secret\"\n").unwrap();
        let rendered = serde_yaml::to_string(&config.redacted()).unwrap();

        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("***"));
        assert_eq!(config.engine.token, "secret");
        assert!(RelayConfig::default().redacted().engine.token.is_empty());
    }

    #[test]
    fn test_validation_errors() {
        assert!(RelayConfig::parse("tunnel:\n  port_range: { start: 200, end: 100 }\n").is_err());
        assert!(RelayConfig::parse("tunnel:\n  sweep_interval_secs: 0\n").is_err());
        assert!(RelayConfig::parse("rate_limit:\n  api: { capacity: 1, refill_period_secs: 0 }\n").is_err());
        assert!(RelayConfig::parse("engine:\n  base_url: \"\"\n").is_err());
        assert!(RelayConfig::parse("api: [not, a, map]").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "api:\n  bind_addr: \"0.0.0.0:7000\"").unwrap();

        let config = RelayConfig::load(file.path()).unwrap();
        assert_eq!(config.api.bind_addr.port(), 7000);

        assert!(RelayConfig::load(Path::new("/nonexistent/portway.yaml")).is_err());
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(
            parse_port_range("10000-10010").unwrap(),
            PortRange { start: 10000, end: 10010 }
        );
        assert!(parse_port_range("10010-10000").is_err());
        assert!(parse_port_range("10000").is_err());
        assert!(parse_port_range("a-b").is_err());
    }
}
