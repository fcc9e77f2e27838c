//! REST client for the tunneling engine

use crate::types::{CreateTunnelRequest, EngineTunnel, EngineTunnelStatus, TrafficStats};
use crate::{EngineError, TunnelEngine};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Connection settings for the engine API
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    /// Bearer token, sent when present
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:18080".to_string(),
            token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTunnelBody<'a> {
    user_id: &'a str,
    local_address: &'a str,
    local_port: u16,
    protocol: String,
    subdomain: String,
}

/// [`TunnelEngine`] backed by the engine's `/api/v1` REST API
#[derive(Debug, Clone)]
pub struct HttpEngineClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpEngineClient {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        if config.base_url.is_empty() {
            return Err(EngineError::Config("base_url is empty".into()));
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| EngineError::Config("Invalid token format".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    fn map_err(&self, err: reqwest::Error) -> EngineError {
        if err.is_timeout() {
            EngineError::Timeout(self.timeout)
        } else {
            EngineError::Http(err)
        }
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, EngineError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(EngineError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, EngineError> {
        let resp = self
            .http
            .get(self.api_url(path))
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        let resp = Self::check_status(resp).await?;
        resp.json::<T>()
            .await
            .map_err(|e| EngineError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl TunnelEngine for HttpEngineClient {
    async fn create_tunnel(
        &self,
        request: CreateTunnelRequest,
    ) -> Result<EngineTunnel, EngineError> {
        let body = CreateTunnelBody {
            user_id: &request.user_id,
            local_address: &request.local_address,
            local_port: request.local_port,
            protocol: request.protocol.as_str().to_ascii_lowercase(),
            subdomain: request.subdomain_or_default(),
        };

        debug!(
            user_id = %request.user_id,
            local = %format!("{}:{}", request.local_address, request.local_port),
            "Creating engine tunnel"
        );

        let resp = self
            .http
            .post(self.api_url("/tunnels"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        let resp = Self::check_status(resp).await?;
        let tunnel: EngineTunnel = resp
            .json()
            .await
            .map_err(|e| EngineError::InvalidResponse(e.to_string()))?;

        if tunnel.tunnel_id.is_empty() {
            return Err(EngineError::Rejected(
                tunnel
                    .message
                    .unwrap_or_else(|| "engine returned no tunnel id".to_string()),
            ));
        }
        Ok(tunnel)
    }

    async fn delete_tunnel(&self, tunnel_id: &str) -> Result<bool, EngineError> {
        let resp = self
            .http
            .delete(self.api_url(&format!("/tunnels/{}", tunnel_id)))
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        let status = resp.status();
        if !status.is_success() {
            warn!(tunnel_id = %tunnel_id, status = status.as_u16(), "Engine refused tunnel deletion");
        }
        Ok(status.is_success())
    }

    async fn tunnel_status(&self, tunnel_id: &str) -> Result<EngineTunnelStatus, EngineError> {
        self.get_json(&format!("/tunnels/{}/status", tunnel_id)).await
    }

    async fn traffic_stats(&self, tunnel_id: &str) -> Result<TrafficStats, EngineError> {
        self.get_json(&format!("/tunnels/{}/stats", tunnel_id)).await
    }

    async fn health(&self) -> Result<bool, EngineError> {
        let resp = self
            .http
            .get(self.api_url("/health"))
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(resp.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_base_url() {
        let config = EngineConfig {
            base_url: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            HttpEngineClient::new(&config),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_api_url_trims_trailing_slash() {
        let config = EngineConfig {
            base_url: "http://engine.local:18080/".to_string(),
            token: Some("secret".to_string()),
            ..Default::default()
        };
        let client = HttpEngineClient::new(&config).unwrap();
        assert_eq!(
            client.api_url("/tunnels"),
            "http://engine.local:18080/api/v1/tunnels"
        );
    }
}
