//! Live service view.
//!
//! Liveness is probed unconditionally; endpoint probes run only when the
//! service is up and only for endpoints found in source code.

use crate::spec::Endpoint;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const HEALTHY_STATUSES: &[&str] = &["ok", "healthy", "up", "pass"];

/// Result of the liveness probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Any HTTP response at all.
    pub running: bool,
    pub healthy: bool,
    pub status_code: Option<u16>,
    pub detail: String,
}

/// Result of one endpoint probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointProbe {
    pub endpoint: Endpoint,
    pub ok: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

/// What the running service says about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceView {
    pub health: HealthStatus,
    pub probes: Vec<EndpointProbe>,
}

/// HTTP access to the generated service.
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    /// GET the health path. Never fails; an unreachable service is `running == false`.
    async fn liveness(&self) -> HealthStatus;

    /// GET one endpoint with its own timeout.
    async fn probe(&self, endpoint: &Endpoint) -> EndpointProbe;
}

/// Endpoints eligible for probing: GET, not parameterized, not health, unique, capped.
#[must_use]
pub fn probe_targets(
    source_endpoints: &[Endpoint],
    health_path: &str,
    max: usize,
) -> Vec<Endpoint> {
    let health = Endpoint::new("GET", health_path).key();
    let mut targets: Vec<Endpoint> = Vec::new();
    for endpoint in source_endpoints {
        if targets.len() >= max {
            break;
        }
        if endpoint.method != "GET" || endpoint.is_parameterized() || endpoint.key() == health {
            continue;
        }
        if targets.iter().any(|t| t.key() == endpoint.key()) {
            continue;
        }
        targets.push(endpoint.clone());
    }
    targets
}

/// Build the service view from a probe.
pub async fn gather(
    probe: &dyn ServiceProbe,
    source_endpoints: &[Endpoint],
    health_path: &str,
    max_endpoints: usize,
) -> ServiceView {
    let health = probe.liveness().await;
    if !health.running {
        return ServiceView {
            health,
            probes: Vec::new(),
        };
    }
    let targets = probe_targets(source_endpoints, health_path, max_endpoints);
    let probes = futures::future::join_all(targets.iter().map(|e| probe.probe(e))).await;
    debug!("Probed {} endpoints", probes.len());
    ServiceView { health, probes }
}

/// reqwest-backed probe.
#[derive(Debug, Clone)]
pub struct HttpServiceProbe {
    client: reqwest::Client,
    base_url: String,
    health_path: String,
    timeout: Duration,
}

impl HttpServiceProbe {
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        health_path: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            health_path: health_path.into(),
            timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Whether a 2xx health body reports a healthy status.
fn body_is_healthy(body: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => match value.get("status").and_then(|s| s.as_str()) {
            Some(status) => HEALTHY_STATUSES.contains(&status.to_ascii_lowercase().as_str()),
            None => true,
        },
        Err(_) => true,
    }
}

#[async_trait]
impl ServiceProbe for HttpServiceProbe {
    async fn liveness(&self) -> HealthStatus {
        let response = self
            .client
            .get(self.url(&self.health_path))
            .timeout(self.timeout)
            .send()
            .await;
        match response {
            Ok(resp) => {
                let code = resp.status().as_u16();
                let success = resp.status().is_success();
                let body = resp.text().await.unwrap_or_default();
                let healthy = success && body_is_healthy(&body);
                HealthStatus {
                    running: true,
                    healthy,
                    status_code: Some(code),
                    detail: body.chars().take(200).collect(),
                }
            }
            Err(e) => HealthStatus {
                running: false,
                healthy: false,
                status_code: None,
                detail: e.to_string(),
            },
        }
    }

    async fn probe(&self, endpoint: &Endpoint) -> EndpointProbe {
        let response = self
            .client
            .get(self.url(&endpoint.path))
            .timeout(self.timeout)
            .send()
            .await;
        match response {
            Ok(resp) => EndpointProbe {
                endpoint: endpoint.clone(),
                ok: resp.status().is_success(),
                status_code: Some(resp.status().as_u16()),
                error: None,
            },
            Err(e) => EndpointProbe {
                endpoint: endpoint.clone(),
                ok: false,
                status_code: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn probe_for(url: &str) -> HttpServiceProbe {
        HttpServiceProbe::new(url, "/health", Duration::from_millis(1500))
    }

    #[tokio::test]
    async fn test_liveness_healthy() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status":"ok"}"#)
            .create_async()
            .await;

        let health = probe_for(&server.url()).liveness().await;
        assert!(health.running);
        assert!(health.healthy);
        assert_eq!(health.status_code, Some(200));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_liveness_running_but_unhealthy() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status":"degraded"}"#)
            .create_async()
            .await;
        let health = probe_for(&server.url()).liveness().await;
        assert!(health.running);
        assert!(!health.healthy);

        let mut failing = Server::new_async().await;
        failing
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;
        let health = probe_for(&failing.url()).liveness().await;
        assert!(health.running);
        assert!(!health.healthy);
        assert_eq!(health.status_code, Some(503));
    }

    #[tokio::test]
    async fn test_liveness_unreachable() {
        let health = probe_for("http://127.0.0.1:1").liveness().await;
        assert!(!health.running);
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn test_gather_probes_only_plain_gets() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status":"ok"}"#)
            .create_async()
            .await;
        let orders = server
            .mock("GET", "/api/v1/orders")
            .with_status(200)
            .with_body("[]")
            .expect(1)
            .create_async()
            .await;
        server
            .mock("GET", "/api/v1/items")
            .with_status(500)
            .create_async()
            .await;

        let source = vec![
            Endpoint::new("GET", "/health"),
            Endpoint::new("GET", "/api/v1/orders"),
            Endpoint::new("GET", "/api/v1/orders/"),
            Endpoint::new("POST", "/api/v1/orders"),
            Endpoint::new("GET", "/api/v1/orders/:id"),
            Endpoint::new("GET", "/api/v1/items"),
        ];
        let probe = probe_for(&server.url());
        let view = gather(&probe, &source, "/health", 20).await;

        assert!(view.health.running);
        assert_eq!(view.probes.len(), 2);
        assert!(view.probes[0].ok);
        assert!(!view.probes[1].ok);
        assert_eq!(view.probes[1].status_code, Some(500));
        orders.assert_async().await;
    }

    #[tokio::test]
    async fn test_gather_skips_probes_when_down() {
        let probe = probe_for("http://127.0.0.1:1");
        let view = gather(&probe, &[Endpoint::new("GET", "/api/v1/orders")], "/health", 20).await;
        assert!(!view.health.running);
        assert!(view.probes.is_empty());
    }

    #[test]
    fn test_probe_targets_cap() {
        let source: Vec<Endpoint> = (0..30)
            .map(|i| Endpoint::new("GET", format!("/r{i}")))
            .collect();
        assert_eq!(probe_targets(&source, "/health", 20).len(), 20);
    }

    #[test]
    fn test_probe_targets_zero_and_one_cap() {
        let source = vec![
            Endpoint::new("GET", "/api/v1/orders"),
            Endpoint::new("GET", "/api/v1/items"),
        ];
        assert!(probe_targets(&source, "/health", 0).is_empty());

        let one = probe_targets(&source, "/health", 1);
        assert_eq!(one, vec![Endpoint::new("GET", "/api/v1/orders")]);
    }
}
