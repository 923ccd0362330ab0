//! Client for the per-node link agent
//!
//! The agent runs on every cluster node and creates or deletes the veth
//! pair behind a link. Requests go to the agent on the node hosting the
//! first pod, found through that pod's `hostIP`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{AgentError, LinkAgent, WorkloadApi};

/// Port the link agent listens on
pub const DEFAULT_AGENT_PORT: u16 = 50051;

/// Create a veth pair between two pods. Empty IPs mean unnumbered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRequest {
    pub pod_a: String,
    pub iface_a: String,
    #[serde(default)]
    pub ip_a: String,
    pub pod_b: String,
    pub iface_b: String,
    #[serde(default)]
    pub ip_b: String,
    pub namespace: String,
}

/// Delete one end of a link inside a pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkRequest {
    pub pod: String,
    pub iface: String,
    pub namespace: String,
}

#[derive(Debug, Deserialize)]
struct AgentReply {
    #[serde(default)]
    message: String,
}

/// Link agent reached over HTTP/JSON
#[derive(Clone)]
pub struct HttpLinkAgent {
    http: Client,
    workloads: Arc<dyn WorkloadApi>,
    port: u16,
    /// Fixed agent URL, bypassing host IP resolution
    endpoint: Option<String>,
}

impl HttpLinkAgent {
    pub fn new(workloads: Arc<dyn WorkloadApi>, port: u16) -> Result<Self, AgentError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AgentError::Unreachable("agent".to_string(), e.to_string()))?;
        Ok(Self {
            http,
            workloads,
            port,
            endpoint: None,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    async fn base_url(&self, namespace: &str, pod: &str) -> Result<String, AgentError> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.trim_end_matches('/').to_string());
        }
        let status = self.workloads.pod_status(namespace, pod).await?;
        let host_ip = status
            .host_ip
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| AgentError::NoHostIp(pod.to_string()))?;
        Ok(format!("http://{}:{}", host_ip, self.port))
    }

    async fn post<T: Serialize + Sync>(&self, url: String, body: &T) -> Result<(), AgentError> {
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Unreachable(url.clone(), e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<AgentReply>(&text)
            .map(|r| r.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or(text);
        Err(AgentError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl LinkAgent for HttpLinkAgent {
    async fn make_link(&self, request: &LinkRequest) -> Result<(), AgentError> {
        let base = self.base_url(&request.namespace, &request.pod_a).await?;
        debug!("Agent {}: link {}:{} <-> {}:{}", base, request.pod_a, request.iface_a, request.pod_b, request.iface_b);
        self.post(format!("{}/v1/links", base), request).await?;
        info!("Created link {} <-> {}", request.pod_a, request.pod_b);
        Ok(())
    }

    async fn delete_link(&self, request: &UnlinkRequest) -> Result<(), AgentError> {
        let base = self.base_url(&request.namespace, &request.pod).await?;
        self.post(format!("{}/v1/links/delete", base), request).await
    }
}
