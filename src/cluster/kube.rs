//! Kubernetes REST client for topology records, pods and config maps
//!
//! Talks to the API server directly with reqwest: bearer-token auth,
//! JSON bodies, and JSON merge patches carrying `metadata.resourceVersion`
//! so concurrent link edits surface as 409 conflicts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{PodStatus, WorkloadApi, WorkloadError};
use crate::topology::model::{TopologyList, TOPOLOGY_GROUP, TOPOLOGY_PLURAL, TOPOLOGY_VERSION};
use crate::topology::{HalfLink, StoreError, TopologyRecord, TopologyStore};
use crate::workload::{ConfigMapManifest, PodManifest};

/// How to reach and authenticate against the API server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConnection {
    /// API server base URL, e.g. `https://10.0.0.1:6443`
    pub server: String,
    pub token: Option<String>,
    /// Skip TLS certificate verification
    pub insecure: bool,
}

impl ClusterConnection {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            token: None,
            insecure: false,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }
}

/// Failure of a single API call before it is mapped into a domain error
#[derive(Debug)]
enum ApiFailure {
    Status(StatusCode, String),
    Transport(String),
}

#[derive(Deserialize)]
struct StatusBody {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct PodEnvelope {
    #[serde(default)]
    status: PodStatus,
}

#[derive(Clone)]
pub struct KubeClient {
    http: Client,
    connection: ClusterConnection,
}

impl KubeClient {
    pub fn new(connection: ClusterConnection) -> Result<Self, WorkloadError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(connection.insecure)
            .build()
            .map_err(|e| WorkloadError::Transport(e.to_string()))?;
        Ok(Self { http, connection })
    }

    pub fn connection(&self) -> &ClusterConnection {
        &self.connection
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.connection.server.trim_end_matches('/'), path);
        let builder = self.http.request(method, url);
        match &self.connection.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiFailure> {
        let response = builder
            .send()
            .await
            .map_err(|e| ApiFailure::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<StatusBody>(&body)
            .map(|s| s.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or(body);
        Err(ApiFailure::Status(status, message))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, String> {
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        serde_json::from_slice(&bytes).map_err(|e| e.to_string())
    }
}

fn topology_path(namespace: &str, name: Option<&str>) -> String {
    let base = format!(
        "/apis/{}/{}/namespaces/{}/{}",
        TOPOLOGY_GROUP, TOPOLOGY_VERSION, namespace, TOPOLOGY_PLURAL
    );
    match name {
        Some(name) => format!("{}/{}", base, name),
        None => base,
    }
}

fn core_path(namespace: &str, resource: &str, name: Option<&str>) -> String {
    let base = format!("/api/v1/namespaces/{}/{}", namespace, resource);
    match name {
        Some(name) => format!("{}/{}", base, name),
        None => base,
    }
}

fn store_error(failure: ApiFailure, name: &str, on_conflict: fn(String) -> StoreError) -> StoreError {
    match failure {
        ApiFailure::Status(StatusCode::NOT_FOUND, _) => StoreError::NotFound(name.to_string()),
        ApiFailure::Status(StatusCode::CONFLICT, _) => on_conflict(name.to_string()),
        ApiFailure::Status(status, message) => {
            StoreError::Transport(format!("{}: {}", status.as_u16(), message))
        }
        ApiFailure::Transport(e) => StoreError::Transport(e),
    }
}

fn workload_error(failure: ApiFailure, name: &str) -> WorkloadError {
    match failure {
        ApiFailure::Status(StatusCode::NOT_FOUND, _) => WorkloadError::NotFound(name.to_string()),
        ApiFailure::Status(StatusCode::CONFLICT, _) => {
            WorkloadError::AlreadyExists(name.to_string())
        }
        ApiFailure::Status(status, message) => WorkloadError::Api {
            status: status.as_u16(),
            message,
        },
        ApiFailure::Transport(e) => WorkloadError::Transport(e),
    }
}

#[async_trait]
impl TopologyStore for KubeClient {
    async fn list(&self, namespace: &str) -> Result<Vec<TopologyRecord>, StoreError> {
        let response = self
            .send(self.request(Method::GET, &topology_path(namespace, None)))
            .await
            .map_err(|e| store_error(e, namespace, StoreError::Conflict))?;
        let list: TopologyList = Self::decode(response).await.map_err(StoreError::Decode)?;
        Ok(list.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<TopologyRecord, StoreError> {
        let response = self
            .send(self.request(Method::GET, &topology_path(namespace, Some(name))))
            .await
            .map_err(|e| store_error(e, name, StoreError::Conflict))?;
        Self::decode(response).await.map_err(StoreError::Decode)
    }

    async fn create(
        &self,
        namespace: &str,
        record: &TopologyRecord,
    ) -> Result<TopologyRecord, StoreError> {
        debug!("Creating topology record {}", record.name());
        let response = self
            .send(
                self.request(Method::POST, &topology_path(namespace, None))
                    .json(record),
            )
            .await
            .map_err(|e| store_error(e, record.name(), StoreError::AlreadyExists))?;
        Self::decode(response).await.map_err(StoreError::Decode)
    }

    async fn patch_links(
        &self,
        namespace: &str,
        name: &str,
        links: &[HalfLink],
        resource_version: Option<&str>,
    ) -> Result<TopologyRecord, StoreError> {
        let mut body = json!({ "spec": { "links": links } });
        if let Some(version) = resource_version {
            body["metadata"] = json!({ "resourceVersion": version });
        }
        let payload = serde_json::to_vec(&body).map_err(|e| StoreError::Decode(e.to_string()))?;
        let response = self
            .send(
                self.request(Method::PATCH, &topology_path(namespace, Some(name)))
                    .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
                    .body(payload),
            )
            .await
            .map_err(|e| store_error(e, name, StoreError::Conflict))?;
        Self::decode(response).await.map_err(StoreError::Decode)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.send(self.request(Method::DELETE, &topology_path(namespace, Some(name))))
            .await
            .map_err(|e| store_error(e, name, StoreError::Conflict))?;
        Ok(())
    }
}

#[async_trait]
impl WorkloadApi for KubeClient {
    async fn create_pod(&self, namespace: &str, pod: &PodManifest) -> Result<(), WorkloadError> {
        debug!("Creating pod {} in {}", pod.name(), namespace);
        self.send(
            self.request(Method::POST, &core_path(namespace, "pods", None))
                .json(pod),
        )
        .await
        .map_err(|e| workload_error(e, pod.name()))?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), WorkloadError> {
        self.send(self.request(Method::DELETE, &core_path(namespace, "pods", Some(name))))
            .await
            .map_err(|e| workload_error(e, name))?;
        Ok(())
    }

    async fn pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus, WorkloadError> {
        let response = self
            .send(self.request(Method::GET, &core_path(namespace, "pods", Some(name))))
            .await
            .map_err(|e| workload_error(e, name))?;
        let pod: PodEnvelope = Self::decode(response)
            .await
            .map_err(WorkloadError::Decode)?;
        Ok(pod.status)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMapManifest,
    ) -> Result<(), WorkloadError> {
        self.send(
            self.request(Method::POST, &core_path(namespace, "configmaps", None))
                .json(config_map),
        )
        .await
        .map_err(|e| workload_error(e, config_map.name()))?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), WorkloadError> {
        self.send(self.request(Method::DELETE, &core_path(namespace, "configmaps", Some(name))))
            .await
            .map_err(|e| workload_error(e, name))?;
        Ok(())
    }
}
