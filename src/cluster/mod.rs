//! Cluster handles
//!
//! The orchestrator talks to the cluster through four narrow interfaces,
//! constructed once at startup and passed around in [`ClusterHandles`]:
//!
//! - [`TopologyStore`] for topology records
//! - [`WorkloadApi`] for pods, config maps and pod status
//! - [`PodExec`] for commands inside the `pod` container
//! - [`LinkAgent`] for the per-node agent that creates veth pairs
//!
//! Real implementations live in [`kube`], [`exec`] and [`agent`]; the
//! in-memory [`fake`] cluster implements all of them for tests and dry runs.

pub mod agent;
pub mod exec;
pub mod fake;
pub mod kube;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::poll::Sleeper;
use crate::topology::TopologyStore;
use crate::workload::{ConfigMapManifest, PodManifest};

pub use agent::{HttpLinkAgent, LinkRequest, UnlinkRequest, DEFAULT_AGENT_PORT};
pub use exec::WebSocketExec;
pub use fake::{FakeCluster, PodBehavior};
pub use kube::{ClusterConnection, KubeClient};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("Workload '{0}' not found")]
    NotFound(String),

    #[error("Workload '{0}' already exists")]
    AlreadyExists(String),

    #[error("Cluster API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Cluster API transport error: {0}")]
    Transport(String),

    #[error("Failed to decode cluster API response: {0}")]
    Decode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("Failed to open exec session in '{0}': {1}")]
    Connect(String, String),

    #[error("Exec protocol error: {0}")]
    Protocol(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Pod '{0}' has no host IP to reach its link agent")]
    NoHostIp(String),

    #[error("Link agent at {0} unreachable: {1}")]
    Unreachable(String, String),

    #[error("Link agent rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error(transparent)]
    Workload(#[from] WorkloadError),
}

/// Pod lifecycle phase as reported by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
}

/// The pieces of pod status the orchestrator reads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,

    #[serde(rename = "hostIP", default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,

    #[serde(rename = "containerStatuses", default)]
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodStatus {
    /// Running with every container ready
    pub fn is_ready(&self) -> bool {
        self.phase == PodPhase::Running
            && !self.container_statuses.is_empty()
            && self.container_statuses.iter().all(|c| c.ready)
    }

    /// Phases a pod never leaves
    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, PodPhase::Failed | PodPhase::Succeeded)
    }
}

/// Result of a command run inside a pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

#[async_trait]
pub trait WorkloadApi: Send + Sync {
    async fn create_pod(&self, namespace: &str, pod: &PodManifest) -> Result<(), WorkloadError>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), WorkloadError>;

    async fn pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus, WorkloadError>;

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMapManifest,
    ) -> Result<(), WorkloadError>;

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), WorkloadError>;
}

#[async_trait]
pub trait PodExec: Send + Sync {
    /// Run `command` in the device container of `pod`
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<ExecOutput, ExecError>;
}

#[async_trait]
pub trait LinkAgent: Send + Sync {
    async fn make_link(&self, request: &LinkRequest) -> Result<(), AgentError>;

    async fn delete_link(&self, request: &UnlinkRequest) -> Result<(), AgentError>;
}

/// Turn string slices into an owned argv
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Everything the orchestrator needs to touch the cluster
#[derive(Clone)]
pub struct ClusterHandles {
    pub store: Arc<dyn TopologyStore>,
    pub workloads: Arc<dyn WorkloadApi>,
    pub exec: Arc<dyn PodExec>,
    pub agent: Arc<dyn LinkAgent>,
    pub sleeper: Arc<dyn Sleeper>,
}

impl ClusterHandles {
    pub fn new(
        store: Arc<dyn TopologyStore>,
        workloads: Arc<dyn WorkloadApi>,
        exec: Arc<dyn PodExec>,
        agent: Arc<dyn LinkAgent>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            store,
            workloads,
            exec,
            agent,
            sleeper,
        }
    }

    /// Swap the sleeper (tests use an instant one)
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_status_decodes_cluster_json() {
        let json = r#"{
            "phase": "Running",
            "hostIP": "192.168.1.20",
            "containerStatuses": [
                {"name": "pod", "ready": true, "restartCount": 0}
            ],
            "podIP": "10.244.0.7"
        }"#;
        let status: PodStatus = serde_json::from_str(json).unwrap();
        assert!(status.is_ready());
        assert_eq!(status.host_ip.as_deref(), Some("192.168.1.20"));
    }

    #[test]
    fn test_running_without_ready_containers_is_not_ready() {
        let status = PodStatus {
            phase: PodPhase::Running,
            host_ip: None,
            container_statuses: vec![ContainerStatus {
                name: "pod".to_string(),
                ready: false,
            }],
        };
        assert!(!status.is_ready());
        assert!(!status.is_terminal());
    }

    #[test]
    fn test_unknown_phase_is_tolerated() {
        let status: PodStatus = serde_json::from_str(r#"{"phase": "Evicted"}"#).unwrap();
        assert_eq!(status.phase, PodPhase::Unknown);
        let status: PodStatus = serde_json::from_str(r#"{"phase": "Failed"}"#).unwrap();
        assert!(status.is_terminal());
    }
}
