//! Orchestrator facade
//!
//! One entry point over the device provisioner, the link fabric, bulk
//! operations and diagnostics. All parts share the cluster handles, the
//! settings and a single set of allocation locks, so allocations made
//! through any of them are serialized per namespace.

pub mod view;

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

pub use view::{TopologyView, ViewEdge, ViewNode};

use crate::bulk::BulkRunner;
use crate::cluster::ClusterHandles;
use crate::config::Settings;
use crate::diagnostics::Diagnostics;
use crate::error::OrchestratorResult;
use crate::fabric::{LinkFabric, LinkOutcome};
use crate::layout::{layout_graph, LayoutAlgorithm, Positions};
use crate::provision::{DeviceProvisioner, Removal};
use crate::topology::{load_graph, AllocationLocks, NodeKind, TopologyGraph};

/// One row of `get nodes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub name: String,
    pub kind: Option<NodeKind>,
    pub ip: Option<String>,
    /// Peers in link order
    pub peers: Vec<String>,
}

#[derive(Clone)]
pub struct Orchestrator {
    handles: ClusterHandles,
    settings: Arc<Settings>,
    provisioner: DeviceProvisioner,
    fabric: LinkFabric,
    bulk: BulkRunner,
    diagnostics: Diagnostics,
}

impl Orchestrator {
    pub fn new(handles: ClusterHandles, settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let locks = AllocationLocks::new();
        let provisioner = DeviceProvisioner::new(handles.clone(), settings.clone(), locks.clone());
        let fabric = LinkFabric::new(handles.clone(), settings.clone(), locks);
        let bulk = BulkRunner::new(
            handles.clone(),
            settings.clone(),
            provisioner.clone(),
            fabric.clone(),
        );
        let diagnostics = Diagnostics::new(handles.clone(), settings.clone());
        Self {
            handles,
            settings,
            provisioner,
            fabric,
            bulk,
            diagnostics,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bulk(&self) -> &BulkRunner {
        &self.bulk
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Fresh snapshot of every record in the namespace
    pub async fn topology(&self) -> OrchestratorResult<TopologyGraph> {
        let graph = load_graph(self.handles.store.as_ref(), &self.settings.namespace).await?;
        for asymmetry in graph.check_symmetry() {
            warn!(
                "Link {} on {} is asymmetric: {}",
                asymmetry.uid, asymmetry.node, asymmetry.reason
            );
        }
        Ok(graph)
    }

    pub async fn nodes(&self) -> OrchestratorResult<Vec<NodeSummary>> {
        let graph = self.topology().await?;
        Ok(graph
            .records()
            .map(|record| NodeSummary {
                name: record.name().to_string(),
                kind: record.node_kind(),
                ip: record.primary_ip().map(|ip| ip.to_string()),
                peers: record.links().iter().map(|l| l.peer.clone()).collect(),
            })
            .collect())
    }

    /// Layout with the given algorithm, or the configured one
    pub async fn layout(&self, algorithm: Option<LayoutAlgorithm>) -> OrchestratorResult<Positions> {
        let graph = self.topology().await?;
        Ok(layout_graph(&graph, algorithm.unwrap_or(self.settings.layout)))
    }

    pub async fn view(&self, algorithm: Option<LayoutAlgorithm>) -> OrchestratorResult<TopologyView> {
        let graph = self.topology().await?;
        Ok(TopologyView::build(&graph, algorithm.unwrap_or(self.settings.layout)))
    }

    pub async fn add_device(&self, kind: NodeKind, attach: Option<&str>) -> OrchestratorResult<String> {
        let name = self.provisioner.add_device(kind, attach).await?;
        info!("Added {} {}", kind, name);
        Ok(name)
    }

    pub async fn remove_device(&self, name: &str) -> OrchestratorResult<Removal> {
        self.provisioner.remove_device(name).await
    }

    pub async fn reboot_device(&self, name: &str) -> OrchestratorResult<()> {
        self.provisioner.reboot_device(name).await
    }

    pub async fn add_link(&self, a: &str, b: &str) -> OrchestratorResult<LinkOutcome> {
        self.fabric.add_link(a, b).await
    }

    pub async fn remove_link(&self, a: &str, b: &str) -> OrchestratorResult<()> {
        self.fabric.remove_link(a, b).await
    }

    pub async fn rewire_link(&self, node: &str, old_peer: &str, new_peer: &str) -> OrchestratorResult<LinkOutcome> {
        self.fabric.rewire_link(node, old_peer, new_peer).await
    }
}
