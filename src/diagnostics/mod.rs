//! Reachability checks run inside device workloads

use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cluster::ClusterHandles;
use crate::config::Settings;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::fabric::commands;
use crate::fabric::FabricError;
use crate::topology::{load_graph, NodeKind, TopologyGraph};

/// Loss and average round trip parsed from `ping` output
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PingSummary {
    pub loss_percent: Option<f64>,
    pub avg_rtt_ms: Option<f64>,
}

impl PingSummary {
    pub fn reachable(&self) -> bool {
        matches!(self.loss_percent, Some(loss) if loss < 100.0)
    }
}

fn loss_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)% packet loss").ok())
        .as_ref()
}

fn rtt_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?:rtt|round-trip) min/avg/max(?:/mdev|/stddev)? = [\d.]+/([\d.]+)/").ok())
        .as_ref()
}

/// Pull packet loss and average RTT out of iputils or busybox ping output
pub fn parse_ping(output: &str) -> PingSummary {
    let capture = |re: Option<&Regex>| {
        re?.captures(output)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    };
    PingSummary {
        loss_percent: capture(loss_pattern()),
        avg_rtt_ms: capture(rtt_pattern()),
    }
}

/// Health of one half-link, measured from its owner
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkHealth {
    pub uid: u32,
    pub source: String,
    pub target: String,
    pub target_ip: Option<Ipv4Addr>,
    pub latency_ms: Option<f64>,
    pub loss_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Command used to list a device's interfaces or ports
pub fn interface_listing(kind: NodeKind) -> Vec<String> {
    match kind {
        NodeKind::Host | NodeKind::Router => commands::route_show(),
        NodeKind::Firewall => commands::linux_bridge_show(),
        NodeKind::Switch => commands::show_bridge(),
    }
}

#[derive(Clone)]
pub struct Diagnostics {
    handles: ClusterHandles,
    settings: Arc<Settings>,
}

impl Diagnostics {
    pub fn new(handles: ClusterHandles, settings: Arc<Settings>) -> Self {
        Self { handles, settings }
    }

    fn namespace(&self) -> &str {
        &self.settings.namespace
    }

    async fn snapshot(&self) -> OrchestratorResult<TopologyGraph> {
        Ok(load_graph(self.handles.store.as_ref(), self.namespace()).await?)
    }

    /// Address probes aim at: the target's first numbered link
    fn target_address(graph: &TopologyGraph, target: &str) -> OrchestratorResult<Ipv4Addr> {
        let record = graph
            .get(target)
            .ok_or_else(|| OrchestratorError::NodeNotFound(target.to_string()))?;
        record
            .primary_ip()
            .map(|ip| ip.addr)
            .ok_or_else(|| OrchestratorError::Unsupported(format!("{} has no address", target)))
    }

    async fn run(&self, pod: &str, command: Vec<String>) -> OrchestratorResult<String> {
        let output = self
            .handles
            .exec
            .exec(self.namespace(), pod, &command)
            .await
            .map_err(|e| FabricError::Exec {
                pod: pod.to_string(),
                command: command.join(" "),
                message: e.to_string(),
            })?;
        // ping exits non-zero on loss; the caller reads the statistics
        if !output.success && output.stdout.is_empty() {
            return Err(FabricError::Exec {
                pod: pod.to_string(),
                command: command.join(" "),
                message: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output.stdout)
    }

    async fn probe(
        &self,
        graph: &TopologyGraph,
        source: &str,
        target: &str,
        tool: fn(Ipv4Addr) -> Vec<String>,
    ) -> OrchestratorResult<String> {
        if !graph.contains(source) {
            return Err(OrchestratorError::NodeNotFound(source.to_string()));
        }
        let ip = Self::target_address(graph, target)?;
        debug!("Probing {} ({}) from {}", target, ip, source);
        self.run(source, tool(ip)).await
    }

    /// Raw `ping` output from `source` to `target`
    pub async fn ping(&self, source: &str, target: &str) -> OrchestratorResult<String> {
        let graph = self.snapshot().await?;
        self.probe(&graph, source, target, commands::ping).await
    }

    pub async fn traceroute(&self, source: &str, target: &str) -> OrchestratorResult<String> {
        let graph = self.snapshot().await?;
        self.probe(&graph, source, target, commands::traceroute).await
    }

    /// Routes for hosts and routers, bridge state for switches and firewalls
    pub async fn interfaces(&self, name: &str) -> OrchestratorResult<String> {
        let kind = NodeKind::require(name)?;
        let graph = self.snapshot().await?;
        if !graph.contains(name) {
            return Err(OrchestratorError::NodeNotFound(name.to_string()));
        }
        self.run(name, interface_listing(kind)).await
    }

    /// Ping across every numbered half-link, or only those of `node`.
    ///
    /// Unnumbered peers are skipped. Probe failures are recorded on the
    /// entry rather than aborting the sweep.
    pub async fn evaluate_links(&self, node: Option<&str>) -> OrchestratorResult<Vec<LinkHealth>> {
        let graph = self.snapshot().await?;
        if let Some(node) = node {
            if !graph.contains(node) {
                return Err(OrchestratorError::NodeNotFound(node.to_string()));
            }
        }

        let mut report = Vec::new();
        for record in graph.records() {
            if node.is_some_and(|n| n != record.name()) {
                continue;
            }
            for half in record.links() {
                let Some(peer_ip) = half.peer_ip else {
                    continue;
                };
                let mut health = LinkHealth {
                    uid: half.uid,
                    source: record.name().to_string(),
                    target: half.peer.clone(),
                    target_ip: Some(peer_ip.addr),
                    latency_ms: None,
                    loss_percent: None,
                    error: None,
                    checked_at: Utc::now(),
                };
                match self.run(record.name(), commands::ping(peer_ip.addr)).await {
                    Ok(output) => {
                        let summary = parse_ping(&output);
                        health.latency_ms = summary.avg_rtt_ms;
                        health.loss_percent = summary.loss_percent;
                    }
                    Err(e) => {
                        warn!("Ping {} -> {} failed: {}", record.name(), half.peer, e);
                        health.error = Some(e.to_string());
                    }
                }
                report.push(health);
            }
        }
        Ok(report)
    }
}
