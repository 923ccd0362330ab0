//! Bulk topology changes
//!
//! Many devices are added or removed through a bounded worker pool.
//! Submissions are staggered by a fixed delay and results are collected in
//! completion order. Problems found while planning (unknown nodes,
//! unsupported attachments) are reported without submitting anything for
//! that request.
//!
//! Links between existing nodes are the exception: each one depends on the
//! addresses of the ones before it, so they run one at a time, routers
//! first, and the run stops at the first failure.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::ClusterHandles;
use crate::config::Settings;
use crate::error::OrchestratorResult;
use crate::fabric::{check_adjacency, LinkFabric};
use crate::provision::DeviceProvisioner;
use crate::topology::{load_graph, NodeKind, TopologyGraph};

/// Children to add under one existing node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRequest {
    #[serde(default)]
    pub hosts: u32,
    #[serde(default)]
    pub switches: u32,
    #[serde(default)]
    pub routers: u32,
}

/// One unit of work run on the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkUnit {
    Add { kind: NodeKind, attach: String },
    Remove { name: String },
}

impl BulkUnit {
    pub fn describe(&self) -> String {
        match self {
            BulkUnit::Add { kind, attach } => format!("add {} to {}", kind, attach),
            BulkUnit::Remove { name } => format!("delete {}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitResult {
    pub action: String,
    /// Device created or removed, or `link<uid>` for a new link
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UnitResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkReport {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Requests refused while planning
    pub rejected: Vec<String>,
    /// Unit results in completion order
    pub results: Vec<UnitResult>,
}

impl BulkReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// Devices created or removed successfully
    pub fn devices(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.succeeded())
            .filter_map(|r| r.device.as_deref())
            .collect()
    }
}

#[derive(Clone)]
pub struct BulkRunner {
    handles: ClusterHandles,
    settings: Arc<Settings>,
    provisioner: DeviceProvisioner,
    fabric: LinkFabric,
}

impl BulkRunner {
    pub fn new(
        handles: ClusterHandles,
        settings: Arc<Settings>,
        provisioner: DeviceProvisioner,
        fabric: LinkFabric,
    ) -> Self {
        Self {
            handles,
            settings,
            provisioner,
            fabric,
        }
    }

    async fn snapshot(&self) -> OrchestratorResult<TopologyGraph> {
        Ok(load_graph(self.handles.store.as_ref(), &self.settings.namespace).await?)
    }

    /// Add children under existing nodes, e.g. `sw1: 2 hosts, r1: 1 switch`
    pub async fn add_nodes(&self, requests: &BTreeMap<String, NodeRequest>) -> OrchestratorResult<BulkReport> {
        let started_at = Utc::now();
        let graph = self.snapshot().await?;
        let (units, rejected) = plan_additions(&graph, requests);
        let results = self.run(units).await;
        Ok(self.report(started_at, rejected, results))
    }

    /// Give each router a new subnet: one switch, then one host behind it
    pub async fn add_subnets(&self, routers: &[String]) -> OrchestratorResult<BulkReport> {
        let started_at = Utc::now();
        let graph = self.snapshot().await?;
        let mut rejected = Vec::new();
        let mut units = Vec::new();
        for router in dedup(routers) {
            if !graph.contains(router) {
                rejected.push(format!("{} does not exist", router));
            } else if NodeKind::of_name(router) != Some(NodeKind::Router) {
                rejected.push(format!("{} is not a router", router));
            } else {
                units.push(BulkUnit::Add {
                    kind: NodeKind::Switch,
                    attach: router.to_string(),
                });
            }
        }

        let mut results = self.run(units).await;
        let hosts: Vec<BulkUnit> = results
            .iter()
            .filter(|r| r.succeeded())
            .filter_map(|r| r.device.clone())
            .map(|switch| BulkUnit::Add {
                kind: NodeKind::Host,
                attach: switch,
            })
            .collect();
        results.extend(self.run(hosts).await);
        Ok(self.report(started_at, rejected, results))
    }

    /// Remove every host linked to the given switches
    pub async fn delete_hosts_for_switches(&self, switches: &[String]) -> OrchestratorResult<BulkReport> {
        let started_at = Utc::now();
        let graph = self.snapshot().await?;
        let mut rejected = Vec::new();
        let mut hosts = BTreeSet::new();
        for switch in dedup(switches) {
            if !graph.contains(switch) {
                rejected.push(format!("{} does not exist", switch));
                continue;
            }
            let before = hosts.len();
            hosts.extend(
                graph
                    .neighbors(switch)
                    .filter(|n| NodeKind::of_name(n) == Some(NodeKind::Host))
                    .map(|n| n.to_string()),
            );
            if hosts.len() == before {
                rejected.push(format!("{} has no hosts", switch));
            }
        }
        let units = hosts.into_iter().map(|name| BulkUnit::Remove { name }).collect();
        let results = self.run(units).await;
        Ok(self.report(started_at, rejected, results))
    }

    /// Remove the named devices
    pub async fn delete_nodes(&self, names: &[String]) -> OrchestratorResult<BulkReport> {
        let started_at = Utc::now();
        let graph = self.snapshot().await?;
        let mut rejected = Vec::new();
        let mut units = Vec::new();
        for name in dedup(names) {
            if graph.contains(name) {
                units.push(BulkUnit::Remove {
                    name: name.to_string(),
                });
            } else {
                rejected.push(format!("{} does not exist", name));
            }
        }
        let results = self.run(units).await;
        Ok(self.report(started_at, rejected, results))
    }

    /// Link pairs of existing nodes in stage order, stopping at the first
    /// failure; pairs after it are reported as not attempted
    pub async fn add_links(&self, pairs: &[(String, String)]) -> OrchestratorResult<BulkReport> {
        let started_at = Utc::now();
        let (ordered, mut rejected) = plan_links(pairs);
        let mut results = Vec::new();

        let mut remaining = ordered.into_iter();
        while let Some((a, b)) = remaining.next() {
            let action = format!("link {} to {}", a, b);
            match self.fabric.add_link(&a, &b).await {
                Ok(outcome) => {
                    info!("{} done (link {})", action, outcome.uid);
                    results.push(UnitResult {
                        action,
                        device: Some(format!("link{}", outcome.uid)),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!("{} failed, stopping: {}", action, e);
                    results.push(UnitResult {
                        action,
                        device: None,
                        error: Some(e.to_string()),
                    });
                    rejected.extend(
                        remaining
                            .by_ref()
                            .map(|(a, b)| format!("link {} to {} not attempted", a, b)),
                    );
                    break;
                }
            }
        }
        Ok(self.report(started_at, rejected, results))
    }

    /// Run units on the pool, staggering submissions
    pub async fn run(&self, units: Vec<BulkUnit>) -> Vec<UnitResult> {
        let pool = Arc::new(Semaphore::new(self.settings.bulk.pool_size.max(1)));
        let stagger = Duration::from_secs(self.settings.bulk.stagger_secs);
        let mut pending = FuturesUnordered::new();

        for (index, unit) in units.into_iter().enumerate() {
            if index > 0 && !stagger.is_zero() {
                self.handles.sleeper.sleep(stagger).await;
            }
            let permit = match pool.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!("Worker pool closed: {}", e);
                    break;
                }
            };
            let provisioner = self.provisioner.clone();
            let action = unit.describe();
            debug!("Submitting {}", action);
            let handle = tokio::spawn(async move {
                let _permit = permit;
                run_unit(&provisioner, unit).await
            });
            pending.push(async move { (action, handle.await) });
        }

        let mut results = Vec::new();
        while let Some((action, joined)) = pending.next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => UnitResult {
                    action: action.clone(),
                    device: None,
                    error: Some(format!("worker failed: {}", e)),
                },
            };
            match &result.error {
                None => info!("{} done", action),
                Some(e) => warn!("{} failed: {}", action, e),
            }
            results.push(result);
        }
        results
    }

    fn report(&self, started_at: DateTime<Utc>, rejected: Vec<String>, results: Vec<UnitResult>) -> BulkReport {
        let report = BulkReport {
            id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            rejected,
            results,
        };
        info!(
            "Bulk {}: {} succeeded, {} failed, {} rejected",
            report.id,
            report.succeeded(),
            report.failed(),
            report.rejected.len()
        );
        report
    }
}

async fn run_unit(provisioner: &DeviceProvisioner, unit: BulkUnit) -> UnitResult {
    let action = unit.describe();
    let outcome = match unit {
        BulkUnit::Add { kind, attach } => provisioner.add_device(kind, Some(&attach)).await,
        BulkUnit::Remove { name } => provisioner.remove_device(&name).await.map(|r| r.name),
    };
    match outcome {
        Ok(device) => UnitResult {
            action,
            device: Some(device),
            error: None,
        },
        Err(e) => UnitResult {
            action,
            device: None,
            error: Some(e.to_string()),
        },
    }
}

fn dedup(names: &[String]) -> Vec<&str> {
    let mut seen = BTreeSet::new();
    names
        .iter()
        .map(|s| s.as_str())
        .filter(|s| seen.insert(*s))
        .collect()
}

/// Order in which bulk links run: router pairs, router uplinks, switch
/// fabric, then hosts
fn link_stage(a: NodeKind, b: NodeKind) -> Option<u8> {
    use NodeKind::*;
    match (a, b) {
        (Router, Router) => Some(0),
        (Router, Switch | Firewall) | (Switch | Firewall, Router) => Some(1),
        (Switch, Switch | Firewall) | (Firewall, Switch) => Some(2),
        (Switch, Host) | (Host, Switch) => Some(3),
        _ => None,
    }
}

/// Sort link pairs into stage order, keeping input order within a stage,
/// and refuse pairs no stage accepts
pub fn plan_links(pairs: &[(String, String)]) -> (Vec<(String, String)>, Vec<String>) {
    let mut staged = Vec::new();
    let mut rejected = Vec::new();
    for (a, b) in pairs {
        match check_adjacency(a, b) {
            Ok((kind_a, kind_b)) => match link_stage(kind_a, kind_b) {
                Some(stage) => staged.push((stage, a.clone(), b.clone())),
                None => rejected.push(format!("cannot link {} and {} in bulk", a, b)),
            },
            Err(e) => rejected.push(e.to_string()),
        }
    }
    staged.sort_by_key(|(stage, _, _)| *stage);
    (
        staged.into_iter().map(|(_, a, b)| (a, b)).collect(),
        rejected,
    )
}

/// Turn per-node requests into units plus the requests that cannot be met.
///
/// Switches take hosts and switches, routers take switches and routers;
/// every other combination is refused.
pub fn plan_additions(
    graph: &TopologyGraph,
    requests: &BTreeMap<String, NodeRequest>,
) -> (Vec<BulkUnit>, Vec<String>) {
    let mut units = Vec::new();
    let mut rejected = Vec::new();

    for (node, request) in requests {
        let kind = NodeKind::of_name(node);
        if kind == Some(NodeKind::Host) {
            rejected.push(format!("cannot add nodes under host {}", node));
            continue;
        }
        if !graph.contains(node) {
            rejected.push(format!("{} does not exist", node));
            continue;
        }

        let mut add = |count: u32, child: NodeKind| {
            for _ in 0..count {
                units.push(BulkUnit::Add {
                    kind: child,
                    attach: node.clone(),
                });
            }
        };
        match kind {
            Some(NodeKind::Switch) => {
                add(request.hosts, NodeKind::Host);
                add(request.switches, NodeKind::Switch);
                if request.routers > 0 {
                    rejected.push(format!("cannot add routers to switch {}", node));
                }
            }
            Some(NodeKind::Router) => {
                add(request.switches, NodeKind::Switch);
                add(request.routers, NodeKind::Router);
                if request.hosts > 0 {
                    rejected.push(format!("cannot add hosts directly to router {}", node));
                }
            }
            _ => rejected.push(format!("cannot add nodes under {}", node)),
        }
    }
    (units, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::FakeCluster;
    use crate::poll::InstantSleeper;
    use crate::topology::{link_pair, AllocationLocks, TopologyRecord, TopologyStore};

    const NS: &str = "default";

    async fn lab(pool_size: usize) -> (FakeCluster, InstantSleeper, BulkRunner) {
        let (r, sw) = link_pair(1, "r1", "sw1", Some("10.12.1.1/24".parse().unwrap()), None);
        let cluster = FakeCluster::new();
        cluster
            .seed(
                NS,
                vec![
                    TopologyRecord::new("r1", vec![r]),
                    TopologyRecord::new("sw1", vec![sw]),
                ],
            )
            .await;
        let sleeper = InstantSleeper::new();
        let handles = cluster.handles().with_sleeper(Arc::new(sleeper.clone()));
        let mut settings = Settings::default();
        settings.bulk.pool_size = pool_size;
        let settings = Arc::new(settings);
        let locks = AllocationLocks::new();
        let provisioner = DeviceProvisioner::new(handles.clone(), settings.clone(), locks.clone());
        let fabric = LinkFabric::new(handles.clone(), settings.clone(), locks);
        (cluster, sleeper, BulkRunner::new(handles, settings, provisioner, fabric))
    }

    fn pair(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    /// Unlinked r1, r2, sw1, sw2, host1 and host2 behind a runner
    async fn bare_lab() -> (FakeCluster, BulkRunner) {
        let (cluster, _sleeper, runner) = lab(4).await;
        for name in ["r1", "sw1"] {
            cluster.store().delete(NS, name).await.unwrap();
        }
        let records = ["r1", "r2", "sw1", "sw2", "host1", "host2"]
            .into_iter()
            .map(|n| TopologyRecord::new(n, vec![]))
            .collect();
        cluster.seed(NS, records).await;
        (cluster, runner)
    }

    #[test]
    fn test_plan_links_orders_by_stage() {
        let pairs = vec![
            pair("sw1", "host1"),
            pair("sw1", "sw2"),
            pair("host1", "r1"),
            pair("r1", "sw1"),
            pair("fw1", "fw2"),
            pair("r1", "r2"),
        ];
        let (ordered, rejected) = plan_links(&pairs);
        assert_eq!(
            ordered,
            vec![
                pair("r1", "r2"),
                pair("r1", "sw1"),
                pair("sw1", "sw2"),
                pair("sw1", "host1"),
            ]
        );
        assert_eq!(rejected.len(), 2);
        assert!(rejected[1].contains("fw1"));
    }

    #[tokio::test]
    async fn test_add_links_builds_lab_in_order() {
        let (cluster, runner) = bare_lab().await;
        let pairs = vec![
            pair("sw1", "host1"),
            pair("sw1", "sw2"),
            pair("r1", "sw1"),
            pair("r1", "r2"),
        ];

        let report = runner.add_links(&pairs).await.unwrap();
        let actions: Vec<&str> = report.results.iter().map(|r| r.action.as_str()).collect();
        assert_eq!(
            actions,
            vec!["link r1 to r2", "link r1 to sw1", "link sw1 to sw2", "link sw1 to host1"]
        );
        assert_eq!(report.failed(), 0);

        // r1-r2 takes the first subnet, so sw1's gateway is on the second
        let host1 = cluster.store().get(NS, "host1").await.unwrap();
        assert_eq!(host1.primary_ip(), Some("10.12.2.2/24".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_add_links_stops_at_first_failure() {
        let (cluster, runner) = bare_lab().await;
        let pairs = vec![pair("sw2", "host1"), pair("r1", "sw1"), pair("sw1", "host2")];

        let report = runner.add_links(&pairs).await.unwrap();
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.results[1].action, "link sw2 to host1");
        assert_eq!(report.rejected, vec!["link sw1 to host2 not attempted"]);
        assert!(cluster.store().get(NS, "host2").await.unwrap().links().is_empty());
    }

    #[test]
    fn test_plan_additions_refuses_unsupported_children() {
        let graph = TopologyGraph::from_records(vec![
            TopologyRecord::new("sw1", vec![]),
            TopologyRecord::new("r1", vec![]),
        ]);
        let mut requests = BTreeMap::new();
        requests.insert(
            "sw1".to_string(),
            NodeRequest {
                hosts: 2,
                switches: 1,
                routers: 1,
            },
        );
        requests.insert(
            "r1".to_string(),
            NodeRequest {
                hosts: 1,
                switches: 0,
                routers: 1,
            },
        );
        requests.insert("host1".to_string(), NodeRequest::default());
        requests.insert("sw9".to_string(), NodeRequest::default());

        let (units, rejected) = plan_additions(&graph, &requests);
        assert_eq!(units.len(), 4);
        assert_eq!(
            units[0],
            BulkUnit::Add {
                kind: NodeKind::Router,
                attach: "r1".to_string()
            }
        );
        assert_eq!(rejected.len(), 4);
    }

    #[tokio::test]
    async fn test_add_nodes_counts_successes_and_staggers() {
        let (cluster, sleeper, runner) = lab(2).await;
        let mut requests = BTreeMap::new();
        requests.insert(
            "sw1".to_string(),
            NodeRequest {
                hosts: 3,
                ..Default::default()
            },
        );

        let report = runner.add_nodes(&requests).await.unwrap();
        assert_eq!(report.succeeded(), 3);
        assert_eq!(report.failed(), 0);

        let mut octets: Vec<u8> = Vec::new();
        for host in ["host1", "host2", "host3"] {
            let record = cluster.store().get(NS, host).await.unwrap();
            octets.push(record.primary_ip().unwrap().host_number());
        }
        octets.sort();
        assert_eq!(octets, vec![2, 3, 4]);

        let staggers = sleeper
            .recorded()
            .iter()
            .filter(|d| **d == Duration::from_secs(2))
            .count();
        assert!(staggers >= 2);
    }

    #[tokio::test]
    async fn test_add_subnets_adds_switch_then_host() {
        let (cluster, _sleeper, runner) = lab(4).await;
        let report = runner
            .add_subnets(&["r1".to_string(), "r7".to_string()])
            .await
            .unwrap();

        assert_eq!(report.rejected, vec!["r7 does not exist"]);
        assert_eq!(report.devices(), vec!["sw2", "host1"]);
        let host = cluster.store().get(NS, "host1").await.unwrap();
        assert_eq!(host.primary_ip().unwrap().to_string(), "10.12.2.2/24");
    }

    #[tokio::test]
    async fn test_delete_hosts_for_switches() {
        let (cluster, _sleeper, runner) = lab(4).await;
        let mut requests = BTreeMap::new();
        requests.insert(
            "sw1".to_string(),
            NodeRequest {
                hosts: 2,
                ..Default::default()
            },
        );
        runner.add_nodes(&requests).await.unwrap();

        let report = runner.delete_hosts_for_switches(&["sw1".to_string()]).await.unwrap();
        assert_eq!(report.succeeded(), 2);
        assert!(cluster.store().get(NS, "host1").await.is_err());
        assert_eq!(cluster.store().get(NS, "sw1").await.unwrap().links().len(), 1);

        let report = runner.delete_hosts_for_switches(&["sw1".to_string()]).await.unwrap();
        assert_eq!(report.rejected, vec!["sw1 has no hosts"]);
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn test_delete_nodes_reports_missing() {
        let (cluster, _sleeper, runner) = lab(4).await;
        let report = runner
            .delete_nodes(&["sw1".to_string(), "sw1".to_string(), "r5".to_string()])
            .await
            .unwrap();
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.rejected, vec!["r5 does not exist"]);
        assert!(cluster.store().get(NS, "sw1").await.is_err());
    }
}
