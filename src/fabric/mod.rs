//! Link fabric controller
//!
//! Adding a link is a fixed protocol:
//!
//! 1. policy check on the two names, before any read
//! 2. under the namespace allocation lock: snapshot, address plan, link id,
//!    and both half-links written
//! 3. the link agent creates the veth pair with the planned addresses
//! 4. each endpoint is post-wired through exec ([`wiring`])
//!
//! A failure in steps 3 or 4 rolls the link back: both halves are removed
//! from the records and whatever interfaces exist are torn down.

pub mod commands;
pub mod policy;
pub mod wiring;

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub use policy::{check_adjacency, plan_addresses, LinkPlan, PolicyError};
pub use wiring::Wiring;

use crate::cluster::{AgentError, ClusterHandles, LinkRequest};
use crate::config::Settings;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::topology::allocator::next_link_id;
use crate::topology::{
    link_pair, load_graph, update_links, AllocationLocks, HalfLink, InterfaceAddress, StoreError,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    #[error("Link agent failed for '{0}': {1}")]
    Agent(String, AgentError),

    #[error("Port {iface} never appeared on {switch}'s bridge after {attempts} attempts")]
    BridgePortUnverified {
        switch: String,
        iface: String,
        attempts: u32,
    },

    #[error("Interface {iface} did not appear in '{pod}' within {waited_secs}s")]
    InterfaceMissing {
        pod: String,
        iface: String,
        waited_secs: u64,
    },

    #[error("'{command}' failed in '{pod}': {message}")]
    Exec {
        pod: String,
        command: String,
        message: String,
    },
}

/// A link that was written and wired
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkOutcome {
    pub uid: u32,
    pub a: String,
    pub b: String,
    pub a_ip: Option<InterfaceAddress>,
    pub b_ip: Option<InterfaceAddress>,
}

fn ip_field(ip: Option<InterfaceAddress>) -> String {
    ip.map(|ip| ip.to_string()).unwrap_or_default()
}

#[derive(Clone)]
pub struct LinkFabric {
    handles: ClusterHandles,
    settings: Arc<Settings>,
    locks: AllocationLocks,
}

impl LinkFabric {
    pub fn new(handles: ClusterHandles, settings: Arc<Settings>, locks: AllocationLocks) -> Self {
        Self {
            handles,
            settings,
            locks,
        }
    }

    fn namespace(&self) -> &str {
        &self.settings.namespace
    }

    fn wiring(&self) -> Wiring<'_> {
        Wiring::new(&self.handles, &self.settings, &self.settings.namespace)
    }

    /// Link `a` and `b`, address the link and wire both ends
    pub async fn add_link(&self, a: &str, b: &str) -> OrchestratorResult<LinkOutcome> {
        let (kind_a, kind_b) = check_adjacency(a, b)?;
        let ns = self.namespace();

        let (a_half, b_half, gateway) = {
            let _guard = self.locks.acquire(ns).await;
            let graph = load_graph(self.handles.store.as_ref(), ns).await?;
            for name in [a, b] {
                if !graph.contains(name) {
                    return Err(OrchestratorError::NodeNotFound(name.to_string()));
                }
            }
            if graph.neighbors(a).any(|peer| peer == b) || graph.neighbors(b).any(|peer| peer == a) {
                return Err(OrchestratorError::AlreadyLinked(a.to_string(), b.to_string()));
            }

            let plan = plan_addresses(&graph, self.settings.address_space, (a, kind_a), (b, kind_b))?;
            let uid = next_link_id(&graph);
            let (a_half, b_half) = link_pair(uid, a, b, plan.a_ip, plan.b_ip);
            self.write_halves(a, &a_half, b, &b_half).await?;
            (a_half, b_half, plan.gateway)
        };
        info!(
            "Recorded link {} {} ({}) <-> {} ({})",
            a_half.uid,
            a,
            ip_field(a_half.local_ip),
            b,
            ip_field(b_half.local_ip)
        );

        if let Err(e) = self.materialize(a, &a_half, b, &b_half, gateway).await {
            warn!("Link {} <-> {} failed, rolling back: {}", a, b, e);
            self.rollback(a, &a_half, b, &b_half).await;
            return Err(e.into());
        }

        Ok(LinkOutcome {
            uid: a_half.uid,
            a: a.to_string(),
            b: b.to_string(),
            a_ip: a_half.local_ip,
            b_ip: b_half.local_ip,
        })
    }

    /// Tear down and forget the link between `a` and `b`.
    ///
    /// One endpoint may have lost its record already; the half left on the
    /// other one is still removed.
    pub async fn remove_link(&self, a: &str, b: &str) -> OrchestratorResult<()> {
        let ns = self.namespace();
        let graph = load_graph(self.handles.store.as_ref(), ns).await?;
        if let Some(missing) = [a, b].into_iter().find(|n| !graph.contains(n)) {
            if !graph.contains(a) && !graph.contains(b) {
                return Err(OrchestratorError::NodeNotFound(missing.to_string()));
            }
            warn!("{} has no record, removing the stale half of its link", missing);
        }

        let a_half = graph.get(a).and_then(|r| r.link_to(b)).cloned();
        let b_half = graph.get(b).and_then(|r| r.link_to(a)).cloned();
        let (a_iface, b_iface) = match (&a_half, &b_half) {
            (Some(half), _) => (half.local_interface.clone(), half.peer_interface.clone()),
            (None, Some(half)) => (half.peer_interface.clone(), half.local_interface.clone()),
            (None, None) => {
                return Err(OrchestratorError::NotLinked(a.to_string(), b.to_string()));
            }
        };

        let wiring = self.wiring();
        for (node, iface) in [(a, &a_iface), (b, &b_iface)] {
            if graph.contains(node) {
                wiring.teardown_best_effort(node, iface).await;
            }
        }

        for (owner, peer) in [(a, b), (b, a)] {
            match update_links(
                self.handles.store.as_ref(),
                ns,
                owner,
                self.settings.conflict_retries,
                |links| links.retain(|l| l.peer != peer),
            )
            .await
            {
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!("Removed link {} <-> {}", a, b);
        Ok(())
    }

    /// Move `node`'s link from `old_peer` to `new_peer`
    pub async fn rewire_link(
        &self,
        node: &str,
        old_peer: &str,
        new_peer: &str,
    ) -> OrchestratorResult<LinkOutcome> {
        check_adjacency(node, new_peer)?;
        self.remove_link(node, old_peer).await?;
        self.add_link(node, new_peer).await
    }

    /// Write both halves; a failed second write takes the first back out
    async fn write_halves(
        &self,
        a: &str,
        a_half: &HalfLink,
        b: &str,
        b_half: &HalfLink,
    ) -> Result<(), StoreError> {
        self.append(a, a_half).await?;
        if let Err(e) = self.append(b, b_half).await {
            self.forget_uid(a, a_half.uid).await;
            return Err(e);
        }
        Ok(())
    }

    async fn append(&self, owner: &str, half: &HalfLink) -> Result<(), StoreError> {
        update_links(
            self.handles.store.as_ref(),
            self.namespace(),
            owner,
            self.settings.conflict_retries,
            |links| {
                links.retain(|l| l.uid != half.uid);
                links.push(half.clone());
            },
        )
        .await
        .map(|_| ())
    }

    async fn forget_uid(&self, owner: &str, uid: u32) {
        let result = update_links(
            self.handles.store.as_ref(),
            self.namespace(),
            owner,
            self.settings.conflict_retries,
            |links| links.retain(|l| l.uid != uid),
        )
        .await;
        if let Err(e) = result {
            warn!("Could not remove link {} from {}: {}", uid, owner, e);
        }
    }

    async fn materialize(
        &self,
        a: &str,
        a_half: &HalfLink,
        b: &str,
        b_half: &HalfLink,
        gateway: Option<Ipv4Addr>,
    ) -> Result<(), FabricError> {
        let request = LinkRequest {
            pod_a: a.to_string(),
            iface_a: a_half.local_interface.clone(),
            ip_a: ip_field(a_half.local_ip),
            pod_b: b.to_string(),
            iface_b: b_half.local_interface.clone(),
            ip_b: ip_field(b_half.local_ip),
            namespace: self.namespace().to_string(),
        };
        self.handles
            .agent
            .make_link(&request)
            .await
            .map_err(|e| FabricError::Agent(a.to_string(), e))?;

        let wiring = self.wiring();
        wiring.post_wire(a, a_half, gateway).await?;
        wiring.post_wire(b, b_half, gateway).await?;
        Ok(())
    }

    async fn rollback(&self, a: &str, a_half: &HalfLink, b: &str, b_half: &HalfLink) {
        let wiring = self.wiring();
        wiring.teardown_best_effort(a, &a_half.local_interface).await;
        wiring.teardown_best_effort(b, &b_half.local_interface).await;
        self.forget_uid(a, a_half.uid).await;
        self.forget_uid(b, b_half.uid).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::FakeCluster;
    use crate::topology::{TopologyRecord, TopologyStore};

    const NS: &str = "default";

    fn addr(s: &str) -> InterfaceAddress {
        s.parse().unwrap()
    }

    /// r1 - sw1, plus an unlinked host1, sw2, fw1 and r2
    async fn lab() -> (FakeCluster, LinkFabric) {
        let (r, sw) = link_pair(1, "r1", "sw1", Some(addr("10.12.1.1/24")), None);
        let cluster = FakeCluster::new();
        cluster
            .seed(
                NS,
                vec![
                    TopologyRecord::new("r1", vec![r]),
                    TopologyRecord::new("sw1", vec![sw]),
                    TopologyRecord::new("host1", vec![]),
                    TopologyRecord::new("sw2", vec![]),
                    TopologyRecord::new("fw1", vec![]),
                    TopologyRecord::new("r2", vec![]),
                ],
            )
            .await;
        let fabric = LinkFabric::new(
            cluster.handles(),
            Arc::new(Settings::default()),
            AllocationLocks::new(),
        );
        (cluster, fabric)
    }

    async fn links(cluster: &FakeCluster, name: &str) -> Vec<HalfLink> {
        cluster.store().get(NS, name).await.unwrap().spec.links
    }

    #[tokio::test]
    async fn test_add_host_link_addresses_and_routes() {
        let (cluster, fabric) = lab().await;
        let outcome = fabric.add_link("sw1", "host1").await.unwrap();

        assert_eq!(outcome.uid, 2);
        assert_eq!(outcome.a_ip, None);
        assert_eq!(outcome.b_ip, Some(addr("10.12.1.2/24")));

        let host = links(&cluster, "host1").await;
        assert_eq!(host[0].local_ip, Some(addr("10.12.1.2/24")));
        let switch = links(&cluster, "sw1").await;
        assert_eq!(switch[1].peer_ip, Some(addr("10.12.1.2/24")));

        let sw1 = cluster.device(NS, "sw1").unwrap();
        assert!(sw1.bridge_ports.contains("sw1_host1"));
        let host1 = cluster.device(NS, "host1").unwrap();
        assert_eq!(host1.routes, vec!["10.12.0.0/16 via 10.12.1.1"]);
        assert_eq!(cluster.agent_calls(), vec!["link sw1:sw1_host1 host1:host1_sw1"]);
    }

    #[tokio::test]
    async fn test_policy_rejection_touches_nothing() {
        let (cluster, fabric) = lab().await;
        let result = fabric.add_link("host1", "r2").await;
        assert!(matches!(result, Err(OrchestratorError::Policy(PolicyError::ForbiddenPair(_, _)))));
        assert!(links(&cluster, "host1").await.is_empty());
        assert!(cluster.agent_calls().is_empty());
    }

    #[tokio::test]
    async fn test_host_without_router_is_not_recorded() {
        let (cluster, fabric) = lab().await;
        let result = fabric.add_link("host1", "sw2").await;
        assert!(matches!(result, Err(OrchestratorError::NoRoute(s)) if s == "sw2"));
        assert!(links(&cluster, "host1").await.is_empty());
        assert!(links(&cluster, "sw2").await.is_empty());
    }

    #[tokio::test]
    async fn test_router_pair_uses_fresh_subnet() {
        let (cluster, fabric) = lab().await;
        let outcome = fabric.add_link("r1", "r2").await.unwrap();
        assert_eq!(outcome.a_ip, Some(addr("10.12.2.1/24")));
        assert_eq!(outcome.b_ip, Some(addr("10.12.2.2/24")));
        let r2 = links(&cluster, "r2").await;
        assert_eq!(r2[0].peer_ip, Some(addr("10.12.2.1/24")));
    }

    #[tokio::test]
    async fn test_firewall_end_is_bridged() {
        let (cluster, fabric) = lab().await;
        fabric.add_link("sw2", "fw1").await.unwrap();
        let fw1 = cluster.device(NS, "fw1").unwrap();
        assert!(fw1.bridge_ports.contains("fw1_sw2"));
        let sw2 = cluster.device(NS, "sw2").unwrap();
        assert!(sw2.bridge_ports.contains("sw2_fw1"));
    }

    #[tokio::test]
    async fn test_duplicate_link_rejected() {
        let (_cluster, fabric) = lab().await;
        let result = fabric.add_link("sw1", "r1").await;
        assert!(matches!(result, Err(OrchestratorError::AlreadyLinked(_, _))));
    }

    #[tokio::test]
    async fn test_agent_failure_rolls_back_records() {
        let (cluster, fabric) = lab().await;
        cluster.set_agent_failure(true);
        let result = fabric.add_link("sw2", "fw1").await;
        assert!(matches!(result, Err(OrchestratorError::Fabric(FabricError::Agent(_, _)))));
        assert!(links(&cluster, "sw2").await.is_empty());
        assert!(links(&cluster, "fw1").await.is_empty());
    }

    #[tokio::test]
    async fn test_unverified_port_rolls_back() {
        let (cluster, fabric) = lab().await;
        cluster.set_ignore_port_adds(true);
        let result = fabric.add_link("sw1", "host1").await;
        assert!(matches!(
            result,
            Err(OrchestratorError::Fabric(FabricError::BridgePortUnverified { .. }))
        ));
        assert_eq!(links(&cluster, "sw1").await.len(), 1);
        assert!(links(&cluster, "host1").await.is_empty());
        assert!(!cluster.device(NS, "host1").unwrap().interfaces.contains("host1_sw1"));
    }

    #[tokio::test]
    async fn test_remove_link_clears_both_halves() {
        let (cluster, fabric) = lab().await;
        fabric.add_link("sw1", "host1").await.unwrap();
        fabric.remove_link("host1", "sw1").await.unwrap();

        assert_eq!(links(&cluster, "sw1").await.len(), 1);
        assert!(links(&cluster, "host1").await.is_empty());
        assert!(!cluster.device(NS, "sw1").unwrap().bridge_ports.contains("sw1_host1"));

        let again = fabric.remove_link("host1", "sw1").await;
        assert!(matches!(again, Err(OrchestratorError::NotLinked(_, _))));
    }

    #[tokio::test]
    async fn test_rewire_moves_link() {
        let (cluster, fabric) = lab().await;
        fabric.add_link("sw2", "fw1").await.unwrap();
        let outcome = fabric.rewire_link("fw1", "sw2", "r2").await.unwrap();

        assert_eq!(outcome.b_ip, Some(addr("10.12.2.1/24")));
        assert!(links(&cluster, "sw2").await.is_empty());
        let fw1 = links(&cluster, "fw1").await;
        assert_eq!(fw1.len(), 1);
        assert_eq!(fw1[0].peer, "r2");
    }

    #[tokio::test]
    async fn test_every_uid_has_two_swapped_halves() {
        let (cluster, fabric) = lab().await;
        fabric.add_link("sw1", "host1").await.unwrap();
        fabric.add_link("sw1", "sw2").await.unwrap();
        fabric.add_link("r1", "r2").await.unwrap();

        let graph = load_graph(cluster.store(), NS).await.unwrap();
        assert!(graph.check_symmetry().is_empty());
        assert_eq!(graph.edges().len(), 4);
    }

    #[tokio::test]
    async fn test_remove_link_clears_half_left_by_missing_record() {
        let (cluster, fabric) = lab().await;
        fabric.add_link("sw1", "host1").await.unwrap();
        cluster.store().delete(NS, "host1").await.unwrap();

        fabric.remove_link("sw1", "host1").await.unwrap();

        assert_eq!(links(&cluster, "sw1").await.len(), 1);
        let graph = load_graph(cluster.store(), NS).await.unwrap();
        assert!(graph.check_symmetry().is_empty());
        assert!(!cluster.agent_calls().iter().any(|c| c.starts_with("unlink host1")));
    }

    #[tokio::test]
    async fn test_remove_link_between_unknown_nodes() {
        let (_cluster, fabric) = lab().await;
        let result = fabric.remove_link("sw8", "host9").await;
        assert!(matches!(result, Err(OrchestratorError::NodeNotFound(n)) if n == "sw8"));
    }

    #[tokio::test]
    async fn test_remove_link_survives_failed_teardown() {
        let (cluster, fabric) = lab().await;
        fabric.add_link("sw1", "sw2").await.unwrap();
        cluster.set_exec_failure("sw1", true);
        cluster.set_exec_failure("sw2", true);

        fabric.remove_link("sw1", "sw2").await.unwrap();

        assert_eq!(links(&cluster, "sw1").await.len(), 1);
        assert!(links(&cluster, "sw2").await.is_empty());
    }
}
