//! Device provisioning
//!
//! A new device is recorded before its workload exists: the CNI reads the
//! topology records when the pod starts and creates the veth pairs they
//! list. The order is therefore
//!
//! 1. under the allocation lock: name, addresses and link id allocated, the
//!    new record created and the attach point's half appended
//! 2. config map (routers) and pod created
//! 3. readiness polled with backoff
//! 4. the attach point's end post-wired
//!
//! Any failure after step 1 rolls back eagerly: pod, config map, record and
//! the attach point's half are removed before the error is returned.

pub mod readiness;

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub use readiness::{wait_gone, wait_ready};

use crate::cluster::{ClusterHandles, PodPhase, WorkloadError};
use crate::config::Settings;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::fabric::{plan_addresses, Wiring};
use crate::topology::allocator::{next_link_id, next_node_name};
use crate::topology::{
    link_pair, load_graph, update_links, AllocationLocks, HalfLink, NodeKind, StoreError,
    TopologyRecord,
};
use crate::workload::router_config_name;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("Workload '{name}' not ready after {attempts} polls")]
    Timeout { name: String, attempts: u32 },

    #[error("Workload '{name}' reached terminal phase {phase:?}")]
    TerminalPhase { name: String, phase: PodPhase },

    #[error("Workload '{0}' disappeared while starting")]
    Vanished(String),

    #[error(transparent)]
    Workload(#[from] WorkloadError),
}

/// Which kinds a new device may hang off
pub fn check_attachment(kind: NodeKind, attach: Option<NodeKind>) -> OrchestratorResult<()> {
    use NodeKind::*;
    let allowed = matches!(
        (kind, attach),
        (Host, Some(Switch))
            | (Switch, Some(Switch | Firewall | Router))
            | (Firewall, Some(Router))
            | (Router, Some(Router) | None)
    );
    if allowed {
        return Ok(());
    }
    Err(OrchestratorError::Unsupported(match attach {
        Some(parent) => format!("cannot attach a {} to a {}", kind, parent),
        None => format!("a {} needs an attach point", kind),
    }))
}

/// Result of removing a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Removal {
    pub name: String,
    /// Nodes whose half-link to the device was scrubbed
    pub neighbors: Vec<String>,
    /// Nodes still holding a half-link to the device
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unscrubbed: Vec<String>,
}

/// Records written for a device that is not yet running
struct Reservation {
    record: TopologyRecord,
    attachment: Option<(String, HalfLink)>,
    gateway: Option<Ipv4Addr>,
}

impl Reservation {
    fn name(&self) -> &str {
        self.record.name()
    }
}

#[derive(Clone)]
pub struct DeviceProvisioner {
    handles: ClusterHandles,
    settings: Arc<Settings>,
    locks: AllocationLocks,
}

impl DeviceProvisioner {
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

    /// Provision a new `kind` device linked to `attach`, returning its name
    pub async fn add_device(&self, kind: NodeKind, attach: Option<&str>) -> OrchestratorResult<String> {
        let attach = match attach {
            Some(name) => Some((name, NodeKind::require(name)?)),
            None => None,
        };
        check_attachment(kind, attach.map(|(_, k)| k))?;

        let reservation = self.reserve(kind, attach).await?;
        info!(
            "Provisioning {}{}",
            reservation.name(),
            reservation
                .attachment
                .as_ref()
                .map(|(a, _)| format!(" on {}", a))
                .unwrap_or_default()
        );

        match self.bring_up(&reservation).await {
            Ok(()) => {
                info!("{} is up", reservation.name());
                Ok(reservation.name().to_string())
            }
            Err(e) => {
                warn!("Provisioning {} failed, rolling back: {}", reservation.name(), e);
                self.rollback(&reservation).await;
                Err(e)
            }
        }
    }

    async fn reserve(
        &self,
        kind: NodeKind,
        attach: Option<(&str, NodeKind)>,
    ) -> OrchestratorResult<Reservation> {
        let ns = self.namespace();
        let store = self.handles.store.as_ref();
        let _guard = self.locks.acquire(ns).await;
        let graph = load_graph(store, ns).await?;
        let name = next_node_name(kind, &graph);

        let Some((parent, parent_kind)) = attach else {
            let record = store.create(ns, &TopologyRecord::new(&name, vec![])).await?;
            return Ok(Reservation {
                record,
                attachment: None,
                gateway: None,
            });
        };

        if !graph.contains(parent) {
            return Err(OrchestratorError::NodeNotFound(parent.to_string()));
        }
        let plan = plan_addresses(
            &graph,
            self.settings.address_space,
            (parent, parent_kind),
            (&name, kind),
        )?;
        let uid = next_link_id(&graph);
        let (parent_half, new_half) = link_pair(uid, parent, &name, plan.a_ip, plan.b_ip);

        let record = store
            .create(ns, &TopologyRecord::new(&name, vec![new_half]))
            .await?;
        let appended = update_links(store, ns, parent, self.settings.conflict_retries, |links| {
            links.retain(|l| l.uid != parent_half.uid);
            links.push(parent_half.clone());
        })
        .await;
        if let Err(e) = appended {
            if let Err(cleanup) = store.delete(ns, &name).await {
                warn!("Could not delete record {}: {}", name, cleanup);
            }
            return Err(e.into());
        }

        Ok(Reservation {
            record,
            attachment: Some((parent.to_string(), parent_half)),
            gateway: plan.gateway,
        })
    }

    async fn bring_up(&self, reservation: &Reservation) -> OrchestratorResult<()> {
        let ns = self.namespace();
        let name = reservation.name();
        let workload = self
            .settings
            .template()
            .for_record(&reservation.record, reservation.gateway)?;

        if let Some(config_map) = &workload.config_map {
            self.handles.workloads.create_config_map(ns, config_map).await?;
        }
        self.handles.workloads.create_pod(ns, &workload.pod).await?;
        wait_ready(
            self.handles.workloads.as_ref(),
            self.handles.sleeper.as_ref(),
            ns,
            name,
            &self.settings.readiness,
        )
        .await?;

        if let Some((parent, half)) = &reservation.attachment {
            self.wiring().post_wire(parent, half, None).await?;
        }
        Ok(())
    }

    async fn rollback(&self, reservation: &Reservation) {
        let ns = self.namespace();
        let name = reservation.name();
        self.delete_workload(name).await;
        if let Err(e) = self.handles.store.delete(ns, name).await {
            warn!("Could not delete record {}: {}", name, e);
        }
        if let Some((parent, half)) = &reservation.attachment {
            let scrubbed = update_links(
                self.handles.store.as_ref(),
                ns,
                parent,
                self.settings.conflict_retries,
                |links| links.retain(|l| l.uid != half.uid),
            )
            .await;
            if let Err(e) = scrubbed {
                warn!("Could not remove link {} from {}: {}", half.uid, parent, e);
            }
            self.wiring()
                .teardown_best_effort(parent, &half.local_interface)
                .await;
        }
    }

    /// Delete pod and config map, logging anything but not-found
    async fn delete_workload(&self, name: &str) {
        if let Err(e) = self.delete_pod_and_config(name).await {
            warn!("Could not delete workload {}: {}", name, e);
        }
    }

    async fn delete_pod_and_config(&self, name: &str) -> Result<(), WorkloadError> {
        let ns = self.namespace();
        match self.handles.workloads.delete_pod(ns, name).await {
            Ok(()) | Err(WorkloadError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if NodeKind::of_name(name) == Some(NodeKind::Router) {
            match self
                .handles
                .workloads
                .delete_config_map(ns, &router_config_name(name))
                .await
            {
                Ok(()) | Err(WorkloadError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Delete a device, scrub every half-link pointing at it, then its
    /// workload.
    ///
    /// Half-links left behind by an earlier partial removal are scrubbed
    /// even though the device's own record is gone.
    pub async fn remove_device(&self, name: &str) -> OrchestratorResult<Removal> {
        NodeKind::require(name)?;
        let ns = self.namespace();
        let store = self.handles.store.as_ref();

        let mut scrubbed = Vec::new();
        let mut unscrubbed = Vec::new();
        {
            let _guard = self.locks.acquire(ns).await;
            let graph = load_graph(store, ns).await?;
            if graph.contains(name) {
                match store.delete(ns, name).await {
                    Ok(()) | Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            } else if graph.records().any(|r| r.link_to(name).is_some()) {
                warn!("{} has no record, scrubbing stale half-links to it", name);
            } else {
                return Err(OrchestratorError::NodeNotFound(name.to_string()));
            }

            for record in graph.records().filter(|r| r.name() != name) {
                let Some(half) = record.link_to(name) else {
                    continue;
                };
                let neighbor = record.name().to_string();
                let result = update_links(store, ns, &neighbor, self.settings.conflict_retries, |links| {
                    links.retain(|l| l.peer != name)
                })
                .await;
                match result {
                    Ok(_) => scrubbed.push((neighbor, half.local_interface.clone())),
                    Err(e) => {
                        warn!("Could not scrub {} from {}: {}", name, neighbor, e);
                        unscrubbed.push(neighbor);
                    }
                }
            }
        }

        let wiring = self.wiring();
        for (neighbor, iface) in &scrubbed {
            wiring.teardown_best_effort(neighbor, iface).await;
        }
        self.delete_pod_and_config(name).await?;
        info!("Removed {} ({} neighbors)", name, scrubbed.len());

        Ok(Removal {
            name: name.to_string(),
            neighbors: scrubbed.into_iter().map(|(n, _)| n).collect(),
            unscrubbed,
        })
    }

    /// Recreate a switch or router workload from its current record and
    /// rewire its neighbors
    pub async fn reboot_device(&self, name: &str) -> OrchestratorResult<()> {
        let kind = NodeKind::require(name)?;
        if !matches!(kind, NodeKind::Switch | NodeKind::Router) {
            return Err(OrchestratorError::Unsupported(format!("cannot reboot a {}", kind)));
        }
        let ns = self.namespace();
        let record = match self.handles.store.get(ns, name).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                return Err(OrchestratorError::NodeNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let workload = self.settings.template().for_record(&record, None)?;

        let wiring = self.wiring();
        for link in record.links() {
            wiring.teardown_best_effort(&link.peer, &link.peer_interface).await;
        }

        match self.handles.workloads.delete_pod(ns, name).await {
            Ok(()) | Err(WorkloadError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        wait_gone(
            self.handles.workloads.as_ref(),
            self.handles.sleeper.as_ref(),
            ns,
            name,
            &self.settings.readiness,
        )
        .await?;

        if let Some(config_map) = &workload.config_map {
            match self.handles.workloads.create_config_map(ns, config_map).await {
                Ok(()) | Err(WorkloadError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.handles.workloads.create_pod(ns, &workload.pod).await?;
        wait_ready(
            self.handles.workloads.as_ref(),
            self.handles.sleeper.as_ref(),
            ns,
            name,
            &self.settings.readiness,
        )
        .await?;

        for link in record.links() {
            let peer_half = link.mirror(name);
            match NodeKind::of_name(&link.peer) {
                Some(NodeKind::Switch) => {
                    wiring
                        .attach_switch_port(&link.peer, &link.peer_interface)
                        .await?
                }
                Some(NodeKind::Host) => {
                    // Hosts route via .1 of their own subnet
                    if let Some(ip) = link.peer_ip {
                        let gateway = ip.subnet().host(1).addr;
                        wiring
                            .add_host_route(&link.peer, &link.peer_interface, gateway)
                            .await?;
                    }
                }
                Some(NodeKind::Firewall) => wiring.post_wire(&link.peer, &peer_half, None).await?,
                Some(NodeKind::Router) | None => {}
            }
        }
        info!("{} rebooted", name);
        Ok(())
    }
}
