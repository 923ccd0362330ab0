//! In-device wiring through pod exec
//!
//! Each endpoint kind finishes a link differently once the veth exists:
//! switches bind the port to OVS `br0` and verify it, hosts wait for the
//! interface and install the route to the address space, firewalls bridge
//! the interface. Routers need nothing; FRR picks up new interfaces.

use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use super::commands;
use super::FabricError;
use crate::cluster::{ClusterHandles, ExecOutput, UnlinkRequest};
use crate::config::Settings;
use crate::topology::{HalfLink, NodeKind};

/// Exec-driven wiring inside one namespace
pub struct Wiring<'a> {
    handles: &'a ClusterHandles,
    settings: &'a Settings,
    namespace: &'a str,
}

impl<'a> Wiring<'a> {
    pub fn new(handles: &'a ClusterHandles, settings: &'a Settings, namespace: &'a str) -> Self {
        Self {
            handles,
            settings,
            namespace,
        }
    }

    /// Run a command; a non-zero exit is returned, not raised
    pub async fn run(&self, pod: &str, command: &[String]) -> Result<ExecOutput, FabricError> {
        self.handles
            .exec
            .exec(self.namespace, pod, command)
            .await
            .map_err(|e| FabricError::Exec {
                pod: pod.to_string(),
                command: command.join(" "),
                message: e.to_string(),
            })
    }

    /// Run a command that must succeed
    pub async fn run_checked(&self, pod: &str, command: &[String]) -> Result<ExecOutput, FabricError> {
        let output = self.run(pod, command).await?;
        if !output.success {
            return Err(FabricError::Exec {
                pod: pod.to_string(),
                command: command.join(" "),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Add `iface` to the switch's OVS bridge and confirm it is listed.
    ///
    /// Each attempt issues `add-port` and then re-reads `list-ports` a few
    /// times one interval apart; attempts are spaced by the bridge backoff.
    pub async fn attach_switch_port(&self, switch: &str, iface: &str) -> Result<(), FabricError> {
        let backoff = self.settings.bridge_verify;
        let checks = self.settings.bridge_checks_per_attempt.max(1);
        let interval = self.settings.interface_wait.interval();

        for attempt in 0..backoff.max_attempts {
            let added = self.run(switch, &commands::add_bridge_port(iface)).await?;
            if !added.success {
                debug!("add-port {} on {} failed: {}", iface, switch, added.stderr.trim());
            }

            for check in 0..checks {
                let listed = self.run(switch, &commands::list_bridge_ports()).await?;
                if listed.success && commands::port_listed(&listed.stdout, iface) {
                    info!("Port {} bound to {} on {}", iface, crate::workload::BRIDGE, switch);
                    return Ok(());
                }
                if check + 1 < checks {
                    self.handles.sleeper.sleep(interval).await;
                }
            }

            if attempt + 1 < backoff.max_attempts {
                let delay = backoff.delay(attempt);
                warn!(
                    "Port {} not yet on {} (attempt {}/{}), retrying in {:?}",
                    iface,
                    switch,
                    attempt + 1,
                    backoff.max_attempts,
                    delay
                );
                self.handles.sleeper.sleep(delay).await;
            }
        }

        Err(FabricError::BridgePortUnverified {
            switch: switch.to_string(),
            iface: iface.to_string(),
            attempts: backoff.max_attempts,
        })
    }

    /// Poll `ip link show` until the interface exists
    pub async fn wait_for_interface(&self, pod: &str, iface: &str) -> Result<(), FabricError> {
        let wait = self.settings.interface_wait;
        let checks = wait.checks();
        for check in 0..checks {
            let output = self.run(pod, &commands::link_show(iface)).await?;
            if output.success {
                return Ok(());
            }
            if check + 1 < checks {
                self.handles.sleeper.sleep(wait.interval()).await;
            }
        }
        Err(FabricError::InterfaceMissing {
            pod: pod.to_string(),
            iface: iface.to_string(),
            waited_secs: wait.budget_secs,
        })
    }

    /// Route the whole address space via `gateway` once `iface` is up.
    ///
    /// An existing route counts as success.
    pub async fn add_host_route(&self, host: &str, iface: &str, gateway: Ipv4Addr) -> Result<(), FabricError> {
        self.wait_for_interface(host, iface).await?;
        let cidr = self.settings.address_space.cidr();
        let command = commands::route_add(&cidr, gateway);
        let output = self.run(host, &command).await?;
        if output.success || output.stderr.contains("File exists") {
            info!("Host {} routes {} via {}", host, cidr, gateway);
            return Ok(());
        }
        Err(FabricError::Exec {
            pod: host.to_string(),
            command: command.join(" "),
            message: output.stderr.trim().to_string(),
        })
    }

    /// Enslave `iface` to the firewall's Linux bridge and bring it up
    pub async fn bridge_firewall_interface(&self, firewall: &str, iface: &str) -> Result<(), FabricError> {
        self.wait_for_interface(firewall, iface).await?;
        self.run_checked(firewall, &commands::linux_bridge_add(iface)).await?;
        self.run_checked(firewall, &commands::link_up(iface)).await?;
        info!("Bridged {} on firewall {}", iface, firewall);
        Ok(())
    }

    /// Finish `node`'s end of a link.
    ///
    /// `gateway` is the route target when `node` is a host.
    pub async fn post_wire(
        &self,
        node: &str,
        half: &HalfLink,
        gateway: Option<Ipv4Addr>,
    ) -> Result<(), FabricError> {
        match NodeKind::of_name(node) {
            Some(NodeKind::Switch) => self.attach_switch_port(node, &half.local_interface).await,
            Some(NodeKind::Host) => match gateway {
                Some(gw) => self.add_host_route(node, &half.local_interface, gw).await,
                None => self.wait_for_interface(node, &half.local_interface).await,
            },
            Some(NodeKind::Firewall) => {
                self.bridge_firewall_interface(node, &half.local_interface).await
            }
            Some(NodeKind::Router) | None => Ok(()),
        }
    }

    /// Remove `node`'s end of a link from the device.
    ///
    /// Switches drop the OVS port. Other kinds ask the link agent to delete
    /// the interface and fall back to `ip link delete` when it refuses.
    pub async fn teardown_interface(&self, node: &str, iface: &str) -> Result<(), FabricError> {
        if NodeKind::of_name(node) == Some(NodeKind::Switch) {
            self.run_checked(node, &commands::del_bridge_port(iface)).await?;
            debug!("Tore down port {} on {}", iface, node);
            return Ok(());
        }

        let request = UnlinkRequest {
            pod: node.to_string(),
            iface: iface.to_string(),
            namespace: self.namespace.to_string(),
        };
        match self.handles.agent.delete_link(&request).await {
            Ok(()) => {
                debug!("Link agent deleted {} on {}", iface, node);
                Ok(())
            }
            Err(e) => {
                debug!("Link agent could not delete {} on {}: {}", iface, node, e);
                self.run_checked(node, &commands::link_delete(iface)).await?;
                debug!("Deleted {} on {}", iface, node);
                Ok(())
            }
        }
    }

    /// Teardown that only logs failures
    pub async fn teardown_best_effort(&self, node: &str, iface: &str) {
        if let Err(e) = self.teardown_interface(node, iface).await {
            warn!("Cleanup of {} on {} failed: {}", iface, node, e);
        }
    }
}
