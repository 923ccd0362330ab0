//! Workload manifests - one privileged pod per emulated device
//!
//! Every pod has the same skeleton:
//! - an `initclient` init container that registers the pod with the CNI
//!   and sees `POD_NAME`, `POD_NAMESPACE` and `HOST_IP` through the
//!   downward API
//! - a privileged `pod` container whose start command sets up the device
//!   (bridge, forwarding, default route) and then sleeps
//!
//! Routers additionally ship their FRR configuration as a config map
//! mounted at `/etc/frr`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::topology::{AddressSpace, ModelError, NodeKind, Subnet, TopologyRecord};

/// Name of the device container in every pod
pub const DEVICE_CONTAINER: &str = "pod";

/// Name of the init container
pub const INIT_CONTAINER: &str = "initclient";

/// Bridge name used by both OVS switches and Linux-bridge firewalls
pub const BRIDGE: &str = "br0";

/// Container images per device kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadImages {
    #[serde(default = "default_init_image")]
    pub init: String,
    #[serde(default = "default_alpine_image")]
    pub host: String,
    #[serde(default = "default_switch_image")]
    pub switch: String,
    #[serde(default = "default_alpine_image")]
    pub firewall: String,
    #[serde(default = "default_router_image")]
    pub router: String,
}

fn default_init_image() -> String {
    "initclient:latest".to_string()
}

fn default_alpine_image() -> String {
    "alpine:latest".to_string()
}

fn default_switch_image() -> String {
    "openvswitch/ovs:2.11.2_debian".to_string()
}

fn default_router_image() -> String {
    "frrouting/frr:v8.5.0".to_string()
}

impl Default for WorkloadImages {
    fn default() -> Self {
        Self {
            init: default_init_image(),
            host: default_alpine_image(),
            switch: default_switch_image(),
            firewall: default_alpine_image(),
            router: default_router_image(),
        }
    }
}

impl WorkloadImages {
    pub fn for_kind(&self, kind: NodeKind) -> &str {
        match kind {
            NodeKind::Host => &self.host,
            NodeKind::Switch => &self.switch,
            NodeKind::Firewall => &self.firewall,
            NodeKind::Router => &self.router,
        }
    }
}

// ============================================================================
// Manifest types (the subset of the pod API the devices need)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    pub image_pull_policy: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    pub value_from: EnvVarSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVarSource {
    pub field_ref: FieldRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRef {
    pub field_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapVolume>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPathVolume {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMapVolume {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub data: BTreeMap<String, String>,
}

impl PodManifest {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn device_container(&self) -> Option<&Container> {
        self.spec.containers.iter().find(|c| c.name == DEVICE_CONTAINER)
    }

    /// Start script of the device container (`sh -c <script>`)
    pub fn start_script(&self) -> Option<&str> {
        self.device_container()
            .and_then(|c| c.command.last())
            .map(|s| s.as_str())
    }
}

impl ConfigMapManifest {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// A device's pod plus its optional configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub pod: PodManifest,
    pub config_map: Option<ConfigMapManifest>,
}

/// Config map name carrying a router's FRR configuration
pub fn router_config_name(router: &str) -> String {
    format!("{}-config", router)
}

// ============================================================================
// SBIO: Pure manifest builders
// ============================================================================

/// Builds device workloads from topology records
#[derive(Debug, Clone, Default)]
pub struct WorkloadTemplate {
    pub images: WorkloadImages,
    /// Cluster node every device pod is pinned to
    pub node_name: Option<String>,
    pub address_space: AddressSpace,
}

impl WorkloadTemplate {
    pub fn new(images: WorkloadImages, address_space: AddressSpace) -> Self {
        Self {
            images,
            node_name: None,
            address_space,
        }
    }

    pub fn with_node_name(mut self, node_name: Option<String>) -> Self {
        self.node_name = node_name;
        self
    }

    /// Build the workload for a record in its current state.
    ///
    /// `gateway` is only used for hosts.
    pub fn for_record(
        &self,
        record: &TopologyRecord,
        gateway: Option<Ipv4Addr>,
    ) -> Result<Workload, ModelError> {
        let name = record.name();
        let interfaces: Vec<String> = record
            .links()
            .iter()
            .map(|l| l.local_interface.clone())
            .collect();

        let workload = match NodeKind::require(name)? {
            NodeKind::Host => Workload {
                pod: self.host_pod(name, interfaces.first().map(|s| s.as_str()), gateway),
                config_map: None,
            },
            NodeKind::Switch => Workload {
                pod: self.switch_pod(name, &interfaces),
                config_map: None,
            },
            NodeKind::Firewall => Workload {
                pod: self.firewall_pod(name, &interfaces),
                config_map: None,
            },
            NodeKind::Router => {
                let subnets: Vec<Subnet> = record
                    .links()
                    .iter()
                    .filter_map(|l| l.local_ip)
                    .map(|ip| ip.subnet())
                    .collect();
                Workload {
                    pod: self.router_pod(name),
                    config_map: Some(self.router_config_map(name, &subnets, &interfaces)),
                }
            }
        };
        Ok(workload)
    }

    /// Host: wait for the uplink, then route the whole space via the gateway
    pub fn host_pod(&self, name: &str, uplink: Option<&str>, gateway: Option<Ipv4Addr>) -> PodManifest {
        let script = match (uplink, gateway) {
            (Some(iface), Some(gw)) => format!(
                "until ip link show {iface} >/dev/null 2>&1; do sleep 1; done; \
                 ip route add {space} via {gw}; sleep infinity",
                iface = iface,
                space = self.address_space.cidr(),
                gw = gw
            ),
            _ => "sleep infinity".to_string(),
        };
        self.pod(name, &self.images.host, script, Vec::new(), Vec::new())
    }

    /// Switch: OVS bridge with one port per link
    pub fn switch_pod(&self, name: &str, ports: &[String]) -> PodManifest {
        let mut steps = vec![
            "/usr/share/openvswitch/scripts/ovs-ctl start".to_string(),
            format!("ovs-vsctl --may-exist add-br {}", BRIDGE),
        ];
        steps.extend(
            ports
                .iter()
                .map(|p| format!("ovs-vsctl --may-exist add-port {} {}", BRIDGE, p)),
        );
        steps.push("sleep infinity".to_string());

        let mounts = vec![
            VolumeMount {
                name: "modules".to_string(),
                mount_path: "/lib/modules".to_string(),
                read_only: true,
            },
            VolumeMount {
                name: "run".to_string(),
                mount_path: "/run".to_string(),
                read_only: false,
            },
        ];
        let volumes = vec![host_path_volume("modules", "/lib/modules"), host_path_volume("run", "/run")];
        self.pod(name, &self.images.switch, steps.join(" && "), mounts, volumes)
    }

    /// Firewall: Linux bridge over every link plus an nftables forward chain
    pub fn firewall_pod(&self, name: &str, interfaces: &[String]) -> PodManifest {
        let mut steps = vec![
            "sysctl -w net.bridge.bridge-nf-call-iptables=1".to_string(),
            "apk add bridge nftables".to_string(),
            format!("brctl addbr {}", BRIDGE),
            format!("ip link set {} up", BRIDGE),
        ];
        for iface in interfaces {
            steps.push(format!("brctl addif {} {}", BRIDGE, iface));
            steps.push(format!("ip link set {} up", iface));
        }
        steps.push("nft add table inet filter".to_string());
        steps.push(
            "nft add chain inet filter forward '{ type filter hook forward priority 0; policy accept; }'"
                .to_string(),
        );
        steps.push("sleep infinity".to_string());
        self.pod(name, &self.images.firewall, steps.join(" && "), Vec::new(), Vec::new())
    }

    /// Router: IP forwarding and FRR reading its config map
    pub fn router_pod(&self, name: &str) -> PodManifest {
        let script = "sysctl -w net.ipv4.ip_forward=1 && /usr/lib/frr/docker-start".to_string();
        let mounts = vec![VolumeMount {
            name: "frr-config".to_string(),
            mount_path: "/etc/frr".to_string(),
            read_only: false,
        }];
        let volumes = vec![Volume {
            name: "frr-config".to_string(),
            host_path: None,
            config_map: Some(ConfigMapVolume {
                name: router_config_name(name),
            }),
        }];
        self.pod(name, &self.images.router, script, mounts, volumes)
    }

    /// FRR configuration running OSPF area 0 over the whole address space
    pub fn router_config_map(
        &self,
        name: &str,
        subnets: &[Subnet],
        interfaces: &[String],
    ) -> ConfigMapManifest {
        let mut frr = format!(
            "frr version 8.5\n\
             frr defaults traditional\n\
             hostname {}\n\
             log file /var/log/frr/frr.log\n\
             service integrated-vtysh-config\n\
             \n\
             router ospf\n",
            name
        );
        for subnet in subnets {
            frr.push_str(&format!(" network {}.0/24 area 0\n", subnet));
        }
        frr.push_str(&format!(" network {} area 0\n", self.address_space.cidr()));
        for iface in interfaces {
            frr.push_str(&format!("\ninterface {}\n ip ospf area 0\n", iface));
        }

        let mut data = BTreeMap::new();
        data.insert("daemons".to_string(), FRR_DAEMONS.to_string());
        data.insert("frr.conf".to_string(), frr);
        data.insert(
            "vtysh.conf".to_string(),
            "service integrated-vtysh-config\n".to_string(),
        );

        ConfigMapManifest {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            metadata: ObjectMeta {
                name: router_config_name(name),
                labels: BTreeMap::new(),
            },
            data,
        }
    }

    fn pod(
        &self,
        name: &str,
        image: &str,
        script: String,
        volume_mounts: Vec<VolumeMount>,
        volumes: Vec<Volume>,
    ) -> PodManifest {
        let mut labels = BTreeMap::new();
        labels.insert("name".to_string(), name.to_string());

        PodManifest {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata: ObjectMeta {
                name: name.to_string(),
                labels,
            },
            spec: PodSpec {
                node_name: self.node_name.clone(),
                init_containers: vec![self.init_container()],
                containers: vec![Container {
                    name: DEVICE_CONTAINER.to_string(),
                    image: image.to_string(),
                    image_pull_policy: "IfNotPresent".to_string(),
                    command: vec!["/bin/sh".to_string(), "-c".to_string(), script],
                    env: Vec::new(),
                    security_context: Some(SecurityContext { privileged: true }),
                    volume_mounts,
                }],
                volumes,
            },
        }
    }

    fn init_container(&self) -> Container {
        Container {
            name: INIT_CONTAINER.to_string(),
            image: self.images.init.clone(),
            image_pull_policy: "IfNotPresent".to_string(),
            command: vec!["/entrypoint.sh".to_string()],
            env: vec![
                downward_env("POD_NAME", "metadata.name"),
                downward_env("POD_NAMESPACE", "metadata.namespace"),
                downward_env("HOST_IP", "status.hostIP"),
            ],
            security_context: None,
            volume_mounts: Vec::new(),
        }
    }
}

fn downward_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: EnvVarSource {
            field_ref: FieldRef {
                field_path: field_path.to_string(),
            },
        },
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolume {
            path: path.to_string(),
        }),
        config_map: None,
    }
}

const FRR_DAEMONS: &str = "\
bgpd=no
ospfd=yes
ospf6d=no
ripd=no
ripngd=no
isisd=no
pimd=no
ldpd=no
nhrpd=no
eigrpd=no
babeld=no
sharpd=no
pbrd=no
bfdd=no
fabricd=no
vrrpd=no
pathd=no
vtysh_enable=yes
zebra_options=\"  -A 127.0.0.1 -s 90000000\"
ospfd_options=\"  -A 127.0.0.1\"
staticd_options=\"-A 127.0.0.1\"
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{link_pair, InterfaceAddress};

    fn template() -> WorkloadTemplate {
        WorkloadTemplate::default().with_node_name(Some("worker-1".to_string()))
    }

    #[test]
    fn test_every_pod_has_init_container_with_downward_env() {
        let pod = template().switch_pod("sw1", &[]);
        let init = &pod.spec.init_containers[0];
        assert_eq!(init.name, INIT_CONTAINER);
        let names: Vec<&str> = init.env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["POD_NAME", "POD_NAMESPACE", "HOST_IP"]);
        assert_eq!(init.env[2].value_from.field_ref.field_path, "status.hostIP");
    }

    #[test]
    fn test_device_container_is_privileged_and_pinned() {
        let pod = template().router_pod("r1");
        let device = pod.device_container().unwrap();
        assert_eq!(device.security_context, Some(SecurityContext { privileged: true }));
        assert_eq!(pod.spec.node_name.as_deref(), Some("worker-1"));
    }

    #[test]
    fn test_switch_adds_one_port_per_link() {
        let pod = template().switch_pod("sw1", &["sw1_r1".to_string(), "sw1_host1".to_string()]);
        let script = pod.start_script().unwrap();
        assert!(script.contains("add-port br0 sw1_r1"));
        assert!(script.contains("add-port br0 sw1_host1"));
        assert!(script.ends_with("sleep infinity"));
        assert_eq!(pod.spec.volumes.len(), 2);
    }

    #[test]
    fn test_host_route_uses_gateway() {
        let pod = template().host_pod("host1", Some("host1_sw1"), Some(Ipv4Addr::new(10, 12, 1, 1)));
        let script = pod.start_script().unwrap();
        assert!(script.contains("ip link show host1_sw1"));
        assert!(script.contains("ip route add 10.12.0.0/16 via 10.12.1.1"));
    }

    #[test]
    fn test_router_record_builds_config_map() {
        let ip: InterfaceAddress = "10.12.4.1/24".parse().unwrap();
        let (r1, _) = link_pair(1, "r1", "sw1", Some(ip), None);
        let record = TopologyRecord::new("r1", vec![r1]);

        let workload = template().for_record(&record, None).unwrap();
        let cm = workload.config_map.unwrap();
        assert_eq!(cm.name(), "r1-config");
        let frr = &cm.data["frr.conf"];
        assert!(frr.contains("hostname r1"));
        assert!(frr.contains(" network 10.12.4.0/24 area 0"));
        assert!(frr.contains(" network 10.12.0.0/16 area 0"));
        assert!(frr.contains("interface r1_sw1"));
        assert_eq!(workload.pod.spec.volumes[0].config_map.as_ref().unwrap().name, "r1-config");
    }

    #[test]
    fn test_manifest_serializes_camel_case() {
        let pod = template().firewall_pod("fw1", &["fw1_sw1".to_string()]);
        let json = serde_json::to_value(&pod).unwrap();
        assert_eq!(json["apiVersion"], "v1");
        assert_eq!(json["spec"]["nodeName"], "worker-1");
        assert_eq!(json["spec"]["initContainers"][0]["name"], "initclient");
        assert_eq!(json["spec"]["containers"][0]["securityContext"]["privileged"], true);
        assert!(json["spec"]["containers"][0]["command"][2]
            .as_str()
            .unwrap()
            .contains("brctl addif br0 fw1_sw1"));
    }

    #[test]
    fn test_unknown_record_name_is_rejected() {
        let record = TopologyRecord::new("gateway", vec![]);
        assert!(template().for_record(&record, None).is_err());
    }
}
