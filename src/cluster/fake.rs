//! In-memory cluster for tests and dry runs
//!
//! Implements every cluster handle over shared state. Pods follow a
//! configurable [`PodBehavior`]; device commands are emulated closely
//! enough for the fabric's wiring and verification loops:
//!
//! - starting a pod runs its start script against the emulated device and
//!   creates the interfaces its topology record lists, as the CNI would
//! - `ovs-vsctl`, `ip link`, `ip route` and `brctl` act on per-pod state
//! - `ping` and `traceroute` return canned output

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::{
    AgentError, ClusterHandles, ContainerStatus, ExecError, ExecOutput, LinkAgent, LinkRequest,
    PodExec, PodPhase, PodStatus, UnlinkRequest, WorkloadApi, WorkloadError,
};
use crate::poll::InstantSleeper;
use crate::topology::{MemoryTopologyStore, StoreError, TopologyRecord, TopologyStore};
use crate::workload::{ConfigMapManifest, PodManifest, BRIDGE, DEVICE_CONTAINER};

/// Host IP every fake pod reports
pub const FAKE_HOST_IP: &str = "127.0.0.1";

const DEFAULT_PING_OUTPUT: &str = "\
PING 10.12.1.1 (10.12.1.1): 56 data bytes
64 bytes from 10.12.1.1: seq=0 ttl=64 time=0.105 ms
64 bytes from 10.12.1.1: seq=1 ttl=64 time=0.098 ms
64 bytes from 10.12.1.1: seq=2 ttl=64 time=0.101 ms
64 bytes from 10.12.1.1: seq=3 ttl=64 time=0.112 ms

--- 10.12.1.1 ping statistics ---
4 packets transmitted, 4 packets received, 0% packet loss
rtt min/avg/max/mdev = 0.098/0.104/0.112/0.005 ms
";

/// How a fake pod reports status across polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PodBehavior {
    #[default]
    Ready,
    /// Pending for the first `n` polls
    ReadyAfter(u32),
    NeverReady,
    /// Reports the given phase from the first poll
    Terminal(PodPhase),
    /// Pending for `n` polls, then disappears
    VanishAfter(u32),
}

/// Emulated network state inside one pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub interfaces: BTreeSet<String>,
    pub bridge_ports: BTreeSet<String>,
    pub routes: Vec<String>,
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct FakePod {
    manifest: PodManifest,
    polls: u32,
}

#[derive(Default)]
struct FakeState {
    pods: DashMap<Key, FakePod>,
    config_maps: DashMap<Key, ConfigMapManifest>,
    behaviors: DashMap<String, PodBehavior>,
    devices: DashMap<Key, DeviceState>,
    failing_commands: Mutex<Vec<String>>,
    unreachable_pods: DashMap<String, ()>,
    agent_failure: AtomicBool,
    ignore_port_adds: AtomicBool,
    ping_output: Mutex<Option<String>>,
    commands: Mutex<Vec<String>>,
    agent_calls: Mutex<Vec<String>>,
}

/// Shared in-memory cluster; clones see the same state
#[derive(Clone, Default)]
pub struct FakeCluster {
    store: MemoryTopologyStore,
    state: Arc<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles backed by this cluster, with an instant sleeper
    pub fn handles(&self) -> ClusterHandles {
        ClusterHandles::new(
            Arc::new(self.store.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(InstantSleeper::new()),
        )
    }

    pub fn store(&self) -> &MemoryTopologyStore {
        &self.store
    }

    /// Write records and start a ready pod for each, as an existing lab
    pub async fn seed(&self, namespace: &str, records: Vec<TopologyRecord>) {
        for record in &records {
            match self.store.create(namespace, record).await {
                Ok(_) => {}
                Err(StoreError::AlreadyExists(name)) => {
                    debug!("Seed lists {} twice, keeping the first", name)
                }
                Err(e) => warn!("Could not seed {}: {}", record.name(), e),
            }
        }
        for record in &records {
            let mut device = DeviceState::default();
            device.interfaces.insert("lo".to_string());
            device.interfaces.insert("eth0".to_string());
            for link in record.links() {
                device.interfaces.insert(link.local_interface.clone());
                if record.name().starts_with("sw") {
                    device.bridge_ports.insert(link.local_interface.clone());
                }
            }
            self.state.devices.insert(key(namespace, record.name()), device);
            self.state.pods.insert(
                key(namespace, record.name()),
                FakePod {
                    manifest: PodManifest {
                        api_version: "v1".to_string(),
                        kind: "Pod".to_string(),
                        metadata: crate::workload::ObjectMeta {
                            name: record.name().to_string(),
                            ..Default::default()
                        },
                        spec: Default::default(),
                    },
                    polls: 0,
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Knobs
    // ------------------------------------------------------------------

    pub fn set_behavior(&self, pod: &str, behavior: PodBehavior) {
        self.state.behaviors.insert(pod.to_string(), behavior);
    }

    /// Commands whose text contains `pattern` fail with a non-zero status
    pub fn fail_commands_matching(&self, pattern: &str) {
        lock(&self.state.failing_commands).push(pattern.to_string());
    }

    pub fn clear_command_failures(&self) {
        lock(&self.state.failing_commands).clear();
    }

    /// Exec sessions into `pod` fail to open, as if the pod were gone
    pub fn set_exec_failure(&self, pod: &str, fail: bool) {
        if fail {
            self.state.unreachable_pods.insert(pod.to_string(), ());
        } else {
            self.state.unreachable_pods.remove(pod);
        }
    }

    /// Both agent calls fail with a 500
    pub fn set_agent_failure(&self, fail: bool) {
        self.state.agent_failure.store(fail, Ordering::SeqCst);
    }

    /// Accept `add-port` without actually adding the port
    pub fn set_ignore_port_adds(&self, ignore: bool) {
        self.state.ignore_port_adds.store(ignore, Ordering::SeqCst);
    }

    pub fn set_ping_output(&self, output: &str) {
        *lock(&self.state.ping_output) = Some(output.to_string());
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn pod(&self, namespace: &str, name: &str) -> Option<PodManifest> {
        self.state
            .pods
            .get(&key(namespace, name))
            .map(|p| p.manifest.clone())
    }

    pub fn pod_names(&self, namespace: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .pods
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.key().1.clone())
            .collect();
        names.sort();
        names
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMapManifest> {
        self.state
            .config_maps
            .get(&key(namespace, name))
            .map(|c| c.clone())
    }

    pub fn device(&self, namespace: &str, name: &str) -> Option<DeviceState> {
        self.state
            .devices
            .get(&key(namespace, name))
            .map(|d| d.clone())
    }

    /// Every exec as `<pod>: <command>`, in order
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state.commands).clone()
    }

    pub fn agent_calls(&self) -> Vec<String> {
        lock(&self.state.agent_calls).clone()
    }

    // ------------------------------------------------------------------
    // Device emulation
    // ------------------------------------------------------------------

    fn ping_output(&self) -> String {
        lock(&self.state.ping_output)
            .clone()
            .unwrap_or_else(|| DEFAULT_PING_OUTPUT.to_string())
    }

    fn run_script(&self, device: &mut DeviceState, script: &str) {
        for segment in script.split("&&").flat_map(|s| s.split(';')) {
            let tokens: Vec<String> = segment.split_whitespace().map(|s| s.to_string()).collect();
            if !tokens.is_empty() {
                self.emulate(device, &tokens);
            }
        }
    }

    fn emulate(&self, device: &mut DeviceState, command: &[String]) -> ExecOutput {
        let tokens: Vec<&str> = command
            .iter()
            .map(|s| s.as_str())
            .filter(|s| !s.starts_with("--"))
            .collect();

        let ok = |stdout: String| ExecOutput {
            stdout,
            stderr: String::new(),
            success: true,
        };
        let fail = |stderr: String| ExecOutput {
            stdout: String::new(),
            stderr,
            success: false,
        };

        match tokens.as_slice() {
            ["ovs-vsctl", "add-port", _, iface] => {
                if !self.state.ignore_port_adds.load(Ordering::SeqCst) {
                    device.bridge_ports.insert(iface.to_string());
                }
                ok(String::new())
            }
            ["ovs-vsctl", "del-port", _, iface] => {
                device.bridge_ports.remove(*iface);
                ok(String::new())
            }
            ["ovs-vsctl", "list-ports", _] => ok(device
                .bridge_ports
                .iter()
                .map(|p| format!("{}\n", p))
                .collect()),
            ["ovs-vsctl", "show"] => {
                let mut out = format!("    Bridge {}\n", BRIDGE);
                for port in &device.bridge_ports {
                    out.push_str(&format!("        Port {}\n            Interface {}\n", port, port));
                }
                ok(out)
            }
            ["ip", "link", "show", iface] => {
                if device.interfaces.contains(*iface) {
                    ok(format!("2: {}: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n", iface))
                } else {
                    fail(format!("Device \"{}\" does not exist.", iface))
                }
            }
            ["ip", "link", "delete", iface] => {
                if device.interfaces.remove(*iface) {
                    device.bridge_ports.remove(*iface);
                    ok(String::new())
                } else {
                    fail(format!("Cannot find device \"{}\"", iface))
                }
            }
            ["ip", "link", "set", iface, "up"] => {
                if device.interfaces.contains(*iface) {
                    ok(String::new())
                } else {
                    fail(format!("Cannot find device \"{}\"", iface))
                }
            }
            ["brctl", "addbr", bridge] => {
                device.interfaces.insert(bridge.to_string());
                ok(String::new())
            }
            ["brctl", "addif", _, iface] => {
                if device.interfaces.contains(*iface) {
                    device.bridge_ports.insert(iface.to_string());
                    ok(String::new())
                } else {
                    fail(format!("interface {} does not exist!", iface))
                }
            }
            ["brctl", "show"] => {
                let ports: Vec<&str> = device.bridge_ports.iter().map(|s| s.as_str()).collect();
                ok(format!("bridge name\tinterfaces\n{}\t{}\n", BRIDGE, ports.join(" ")))
            }
            ["ip", "route", "add", cidr, "via", gw] => {
                let route = format!("{} via {}", cidr, gw);
                if device.routes.iter().any(|r| r.starts_with(&format!("{} ", cidr))) {
                    fail("RTNETLINK answers: File exists".to_string())
                } else {
                    device.routes.push(route);
                    ok(String::new())
                }
            }
            ["ip", "route"] | ["ip", "route", "show"] => {
                ok(device.routes.iter().map(|r| format!("{}\n", r)).collect())
            }
            ["ip", "addr"] | ["ip", "-br", "addr"] | ["ip", "addr", "show"] => ok(device
                .interfaces
                .iter()
                .map(|i| format!("{}\tUP\n", i))
                .collect()),
            ["ping", .., _target] => ok(self.ping_output()),
            ["traceroute", .., target] => ok(format!(
                "traceroute to {} ({}), 30 hops max, 46 byte packets\n 1  {}  0.120 ms  0.090 ms  0.085 ms\n",
                target, target, target
            )),
            _ => ok(String::new()),
        }
    }

    fn create_cni_interfaces(&self, namespace: &str, record: &TopologyRecord, device: &mut DeviceState) {
        for link in record.links() {
            device.interfaces.insert(link.local_interface.clone());
            if let Some(mut peer) = self.state.devices.get_mut(&key(namespace, &link.peer)) {
                peer.interfaces.insert(link.peer_interface.clone());
            }
        }
    }
}

#[async_trait]
impl WorkloadApi for FakeCluster {
    async fn create_pod(&self, namespace: &str, pod: &PodManifest) -> Result<(), WorkloadError> {
        let pod_key = key(namespace, pod.name());
        if self.state.pods.contains_key(&pod_key) {
            return Err(WorkloadError::AlreadyExists(pod.name().to_string()));
        }

        let mut device = DeviceState::default();
        device.interfaces.insert("lo".to_string());
        device.interfaces.insert("eth0".to_string());
        if let Ok(record) = self.store.get(namespace, pod.name()).await {
            self.create_cni_interfaces(namespace, &record, &mut device);
        }
        if let Some(script) = pod
            .spec
            .containers
            .iter()
            .find(|c| c.name == DEVICE_CONTAINER)
            .and_then(|c| c.command.last())
        {
            self.run_script(&mut device, script);
        }

        self.state.devices.insert(pod_key.clone(), device);
        self.state.pods.insert(
            pod_key,
            FakePod {
                manifest: pod.clone(),
                polls: 0,
            },
        );
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), WorkloadError> {
        let pod_key = key(namespace, name);
        self.state.devices.remove(&pod_key);
        self.state
            .pods
            .remove(&pod_key)
            .map(|_| ())
            .ok_or_else(|| WorkloadError::NotFound(name.to_string()))
    }

    async fn pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus, WorkloadError> {
        let pod_key = key(namespace, name);
        let polls = {
            let mut pod = self
                .state
                .pods
                .get_mut(&pod_key)
                .ok_or_else(|| WorkloadError::NotFound(name.to_string()))?;
            pod.polls += 1;
            pod.polls
        };

        let behavior = self
            .state
            .behaviors
            .get(name)
            .map(|b| *b)
            .unwrap_or_default();
        let ready = |ready: bool, phase: PodPhase| PodStatus {
            phase,
            host_ip: Some(FAKE_HOST_IP.to_string()),
            container_statuses: vec![ContainerStatus {
                name: DEVICE_CONTAINER.to_string(),
                ready,
            }],
        };

        let status = match behavior {
            PodBehavior::Ready => ready(true, PodPhase::Running),
            PodBehavior::ReadyAfter(n) if polls > n => ready(true, PodPhase::Running),
            PodBehavior::ReadyAfter(_) | PodBehavior::NeverReady => ready(false, PodPhase::Pending),
            PodBehavior::Terminal(phase) => ready(false, phase),
            PodBehavior::VanishAfter(n) if polls > n => {
                self.state.pods.remove(&pod_key);
                self.state.devices.remove(&pod_key);
                return Err(WorkloadError::NotFound(name.to_string()));
            }
            PodBehavior::VanishAfter(_) => ready(false, PodPhase::Pending),
        };
        Ok(status)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMapManifest,
    ) -> Result<(), WorkloadError> {
        let cm_key = key(namespace, config_map.name());
        if self.state.config_maps.contains_key(&cm_key) {
            return Err(WorkloadError::AlreadyExists(config_map.name().to_string()));
        }
        self.state.config_maps.insert(cm_key, config_map.clone());
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), WorkloadError> {
        self.state
            .config_maps
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| WorkloadError::NotFound(name.to_string()))
    }
}

#[async_trait]
impl PodExec for FakeCluster {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
    ) -> Result<ExecOutput, ExecError> {
        let text = command.join(" ");
        lock(&self.state.commands).push(format!("{}: {}", pod, text));

        if self.state.unreachable_pods.contains_key(pod) {
            return Err(ExecError::Connect(pod.to_string(), "injected failure".to_string()));
        }
        let mut device = self
            .state
            .devices
            .get_mut(&key(namespace, pod))
            .ok_or_else(|| ExecError::Connect(pod.to_string(), "pod not found".to_string()))?;

        let injected = lock(&self.state.failing_commands)
            .iter()
            .any(|pattern| text.contains(pattern.as_str()));
        if injected {
            return Ok(ExecOutput {
                stdout: String::new(),
                stderr: "injected failure".to_string(),
                success: false,
            });
        }

        let tokens: Vec<String> = match command {
            [shell, flag, script] if shell.ends_with("sh") && flag == "-c" => {
                script.split_whitespace().map(|s| s.to_string()).collect()
            }
            _ => command.to_vec(),
        };
        Ok(self.emulate(&mut device, &tokens))
    }
}

#[async_trait]
impl LinkAgent for FakeCluster {
    async fn make_link(&self, request: &LinkRequest) -> Result<(), AgentError> {
        lock(&self.state.agent_calls).push(format!(
            "link {}:{} {}:{}",
            request.pod_a, request.iface_a, request.pod_b, request.iface_b
        ));
        if self.state.agent_failure.load(Ordering::SeqCst) {
            return Err(AgentError::Rejected {
                status: 500,
                message: "injected failure".to_string(),
            });
        }
        for (pod, iface) in [
            (&request.pod_a, &request.iface_a),
            (&request.pod_b, &request.iface_b),
        ] {
            match self.state.devices.get_mut(&key(&request.namespace, pod)) {
                Some(mut device) => {
                    device.interfaces.insert(iface.clone());
                }
                None => {
                    return Err(AgentError::Rejected {
                        status: 404,
                        message: format!("pod {} not found", pod),
                    })
                }
            }
        }
        Ok(())
    }

    async fn delete_link(&self, request: &UnlinkRequest) -> Result<(), AgentError> {
        lock(&self.state.agent_calls).push(format!("unlink {}:{}", request.pod, request.iface));
        if self.state.agent_failure.load(Ordering::SeqCst) {
            return Err(AgentError::Rejected {
                status: 500,
                message: "injected failure".to_string(),
            });
        }
        if let Some(mut device) = self.state.devices.get_mut(&key(&request.namespace, &request.pod)) {
            device.interfaces.remove(&request.iface);
            device.bridge_ports.remove(&request.iface);
        }
        Ok(())
    }
}
