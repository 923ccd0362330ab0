//! Topology records - one custom resource per emulated device
//!
//! Records follow the meshnet `Topology` CRD layout so the CNI plugin can
//! wire pods from the same objects the orchestrator writes:
//!
//! ```yaml
//! apiVersion: networkop.co.uk/v1beta1
//! kind: Topology
//! metadata:
//!   name: sw1
//! spec:
//!   links:
//!     - uid: 3
//!       peer_pod: host1
//!       local_intf: sw1_host1
//!       peer_intf: host1_sw1
//!       peer_ip: 10.12.1.2/24
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::address::{empty_as_none, InterfaceAddress};

/// API group of the topology custom resource
pub const TOPOLOGY_GROUP: &str = "networkop.co.uk";

/// API version of the topology custom resource
pub const TOPOLOGY_VERSION: &str = "v1beta1";

/// Plural resource name used in REST paths
pub const TOPOLOGY_PLURAL: &str = "topologies";

/// Kind of every topology record
pub const TOPOLOGY_KIND: &str = "Topology";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Unknown device kind '{0}' (expected host, switch, firewall or router)")]
    UnknownKind(String),

    #[error("Node name '{0}' does not encode a device kind")]
    InvalidNodeName(String),
}

/// Kind of emulated device, encoded in the node name prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Host,
    Switch,
    Firewall,
    Router,
}

impl NodeKind {
    pub const ALL: [NodeKind; 4] = [
        NodeKind::Host,
        NodeKind::Switch,
        NodeKind::Firewall,
        NodeKind::Router,
    ];

    /// Name prefix for this kind
    pub fn prefix(&self) -> &'static str {
        match self {
            NodeKind::Host => "host",
            NodeKind::Switch => "sw",
            NodeKind::Firewall => "fw",
            NodeKind::Router => "r",
        }
    }

    /// Classify a `<prefix><N>` node name; anything else is not a device
    pub fn of_name(name: &str) -> Option<NodeKind> {
        Self::ALL.into_iter().find(|kind| kind.index_in(name).is_some())
    }

    /// Like [`NodeKind::of_name`] but as an error for callers that need one
    pub fn require(name: &str) -> Result<NodeKind, ModelError> {
        Self::of_name(name).ok_or_else(|| ModelError::InvalidNodeName(name.to_string()))
    }

    /// Numeric suffix of a name of this kind (`sw12` -> 12)
    pub fn index_in(&self, name: &str) -> Option<u32> {
        let digits = name.strip_prefix(self.prefix())?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Build the node name with the given index
    pub fn node_name(&self, index: u32) -> String {
        format!("{}{}", self.prefix(), index)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Host => "host",
            NodeKind::Switch => "switch",
            NodeKind::Firewall => "firewall",
            NodeKind::Router => "router",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "host" => Ok(NodeKind::Host),
            "switch" | "sw" => Ok(NodeKind::Switch),
            "firewall" | "fw" => Ok(NodeKind::Firewall),
            "router" | "r" => Ok(NodeKind::Router),
            other => Err(ModelError::UnknownKind(other.to_string())),
        }
    }
}

/// Interface name for the `local` end of a link towards `peer`
pub fn interface_name(local: &str, peer: &str) -> String {
    format!("{}_{}", local, peer)
}

/// One endpoint's view of a bidirectional link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HalfLink {
    /// Graph-wide link id shared by both halves
    pub uid: u32,

    /// Node on the other end
    #[serde(rename = "peer_pod")]
    pub peer: String,

    #[serde(rename = "local_intf")]
    pub local_interface: String,

    #[serde(rename = "peer_intf")]
    pub peer_interface: String,

    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub local_ip: Option<InterfaceAddress>,

    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub peer_ip: Option<InterfaceAddress>,
}

impl HalfLink {
    /// Unnumbered half owned by `local`, pointing at `peer`
    pub fn new(uid: u32, local: &str, peer: &str) -> Self {
        Self {
            uid,
            peer: peer.to_string(),
            local_interface: interface_name(local, peer),
            peer_interface: interface_name(peer, local),
            local_ip: None,
            peer_ip: None,
        }
    }

    pub fn with_local_ip(mut self, ip: Option<InterfaceAddress>) -> Self {
        self.local_ip = ip;
        self
    }

    pub fn with_peer_ip(mut self, ip: Option<InterfaceAddress>) -> Self {
        self.peer_ip = ip;
        self
    }

    /// The other endpoint's half: same uid, fields swapped, peer is `owner`
    pub fn mirror(&self, owner: &str) -> HalfLink {
        HalfLink {
            uid: self.uid,
            peer: owner.to_string(),
            local_interface: self.peer_interface.clone(),
            peer_interface: self.local_interface.clone(),
            local_ip: self.peer_ip,
            peer_ip: self.local_ip,
        }
    }
}

/// Build both halves of a link between `a` and `b`
pub fn link_pair(
    uid: u32,
    a: &str,
    b: &str,
    a_ip: Option<InterfaceAddress>,
    b_ip: Option<InterfaceAddress>,
) -> (HalfLink, HalfLink) {
    let a_half = HalfLink::new(uid, a, b)
        .with_local_ip(a_ip)
        .with_peer_ip(b_ip);
    let b_half = a_half.mirror(a);
    (a_half, b_half)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Version token for optimistic concurrency
    #[serde(
        rename = "resourceVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySpec {
    #[serde(default)]
    pub links: Vec<HalfLink>,
}

/// A topology record for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRecord {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    pub metadata: RecordMetadata,

    #[serde(default)]
    pub spec: TopologySpec,
}

impl TopologyRecord {
    pub fn new(name: impl Into<String>, links: Vec<HalfLink>) -> Self {
        Self {
            api_version: format!("{}/{}", TOPOLOGY_GROUP, TOPOLOGY_VERSION),
            kind: TOPOLOGY_KIND.to_string(),
            metadata: RecordMetadata {
                name: name.into(),
                ..Default::default()
            },
            spec: TopologySpec { links },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn links(&self) -> &[HalfLink] {
        &self.spec.links
    }

    pub fn node_kind(&self) -> Option<NodeKind> {
        NodeKind::of_name(&self.metadata.name)
    }

    /// First numbered local address, used as the node's reachable IP
    pub fn primary_ip(&self) -> Option<InterfaceAddress> {
        self.spec.links.iter().find_map(|l| l.local_ip)
    }

    pub fn link_to(&self, peer: &str) -> Option<&HalfLink> {
        self.spec.links.iter().find(|l| l.peer == peer)
    }
}

/// List response of the custom resource API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyList {
    #[serde(default)]
    pub items: Vec<TopologyRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_name() {
        assert_eq!(NodeKind::of_name("host3"), Some(NodeKind::Host));
        assert_eq!(NodeKind::of_name("sw1"), Some(NodeKind::Switch));
        assert_eq!(NodeKind::of_name("fw2"), Some(NodeKind::Firewall));
        assert_eq!(NodeKind::of_name("r10"), Some(NodeKind::Router));
        assert_eq!(NodeKind::of_name("gateway"), None);
    }

    #[test]
    fn test_kind_requires_numeric_suffix() {
        for name in ["hostile", "rabbit", "swamp", "fw", "r", "host+1", "sw1a"] {
            assert_eq!(NodeKind::of_name(name), None, "{}", name);
        }
        assert!(matches!(
            NodeKind::require("rabbit"),
            Err(ModelError::InvalidNodeName(_))
        ));
    }

    #[test]
    fn test_kind_index() {
        assert_eq!(NodeKind::Host.index_in("host12"), Some(12));
        assert_eq!(NodeKind::Switch.index_in("sw-a"), None);
        assert_eq!(NodeKind::Router.node_name(4), "r4");
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("switch".parse::<NodeKind>().unwrap(), NodeKind::Switch);
        assert_eq!("FW".parse::<NodeKind>().unwrap(), NodeKind::Firewall);
        assert!(matches!(
            "bridge".parse::<NodeKind>(),
            Err(ModelError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_link_pair_is_symmetric() {
        let r_ip: InterfaceAddress = "10.12.1.1/24".parse().unwrap();
        let (a, b) = link_pair(7, "r1", "sw1", Some(r_ip), None);

        assert_eq!(a.uid, b.uid);
        assert_eq!(a.peer, "sw1");
        assert_eq!(b.peer, "r1");
        assert_eq!(a.local_interface, "r1_sw1");
        assert_eq!(b.local_interface, a.peer_interface);
        assert_eq!(b.peer_interface, a.local_interface);
        assert_eq!(b.peer_ip, Some(r_ip));
        assert_eq!(b.local_ip, None);
        assert_eq!(b.mirror("sw1"), a);
    }

    #[test]
    fn test_record_wire_format() {
        let json = r#"{
            "apiVersion": "networkop.co.uk/v1beta1",
            "kind": "Topology",
            "metadata": {"name": "sw1", "resourceVersion": "42"},
            "spec": {"links": [
                {"uid": 1, "peer_pod": "r1", "local_intf": "sw1_r1",
                 "peer_intf": "r1_sw1", "local_ip": "", "peer_ip": "10.12.1.1/24"}
            ]}
        }"#;
        let record: TopologyRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.name(), "sw1");
        assert_eq!(record.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(record.links()[0].local_ip, None);
        assert_eq!(record.links()[0].peer_ip.unwrap().to_string(), "10.12.1.1/24");

        let out = serde_json::to_value(&record).unwrap();
        assert!(out["spec"]["links"][0].get("local_ip").is_none());
        assert_eq!(out["spec"]["links"][0]["peer_pod"], "r1");
    }

    #[test]
    fn test_primary_ip_skips_unnumbered_links() {
        let ip: InterfaceAddress = "10.12.2.3/24".parse().unwrap();
        let record = TopologyRecord::new(
            "host1",
            vec![
                HalfLink::new(1, "host1", "sw1"),
                HalfLink::new(2, "host1", "sw2").with_local_ip(Some(ip)),
            ],
        );
        assert_eq!(record.primary_ip(), Some(ip));
    }
}
