//! Identifier allocation over a graph snapshot
//!
//! Every allocator returns the smallest positive integer not already used.
//! They are pure; callers hold the namespace allocation lock between
//! reading the snapshot and writing the records that consume the result.

use std::collections::BTreeSet;

use thiserror::Error;

use super::address::MAX_OCTET;
use super::graph::TopologyGraph;
use super::model::NodeKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("All {0} subnet ids are in use")]
    SubnetsExhausted(u32),

    #[error("Subnet {0} has no free host numbers")]
    HostNumbersExhausted(String),
}

/// Smallest positive integer not in `used`
pub fn smallest_unused(used: &BTreeSet<u32>) -> u32 {
    let mut candidate = 1;
    for &n in used.range(1..) {
        if n != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

/// Next free `<prefix><N>` name for the kind
pub fn next_node_name(kind: NodeKind, graph: &TopologyGraph) -> String {
    let used: BTreeSet<u32> = graph
        .names()
        .filter_map(|name| kind.index_in(name))
        .collect();
    kind.node_name(smallest_unused(&used))
}

/// Next free link uid across the whole graph
pub fn next_link_id(graph: &TopologyGraph) -> u32 {
    let used: BTreeSet<u32> = graph
        .records()
        .flat_map(|r| r.spec.links.iter().map(|l| l.uid))
        .collect();
    smallest_unused(&used)
}

/// Subnet ids referenced by router, switch and firewall records
pub fn used_subnet_ids(graph: &TopologyGraph) -> BTreeSet<u32> {
    graph
        .records()
        .filter(|r| {
            matches!(
                r.node_kind(),
                Some(NodeKind::Router | NodeKind::Switch | NodeKind::Firewall)
            )
        })
        .flat_map(|r| r.spec.links.iter())
        .flat_map(|l| [l.local_ip, l.peer_ip])
        .flatten()
        .map(|ip| u32::from(ip.subnet().id()))
        .collect()
}

/// Next free subnet id (third octet)
pub fn next_subnet_id(graph: &TopologyGraph) -> Result<u8, AllocationError> {
    let id = smallest_unused(&used_subnet_ids(graph));
    if id > MAX_OCTET {
        return Err(AllocationError::SubnetsExhausted(MAX_OCTET));
    }
    Ok(id as u8)
}
