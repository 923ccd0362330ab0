//! Route resolution over the topology graph
//!
//! Both searches are breadth-first from a switch. [`find_router_ip`] returns
//! the gateway a host behind that switch should use, and
//! [`next_host_number_in_subnet`] finds a free last octet within the
//! broadcast domain the switch belongs to.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;

use crate::topology::address::{Subnet, MAX_OCTET};
use crate::topology::allocator::{smallest_unused, AllocationError};
use crate::topology::{NodeKind, TopologyGraph};

/// Nearest router's address facing the path the search came from.
///
/// The first router reached ends the search; its local IP on the half whose
/// peer is the node it was discovered from is returned. `None` when no
/// router is reachable or that half is unnumbered.
pub fn find_router_ip(graph: &TopologyGraph, start_switch: &str) -> Option<Ipv4Addr> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut parent: HashMap<&str, &str> = HashMap::new();
    let mut queue: VecDeque<&str> = VecDeque::new();

    visited.insert(start_switch);
    queue.push_back(start_switch);

    while let Some(current) = queue.pop_front() {
        let Some(record) = graph.get(current) else {
            continue;
        };

        if current != start_switch && NodeKind::of_name(current) == Some(NodeKind::Router) {
            let from = parent.get(current).copied()?;
            return record
                .links()
                .iter()
                .find(|l| l.peer == from)
                .and_then(|l| l.local_ip)
                .map(|ip| ip.addr);
        }

        for link in record.links() {
            let peer = link.peer.as_str();
            if visited.insert(peer) {
                parent.insert(peer, current);
                queue.push_back(peer);
            }
        }
    }
    None
}

/// Smallest free last octet in `subnet`, looking at every address recorded
/// on switches and firewalls reachable from `start_switch`.
///
/// Routers and hosts end the expansion; their addresses are still seen
/// through the switch-side halves.
pub fn next_host_number_in_subnet(
    graph: &TopologyGraph,
    start_switch: &str,
    subnet: Subnet,
) -> Result<u8, AllocationError> {
    let used = used_host_numbers(graph, start_switch, subnet);
    let number = smallest_unused(&used);
    if number > MAX_OCTET {
        return Err(AllocationError::HostNumbersExhausted(subnet.to_string()));
    }
    Ok(number as u8)
}

/// Last octets already taken in `subnet` within the switch's domain
pub fn used_host_numbers(graph: &TopologyGraph, start_switch: &str, subnet: Subnet) -> BTreeSet<u32> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    let mut used = BTreeSet::new();

    visited.insert(start_switch);
    queue.push_back(start_switch);

    while let Some(current) = queue.pop_front() {
        for link in graph.links_of(current) {
            for ip in [link.local_ip, link.peer_ip].into_iter().flatten() {
                if subnet.contains(ip.addr) {
                    used.insert(u32::from(ip.host_number()));
                }
            }

            let peer = link.peer.as_str();
            let expands = matches!(
                NodeKind::of_name(peer),
                Some(NodeKind::Switch | NodeKind::Firewall)
            );
            if expands && visited.insert(peer) {
                queue.push_back(peer);
            }
        }
    }
    used
}
