//! Adjacency policy and per-pair addressing

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::routing::{find_router_ip, next_host_number_in_subnet};
use crate::topology::address::Subnet;
use crate::topology::allocator::next_subnet_id;
use crate::topology::{AddressSpace, InterfaceAddress, NodeKind, TopologyGraph};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("A {0} cannot be linked to a {1}")]
    ForbiddenPair(NodeKind, NodeKind),

    #[error("'{0}' is not a device name")]
    InvalidName(String),

    #[error("'{0}' cannot be linked to itself")]
    SelfLink(String),
}

/// Kinds of both endpoints, or the reason the pair may not be linked.
///
/// Pure: runs before anything is read from the store.
pub fn check_adjacency(a: &str, b: &str) -> Result<(NodeKind, NodeKind), PolicyError> {
    let kind_a = NodeKind::of_name(a).ok_or_else(|| PolicyError::InvalidName(a.to_string()))?;
    let kind_b = NodeKind::of_name(b).ok_or_else(|| PolicyError::InvalidName(b.to_string()))?;
    if a == b {
        return Err(PolicyError::SelfLink(a.to_string()));
    }
    if is_forbidden(kind_a, kind_b) {
        return Err(PolicyError::ForbiddenPair(kind_a, kind_b));
    }
    Ok((kind_a, kind_b))
}

/// Host-host, host-router and host-firewall
pub fn is_forbidden(a: NodeKind, b: NodeKind) -> bool {
    use NodeKind::*;
    matches!(
        (a, b),
        (Host, Host) | (Host, Router) | (Router, Host) | (Host, Firewall) | (Firewall, Host)
    )
}

/// Addresses for both ends of a new link.
///
/// `gateway` is set when one end is a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkPlan {
    pub a_ip: Option<InterfaceAddress>,
    pub b_ip: Option<InterfaceAddress>,
    pub gateway: Option<Ipv4Addr>,
}

/// Address a link between `a` and `b` against the current snapshot.
///
/// Only the switch end of a host link needs to exist in `graph`; the host
/// may be a node that is about to be created.
pub fn plan_addresses(
    graph: &TopologyGraph,
    space: AddressSpace,
    (a, kind_a): (&str, NodeKind),
    (b, kind_b): (&str, NodeKind),
) -> OrchestratorResult<LinkPlan> {
    use NodeKind::*;

    if is_forbidden(kind_a, kind_b) {
        return Err(PolicyError::ForbiddenPair(kind_a, kind_b).into());
    }

    let plan = match (kind_a, kind_b) {
        (Host, Switch) => {
            let (ip, gateway) = host_address(graph, b)?;
            LinkPlan {
                a_ip: Some(ip),
                b_ip: None,
                gateway: Some(gateway),
            }
        }
        (Switch, Host) => {
            let (ip, gateway) = host_address(graph, a)?;
            LinkPlan {
                a_ip: None,
                b_ip: Some(ip),
                gateway: Some(gateway),
            }
        }
        (Router, Router) => {
            let subnet = space.subnet(next_subnet_id(graph)?);
            LinkPlan {
                a_ip: Some(subnet.host(1)),
                b_ip: Some(subnet.host(2)),
                gateway: None,
            }
        }
        (Router, _) => LinkPlan {
            a_ip: Some(space.subnet(next_subnet_id(graph)?).host(1)),
            ..Default::default()
        },
        (_, Router) => LinkPlan {
            b_ip: Some(space.subnet(next_subnet_id(graph)?).host(1)),
            ..Default::default()
        },
        _ => LinkPlan::default(),
    };
    Ok(plan)
}

/// Address for a new host behind `switch` and the gateway it routes via
fn host_address(
    graph: &TopologyGraph,
    switch: &str,
) -> OrchestratorResult<(InterfaceAddress, Ipv4Addr)> {
    let gateway =
        find_router_ip(graph, switch).ok_or_else(|| OrchestratorError::NoRoute(switch.to_string()))?;
    let subnet = Subnet::of(gateway);
    let number = next_host_number_in_subnet(graph, switch, subnet)?;
    Ok((subnet.host(number), gateway))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{link_pair, TopologyRecord};

    fn addr(s: &str) -> InterfaceAddress {
        s.parse().unwrap()
    }

    fn routed_switch() -> TopologyGraph {
        let (r, sw) = link_pair(1, "r1", "sw1", Some(addr("10.12.1.1/24")), None);
        TopologyGraph::from_records(vec![
            TopologyRecord::new("r1", vec![r]),
            TopologyRecord::new("sw1", vec![sw]),
        ])
    }

    #[test]
    fn test_forbidden_pairs_are_exactly_host_host_router_firewall() {
        let mut forbidden = Vec::new();
        for a in NodeKind::ALL {
            for b in NodeKind::ALL {
                if is_forbidden(a, b) {
                    forbidden.push((a, b));
                }
            }
        }
        use NodeKind::*;
        assert_eq!(forbidden.len(), 5);
        assert!(forbidden.contains(&(Host, Host)));
        assert!(forbidden.contains(&(Host, Router)));
        assert!(forbidden.contains(&(Firewall, Host)));
        assert!(!is_forbidden(Host, Switch));
        assert!(!is_forbidden(Firewall, Switch));
    }

    #[test]
    fn test_check_adjacency() {
        assert_eq!(
            check_adjacency("host1", "r1"),
            Err(PolicyError::ForbiddenPair(NodeKind::Host, NodeKind::Router))
        );
        assert_eq!(
            check_adjacency("sw1", "sw1"),
            Err(PolicyError::SelfLink("sw1".to_string()))
        );
        assert_eq!(
            check_adjacency("sw1", "gateway"),
            Err(PolicyError::InvalidName("gateway".to_string()))
        );
        assert_eq!(
            check_adjacency("sw1", "hostile"),
            Err(PolicyError::InvalidName("hostile".to_string()))
        );
        assert_eq!(
            check_adjacency("sw1", "host3"),
            Ok((NodeKind::Switch, NodeKind::Host))
        );
    }

    #[test]
    fn test_host_gets_next_octet_and_gateway() {
        let plan = plan_addresses(
            &routed_switch(),
            AddressSpace::default(),
            ("host1", NodeKind::Host),
            ("sw1", NodeKind::Switch),
        )
        .unwrap();
        assert_eq!(plan.a_ip, Some(addr("10.12.1.2/24")));
        assert_eq!(plan.b_ip, None);
        assert_eq!(plan.gateway, Some(Ipv4Addr::new(10, 12, 1, 1)));
    }

    #[test]
    fn test_host_without_router_has_no_route() {
        let graph = TopologyGraph::from_records(vec![TopologyRecord::new("sw1", vec![])]);
        let result = plan_addresses(
            &graph,
            AddressSpace::default(),
            ("sw1", NodeKind::Switch),
            ("host1", NodeKind::Host),
        );
        assert!(matches!(result, Err(OrchestratorError::NoRoute(s)) if s == "sw1"));
    }

    #[test]
    fn test_router_pairs_take_a_new_subnet() {
        let graph = routed_switch();
        let space = AddressSpace::default();

        let plan = plan_addresses(&graph, space, ("r1", NodeKind::Router), ("r2", NodeKind::Router))
            .unwrap();
        assert_eq!(plan.a_ip, Some(addr("10.12.2.1/24")));
        assert_eq!(plan.b_ip, Some(addr("10.12.2.2/24")));

        let plan = plan_addresses(&graph, space, ("fw1", NodeKind::Firewall), ("r1", NodeKind::Router))
            .unwrap();
        assert_eq!(plan.a_ip, None);
        assert_eq!(plan.b_ip, Some(addr("10.12.2.1/24")));
    }

    #[test]
    fn test_switch_pairs_are_unnumbered() {
        let plan = plan_addresses(
            &routed_switch(),
            AddressSpace::default(),
            ("sw1", NodeKind::Switch),
            ("fw1", NodeKind::Firewall),
        )
        .unwrap();
        assert_eq!(plan, LinkPlan::default());
    }
}
