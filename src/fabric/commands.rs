//! Device command lines run through pod exec

use std::net::Ipv4Addr;

use crate::cluster::argv;
use crate::workload::BRIDGE;

pub fn add_bridge_port(iface: &str) -> Vec<String> {
    argv(&["ovs-vsctl", "--may-exist", "add-port", BRIDGE, iface])
}

pub fn del_bridge_port(iface: &str) -> Vec<String> {
    argv(&["ovs-vsctl", "--if-exists", "del-port", BRIDGE, iface])
}

pub fn list_bridge_ports() -> Vec<String> {
    argv(&["ovs-vsctl", "list-ports", BRIDGE])
}

pub fn show_bridge() -> Vec<String> {
    argv(&["ovs-vsctl", "show"])
}

pub fn link_show(iface: &str) -> Vec<String> {
    argv(&["ip", "link", "show", iface])
}

pub fn link_delete(iface: &str) -> Vec<String> {
    argv(&["ip", "link", "delete", iface])
}

pub fn link_up(iface: &str) -> Vec<String> {
    argv(&["ip", "link", "set", iface, "up"])
}

/// Attach an interface to the firewall's Linux bridge
pub fn linux_bridge_add(iface: &str) -> Vec<String> {
    argv(&["brctl", "addif", BRIDGE, iface])
}

pub fn linux_bridge_show() -> Vec<String> {
    argv(&["brctl", "show"])
}

pub fn route_add(cidr: &str, gateway: Ipv4Addr) -> Vec<String> {
    argv(&["ip", "route", "add", cidr, "via", &gateway.to_string()])
}

pub fn route_show() -> Vec<String> {
    argv(&["ip", "route"])
}

pub fn ping(target: Ipv4Addr) -> Vec<String> {
    argv(&["ping", "-c", "4", &target.to_string()])
}

pub fn traceroute(target: Ipv4Addr) -> Vec<String> {
    argv(&["traceroute", "-w", "3", &target.to_string()])
}

/// Whether `list-ports` output names `iface`
pub fn port_listed(list_ports_output: &str, iface: &str) -> bool {
    list_ports_output.lines().any(|line| line.trim() == iface)
}
