//! Addressing for the emulated network
//!
//! The orchestrator owns one private `/16` block. Every router-facing link
//! gets its own `/24` inside it, selected by a subnet id (the third octet),
//! and hosts inside a subnet are told apart by the last octet.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Prefix length of every interface address handed out
pub const SUBNET_PREFIX_LEN: u8 = 24;

/// Largest usable subnet id / host number inside a `/24`
pub const MAX_OCTET: u32 = 254;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid interface address '{0}': expected a.b.c.d/len")]
    InvalidCidr(String),

    #[error("Invalid address space '{0}': expected a.b.0.0/16")]
    InvalidSpace(String),
}

/// An IPv4 address with its prefix length, e.g. `10.12.3.1/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceAddress {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl InterfaceAddress {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    /// The `/24` this address lives in
    pub fn subnet(&self) -> Subnet {
        Subnet::of(self.addr)
    }

    /// Last octet (host number within the subnet)
    pub fn host_number(&self) -> u8 {
        self.addr.octets()[3]
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for InterfaceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => (addr, len),
            // Bare addresses are accepted and treated as /32
            None => (s, "32"),
        };
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| AddressError::InvalidCidr(s.to_string()))?;
        let prefix_len: u8 = len
            .parse()
            .ok()
            .filter(|l| *l <= 32)
            .ok_or_else(|| AddressError::InvalidCidr(s.to_string()))?;
        Ok(Self { addr, prefix_len })
    }
}

impl Serialize for InterfaceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InterfaceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Deserialize an optional address where the empty string means "unnumbered"
pub fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<InterfaceAddress>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(s) if !s.trim().is_empty() => s.parse().map(Some).map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

/// A `/24` identified by its first three octets, displayed as `10.12.3`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subnet([u8; 3]);

impl Subnet {
    pub fn of(addr: Ipv4Addr) -> Self {
        let [a, b, c, _] = addr.octets();
        Self([a, b, c])
    }

    /// Subnet id (third octet)
    pub fn id(&self) -> u8 {
        self.0[2]
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        Self::of(addr) == *self
    }

    /// Address of `host` inside this subnet, with the `/24` prefix
    pub fn host(&self, host: u8) -> InterfaceAddress {
        let [a, b, c] = self.0;
        InterfaceAddress::new(Ipv4Addr::new(a, b, c, host), SUBNET_PREFIX_LEN)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{}.{}.{}", a, b, c)
    }
}

/// The orchestrator's private `/16`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    octets: [u8; 2],
}

impl AddressSpace {
    pub fn new(a: u8, b: u8) -> Self {
        Self { octets: [a, b] }
    }

    /// The `/24` with the given subnet id
    pub fn subnet(&self, id: u8) -> Subnet {
        let [a, b] = self.octets;
        Subnet([a, b, id])
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let [a, b, _, _] = addr.octets();
        [a, b] == self.octets
    }

    /// Network address of the block, e.g. `10.12.0.0/16`
    pub fn cidr(&self) -> String {
        let [a, b] = self.octets;
        format!("{}.{}.0.0/16", a, b)
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new(10, 12)
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cidr())
    }
}

impl FromStr for AddressSpace {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cidr: InterfaceAddress = s
            .parse()
            .map_err(|_| AddressError::InvalidSpace(s.to_string()))?;
        let [a, b, c, d] = cidr.addr.octets();
        if cidr.prefix_len != 16 || c != 0 || d != 0 {
            return Err(AddressError::InvalidSpace(s.to_string()));
        }
        Ok(Self::new(a, b))
    }
}

impl Serialize for AddressSpace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AddressSpace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
