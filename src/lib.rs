//! vnetctl: virtual network topologies of emulated devices on a cluster
//!
//! Hosts, switches, firewalls and routers each run as a pod; links between
//! them are veth pairs described by one topology record per node.

pub mod bulk;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod fabric;
pub mod layout;
pub mod orchestrator;
pub mod poll;
pub mod provision;
pub mod routing;
pub mod topology;
pub mod workload;

pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::Orchestrator;
