//! CLI module for vnetctl
//!
//! Provides kubectl-like subcommands:
//! - `vnetctl get` - Show the topology or its nodes
//! - `vnetctl node` - Add, delete or reboot a device
//! - `vnetctl link` - Add, delete or rewire a link
//! - `vnetctl layout` - Compute display coordinates
//! - `vnetctl bulk` - Many changes through the worker pool
//! - `vnetctl diag` - Ping, traceroute and interface listings
//! - `vnetctl context` - Manage contexts

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

use crate::bulk::NodeRequest;
use crate::layout::LayoutAlgorithm;
use crate::topology::NodeKind;

#[derive(Parser, Debug)]
#[command(name = "vnetctl")]
#[command(about = "Build and rewire virtual network topologies on a cluster")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to config file (default: ~/.vnetctl/config)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Context to use instead of the current one
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// API server bearer token, overriding the context's
    #[arg(long, env = "VNETCTL_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Namespace holding the topology
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    /// Orchestrator settings file (YAML)
    #[arg(long, value_name = "FILE", global = true)]
    pub settings: Option<PathBuf>,

    /// Path to a .env file loaded before anything else
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    /// Run against an in-memory cluster instead of a real one
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Topology records (YAML or JSON list) to start a dry run from
    #[arg(long, value_name = "FILE", global = true, requires = "dry_run")]
    pub seed: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the topology or its nodes
    Get(GetArgs),

    /// Add, delete or reboot a device
    Node(NodeArgs),

    /// Add, delete or rewire a link
    Link(LinkArgs),

    /// Compute display coordinates for every node
    Layout {
        /// Layout algorithm (kamada-kawai or radial)
        #[arg(long)]
        algorithm: Option<LayoutAlgorithm>,
    },

    /// Apply many changes through the worker pool
    Bulk(BulkArgs),

    /// Reachability diagnostics inside devices
    Diag(DiagArgs),

    /// Manage cluster contexts
    Context(ContextArgs),
}

#[derive(Parser, Debug)]
pub struct GetArgs {
    #[command(subcommand)]
    pub resource: GetResource,
}

#[derive(Subcommand, Debug)]
pub enum GetResource {
    /// Nodes, edges and positions for a front end
    #[command(name = "topology", visible_alias = "topo")]
    Topology {
        /// Layout algorithm (kamada-kawai or radial)
        #[arg(long)]
        algorithm: Option<LayoutAlgorithm>,
    },

    /// List nodes with their addresses and peers
    #[command(name = "nodes", visible_alias = "node", visible_alias = "no")]
    Nodes,
}

#[derive(Parser, Debug)]
pub struct NodeArgs {
    #[command(subcommand)]
    pub action: NodeAction,
}

#[derive(Subcommand, Debug)]
pub enum NodeAction {
    /// Provision a new device
    Add {
        /// host, switch, firewall or router
        kind: NodeKind,

        /// Existing node to link the new device to
        #[arg(long)]
        attach: Option<String>,
    },

    /// Remove a device and every link to it
    Delete { name: String },

    /// Recreate a switch or router and restore its wiring
    Reboot { name: String },
}

#[derive(Parser, Debug)]
pub struct LinkArgs {
    #[command(subcommand)]
    pub action: LinkAction,
}

#[derive(Subcommand, Debug)]
pub enum LinkAction {
    /// Link two existing nodes
    Add { a: String, b: String },

    /// Remove the link between two nodes
    Delete { a: String, b: String },

    /// Move a node's link from one peer to another
    Rewire {
        node: String,
        old_peer: String,
        new_peer: String,
    },
}

#[derive(Parser, Debug)]
pub struct BulkArgs {
    #[command(subcommand)]
    pub action: BulkAction,
}

#[derive(Subcommand, Debug)]
pub enum BulkAction {
    /// Add children under existing nodes, e.g. `sw1:hosts=2 r1:switches=1`
    Add {
        #[arg(required = true, value_parser = parse_node_request)]
        requests: Vec<(String, NodeRequest)>,
    },

    /// Give each router a new switch with one host
    Subnet {
        #[arg(required = true)]
        routers: Vec<String>,
    },

    /// Link existing nodes, e.g. `r1:r2 r1:sw1 sw1:host1`; routers go first
    /// and the run stops at the first failed pair
    Links {
        #[arg(required = true, value_parser = parse_link_pair)]
        pairs: Vec<(String, String)>,
    },

    /// Remove the named devices
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Remove every host behind the given switches
    DeleteHosts {
        #[arg(required = true)]
        switches: Vec<String>,
    },
}

#[derive(Parser, Debug)]
pub struct DiagArgs {
    #[command(subcommand)]
    pub action: DiagAction,
}

#[derive(Subcommand, Debug)]
pub enum DiagAction {
    /// Ping `target` from inside `source`
    Ping { source: String, target: String },

    /// Traceroute to `target` from inside `source`
    Traceroute { source: String, target: String },

    /// Routes or bridge state of a device
    Interfaces { name: String },

    /// Ping across every numbered link
    Links {
        /// Only links owned by this node
        #[arg(long)]
        node: Option<String>,
    },
}

#[derive(Parser, Debug)]
pub struct ContextArgs {
    #[command(subcommand)]
    pub action: ContextAction,
}

#[derive(Subcommand, Debug)]
pub enum ContextAction {
    /// List all contexts
    List,

    /// Switch to a context
    Use { name: String },

    /// Add or replace a context
    Add {
        name: String,

        /// API server URL
        #[arg(long)]
        server: String,

        /// Bearer token stored with the context
        #[arg(long = "context-token")]
        context_token: Option<String>,

        /// Namespace stored with the context
        #[arg(long = "context-namespace")]
        context_namespace: Option<String>,

        /// Skip TLS verification for this cluster
        #[arg(long)]
        insecure: bool,
    },

    /// Remove a context
    Remove { name: String },
}

/// Parse `NODE:hosts=N,switches=N,routers=N`; omitted counts are zero
pub fn parse_node_request(s: &str) -> Result<(String, NodeRequest), String> {
    let (node, counts) = s.split_once(':').unwrap_or((s, ""));
    if node.is_empty() {
        return Err(format!("missing node name in '{}'", s));
    }
    let mut request = NodeRequest::default();
    for part in counts.split(',').filter(|p| !p.trim().is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| format!("expected key=count, got '{}'", part))?;
        let value: u32 = value
            .trim()
            .parse()
            .map_err(|_| format!("invalid count '{}'", value))?;
        match key.trim() {
            "hosts" | "host" | "h" => request.hosts = value,
            "switches" | "switch" | "sw" => request.switches = value,
            "routers" | "router" | "r" => request.routers = value,
            other => return Err(format!("unknown child kind '{}'", other)),
        }
    }
    Ok((node.to_string(), request))
}

/// Parse `A:B` into a link pair
pub fn parse_link_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once(':') {
        Some((a, b)) if !a.is_empty() && !b.is_empty() && !b.contains(':') => {
            Ok((a.to_string(), b.to_string()))
        }
        _ => Err(format!("expected NODE:NODE, got '{}'", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_add() {
        let cli = Cli::parse_from(["vnetctl", "node", "add", "host", "--attach", "sw1"]);
        match cli.command {
            Commands::Node(args) => match args.action {
                NodeAction::Add { kind, attach } => {
                    assert_eq!(kind, NodeKind::Host);
                    assert_eq!(attach.as_deref(), Some("sw1"));
                }
                _ => panic!("Expected Add action"),
            },
            _ => panic!("Expected Node command"),
        }
    }

    #[test]
    fn test_parse_get_nodes() {
        let cli = Cli::parse_from(["vnetctl", "get", "nodes"]);
        match cli.command {
            Commands::Get(args) => match args.resource {
                GetResource::Nodes => {}
                _ => panic!("Expected Nodes resource"),
            },
            _ => panic!("Expected Get command"),
        }
    }

    #[test]
    fn test_parse_layout_algorithm() {
        let cli = Cli::parse_from(["vnetctl", "layout", "--algorithm", "radial"]);
        match cli.command {
            Commands::Layout { algorithm } => assert_eq!(algorithm, Some(LayoutAlgorithm::Radial)),
            _ => panic!("Expected Layout command"),
        }
    }

    #[test]
    fn test_parse_link_rewire() {
        let cli = Cli::parse_from(["vnetctl", "link", "rewire", "host1", "sw1", "sw2"]);
        match cli.command {
            Commands::Link(args) => match args.action {
                LinkAction::Rewire {
                    node,
                    old_peer,
                    new_peer,
                } => {
                    assert_eq!((node.as_str(), old_peer.as_str(), new_peer.as_str()), ("host1", "sw1", "sw2"));
                }
                _ => panic!("Expected Rewire action"),
            },
            _ => panic!("Expected Link command"),
        }
    }

    #[test]
    fn test_parse_bulk_add() {
        let cli = Cli::parse_from(["vnetctl", "bulk", "add", "sw1:hosts=2,switches=1", "r1:routers=1"]);
        match cli.command {
            Commands::Bulk(args) => match args.action {
                BulkAction::Add { requests } => {
                    assert_eq!(requests.len(), 2);
                    assert_eq!(requests[0].1.hosts, 2);
                    assert_eq!(requests[0].1.switches, 1);
                    assert_eq!(requests[1].1.routers, 1);
                }
                _ => panic!("Expected Add action"),
            },
            _ => panic!("Expected Bulk command"),
        }
    }

    #[test]
    fn test_parse_bulk_links() {
        let cli = Cli::parse_from(["vnetctl", "bulk", "links", "r1:r2", "sw1:host1"]);
        match cli.command {
            Commands::Bulk(args) => match args.action {
                BulkAction::Links { pairs } => {
                    assert_eq!(pairs[0], ("r1".to_string(), "r2".to_string()));
                    assert_eq!(pairs[1], ("sw1".to_string(), "host1".to_string()));
                }
                _ => panic!("Expected Links action"),
            },
            _ => panic!("Expected Bulk command"),
        }
        assert!(parse_link_pair("r1").is_err());
        assert!(parse_link_pair("r1:").is_err());
        assert!(parse_link_pair("r1:r2:r3").is_err());
    }

    #[test]
    fn test_parse_node_request_errors() {
        assert_eq!(parse_node_request("sw1").unwrap().1, NodeRequest::default());
        assert!(parse_node_request(":hosts=1").is_err());
        assert!(parse_node_request("sw1:hosts").is_err());
        assert!(parse_node_request("sw1:hosts=x").is_err());
        assert!(parse_node_request("sw1:firewalls=1").is_err());
    }

    #[test]
    fn test_parse_context_add() {
        let cli = Cli::parse_from([
            "vnetctl",
            "context",
            "add",
            "lab",
            "--server",
            "https://10.0.0.1:6443",
            "--insecure",
        ]);
        match cli.command {
            Commands::Context(args) => match args.action {
                ContextAction::Add {
                    name,
                    server,
                    insecure,
                    ..
                } => {
                    assert_eq!(name, "lab");
                    assert_eq!(server, "https://10.0.0.1:6443");
                    assert!(insecure);
                }
                _ => panic!("Expected Add action"),
            },
            _ => panic!("Expected Context command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["vnetctl", "-vv", "--dry-run", "-o", "json", "get", "nodes"]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.dry_run);
        assert_eq!(cli.output, OutputFormat::Json);
    }

    #[test]
    fn test_seed_requires_dry_run() {
        assert!(Cli::try_parse_from(["vnetctl", "--seed", "lab.yaml", "get", "nodes"]).is_err());
    }
}
