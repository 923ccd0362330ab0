//! Command implementations for the CLI
//!
//! Commands return rendered output or an error; printing and exit codes are
//! left to the binary.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::display::*;
use super::{
    BulkAction, Cli, Commands, ContextAction, DiagAction, GetResource, LinkAction, NodeAction,
    OutputFormat,
};
use crate::cluster::{
    AgentError, ClusterHandles, FakeCluster, HttpLinkAgent, KubeClient, WebSocketExec, WorkloadError,
};
use crate::config::{load_settings_file, ConfigError, Settings};
use crate::context::{self, Config, Context, ContextError};
use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;
use crate::poll::TokioSleeper;
use crate::topology::{TopologyList, TopologyRecord};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("Cluster client error: {0}")]
    Workload(#[from] WorkloadError),

    #[error("Link agent client error: {0}")]
    Agent(#[from] AgentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid seed file: {0}")]
    Seed(String),

    #[error("'{0}' commands do not use a cluster")]
    Local(&'static str),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Context Commands (pure, the caller saves the config)
// ============================================================================

/// Info about a context for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextInfo {
    pub name: String,
    pub server: String,
    pub namespace: Option<String>,
    pub is_current: bool,
}

pub fn context_list(config: &Config) -> Vec<ContextInfo> {
    let current = config.current_context.as_deref();
    config
        .contexts
        .values()
        .map(|ctx| ContextInfo {
            name: ctx.name.clone(),
            server: ctx.server.clone(),
            namespace: ctx.namespace.clone(),
            is_current: Some(ctx.name.as_str()) == current,
        })
        .collect()
}

/// Apply a context action, returning the message and whether the config
/// changed
pub fn run_context_action(config: &mut Config, action: &ContextAction) -> CommandResult<(String, bool)> {
    match action {
        ContextAction::List => Ok((format_context_list(&context_list(config)), false)),
        ContextAction::Use { name } => {
            context::set_current_context(config, name)?;
            Ok((format!("Switched to context \"{}\".\n", name), true))
        }
        ContextAction::Add {
            name,
            server,
            context_token,
            context_namespace,
            insecure,
        } => {
            let mut ctx = Context::new(name, server).with_insecure(*insecure);
            if let Some(token) = context_token {
                ctx = ctx.with_token(token);
            }
            if let Some(namespace) = context_namespace {
                ctx = ctx.with_namespace(namespace);
            }
            context::add_context(config, ctx)?;
            if config.current_context.is_none() {
                config.current_context = Some(name.clone());
            }
            Ok((format!("Context \"{}\" added.\n", name), true))
        }
        ContextAction::Remove { name } => {
            context::remove_context(config, name)?;
            Ok((format!("Context \"{}\" removed.\n", name), true))
        }
    }
}

// ============================================================================
// Session setup
// ============================================================================

/// Settings from the optional file, with the namespace taken from the
/// flag, then the context, then the file
pub fn resolve_settings(cli: &Cli, config: &Config) -> CommandResult<Settings> {
    let mut settings = match &cli.settings {
        Some(path) => load_settings_file(path)?,
        None => Settings::default(),
    };
    let context_namespace = context::resolve_context(config, cli.context.as_deref())
        .ok()
        .and_then(|ctx| ctx.namespace.clone());
    if let Some(namespace) = cli.namespace.clone().or(context_namespace) {
        settings = settings.with_namespace(namespace);
    }
    Ok(settings)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SeedFile {
    Records(Vec<TopologyRecord>),
    List(TopologyList),
}

/// Topology records from a YAML or JSON seed, as a list or a `{items: [...]}`
pub fn parse_seed(content: &str) -> CommandResult<Vec<TopologyRecord>> {
    let seed: SeedFile = serde_yaml::from_str(content).map_err(|e| CommandError::Seed(e.to_string()))?;
    Ok(match seed {
        SeedFile::Records(records) => records,
        SeedFile::List(list) => list.items,
    })
}

/// An in-memory cluster, optionally seeded from a file
pub async fn dry_run_cluster(namespace: &str, seed: Option<&Path>) -> CommandResult<FakeCluster> {
    let cluster = FakeCluster::new();
    if let Some(path) = seed {
        let records = parse_seed(&std::fs::read_to_string(path)?)?;
        info!("Seeding dry run with {} records from {}", records.len(), path.display());
        cluster.seed(namespace, records).await;
    }
    Ok(cluster)
}

/// Real cluster handles for the selected context
pub fn cluster_handles(cli: &Cli, config: &Config, settings: &Settings) -> CommandResult<ClusterHandles> {
    let ctx = context::resolve_context(config, cli.context.as_deref())?;
    let connection = ctx.connection(cli.token.clone());
    debug!("Connecting to {} as context {}", connection.server, ctx.name);

    let kube = Arc::new(KubeClient::new(connection.clone())?);
    let agent = HttpLinkAgent::new(kube.clone(), settings.agent_port)?;
    Ok(ClusterHandles::new(
        kube.clone(),
        kube,
        Arc::new(WebSocketExec::new(connection)),
        Arc::new(agent),
        Arc::new(TokioSleeper),
    ))
}

// ============================================================================
// Orchestrator commands
// ============================================================================

fn render<T: Serialize>(format: OutputFormat, value: &T, table: impl FnOnce(&T) -> String) -> CommandResult<String> {
    match format {
        OutputFormat::Json => Ok(format!("{}\n", serde_json::to_string_pretty(value)?)),
        OutputFormat::Table => Ok(table(value)),
    }
}

/// Run any command other than `context`
pub async fn execute(orchestrator: &Orchestrator, command: &Commands, format: OutputFormat) -> CommandResult<String> {
    match command {
        Commands::Get(args) => match &args.resource {
            GetResource::Topology { algorithm } => {
                let view = orchestrator.view(*algorithm).await?;
                render(format, &view, format_topology)
            }
            GetResource::Nodes => {
                let nodes = orchestrator.nodes().await?;
                render(format, &nodes, |n| format_node_list(n))
            }
        },
        Commands::Node(args) => match &args.action {
            NodeAction::Add { kind, attach } => {
                let name = orchestrator.add_device(*kind, attach.as_deref()).await?;
                render(format, &name, |n| format!("{} {} created\n", kind, n))
            }
            NodeAction::Delete { name } => {
                let removal = orchestrator.remove_device(name).await?;
                render(format, &removal, format_removal)
            }
            NodeAction::Reboot { name } => {
                orchestrator.reboot_device(name).await?;
                render(format, name, |n| format!("{} rebooted\n", n))
            }
        },
        Commands::Link(args) => match &args.action {
            LinkAction::Add { a, b } => {
                let outcome = orchestrator.add_link(a, b).await?;
                render(format, &outcome, format_link_outcome)
            }
            LinkAction::Delete { a, b } => {
                orchestrator.remove_link(a, b).await?;
                render(format, &(a, b), |(a, b)| format!("link {} <-> {} deleted\n", a, b))
            }
            LinkAction::Rewire {
                node,
                old_peer,
                new_peer,
            } => {
                let outcome = orchestrator.rewire_link(node, old_peer, new_peer).await?;
                render(format, &outcome, format_link_outcome)
            }
        },
        Commands::Layout { algorithm } => {
            let positions = orchestrator.layout(*algorithm).await?;
            render(format, &positions, format_positions)
        }
        Commands::Bulk(args) => {
            let bulk = orchestrator.bulk();
            let report = match &args.action {
                BulkAction::Add { requests } => {
                    let requests: BTreeMap<_, _> = requests.iter().cloned().collect();
                    bulk.add_nodes(&requests).await?
                }
                BulkAction::Subnet { routers } => bulk.add_subnets(routers).await?,
                BulkAction::Links { pairs } => bulk.add_links(pairs).await?,
                BulkAction::Delete { names } => bulk.delete_nodes(names).await?,
                BulkAction::DeleteHosts { switches } => bulk.delete_hosts_for_switches(switches).await?,
            };
            render(format, &report, format_bulk_report)
        }
        Commands::Diag(args) => {
            let diagnostics = orchestrator.diagnostics();
            match &args.action {
                DiagAction::Ping { source, target } => Ok(diagnostics.ping(source, target).await?),
                DiagAction::Traceroute { source, target } => {
                    Ok(diagnostics.traceroute(source, target).await?)
                }
                DiagAction::Interfaces { name } => Ok(diagnostics.interfaces(name).await?),
                DiagAction::Links { node } => {
                    let health = diagnostics.evaluate_links(node.as_deref()).await?;
                    render(format, &health, |h| format_link_health(h))
                }
            }
        }
        Commands::Context(_) => Err(CommandError::Local("context")),
    }
}
