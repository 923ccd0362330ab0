use std::process;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use vnetctl::cli::{cluster_handles, dry_run_cluster, execute, resolve_settings, run_context_action, Cli, Commands};
use vnetctl::context::{default_config_path, load_config_from, save_config_to};
use vnetctl::orchestrator::Orchestrator;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(output) => print!("{}", output),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<String> {
    if let Some(ref env_file) = cli.env_file {
        dotenvy::from_path(env_file)
            .with_context(|| format!("Failed to load env file {}", env_file.display()))?;
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_config_from(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    if let Commands::Context(args) = &cli.command {
        let (output, changed) = run_context_action(&mut config, &args.action)?;
        if changed {
            save_config_to(&config, &config_path)
                .with_context(|| format!("Failed to save config {}", config_path.display()))?;
        }
        return Ok(output);
    }

    let settings = resolve_settings(&cli, &config)?;
    debug!("Using namespace {}", settings.namespace);

    let handles = if cli.dry_run {
        dry_run_cluster(&settings.namespace, cli.seed.as_deref())
            .await?
            .handles()
    } else {
        cluster_handles(&cli, &config, &settings)?
    };

    let orchestrator = Orchestrator::new(handles, settings);
    Ok(execute(&orchestrator, &cli.command, cli.output).await?)
}
