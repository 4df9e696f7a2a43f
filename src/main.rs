mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use devfleet::port::InteractiveResolver;
use devfleet::service::new_log_hub;
use devfleet::{Error as FleetError, Orchestrator, Parser as ConfigParser};
use std::path::{Path, PathBuf};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(fleet_error) = e.downcast_ref::<FleetError>() {
            eprintln!("Error: {}", fleet_error);
            if let Some(suggestion) = fleet_error.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let out = output::CliOutput;

    // Only needs the project directory.
    if let Commands::Ports { clean, json } = &cli.command {
        let work_dir = match cli.workdir.clone() {
            Some(dir) => dir,
            None => resolve_work_dir(None, &locate_config(cli.config.clone())?)?,
        };
        return commands::run_ports(&work_dir, *clean, *json, &out);
    }

    let config_path = locate_config(cli.config.clone())?;
    let config = ConfigParser::new().load_config(&config_path)?;
    let work_dir = resolve_work_dir(cli.workdir.clone(), &config_path)?;
    tracing::debug!(config = %config_path.display(), work_dir = %work_dir.display(), "Loaded config");

    match cli.command {
        Commands::Graph => commands::run_graph(&config, &out),
        Commands::Status { json } => commands::run_status(&config, &work_dir, json, &out).await,
        Commands::Health {
            services,
            stream,
            interval,
            metrics,
            json,
        } => {
            let args = commands::HealthArgs {
                services,
                stream,
                interval,
                metrics,
                json,
            };
            commands::run_health(&config, &work_dir, args, &out).await
        }
        Commands::Up { services, logs, quiet } => {
            let orchestrator = Orchestrator::builder()
                .config(config)
                .project_dir(work_dir)
                .conflict_resolver(Box::new(InteractiveResolver))
                .log_hub(new_log_hub())
                .build()?;
            commands::run_up(&orchestrator, &services, &logs, quiet, &out).await
        }
        Commands::Ports { .. } => Ok(()),
    }
}

fn locate_config(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => Ok(ConfigParser::new().find_config_file()?),
    }
}

fn resolve_work_dir(workdir: Option<PathBuf>, config_path: &Path) -> anyhow::Result<PathBuf> {
    if let Some(workdir) = workdir {
        return Ok(workdir);
    }
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => Ok(parent.to_path_buf()),
        _ => Ok(std::env::current_dir()?),
    }
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
