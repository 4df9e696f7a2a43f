use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "devfleet")]
#[command(about = "devfleet - Run a project's services locally, in dependency order, health-checked")]
#[command(version)]
pub struct Cli {
    /// Config file path (defaults to devfleet.yaml, searched upwards)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Project directory (defaults to the config file's directory)
    #[arg(short, long, global = true)]
    pub workdir: Option<PathBuf>,

    /// Verbose logging (same as RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start services and supervise them until Ctrl-C
    Up {
        /// Services to start, with everything they use (defaults to all)
        services: Vec<String>,

        /// Only stream output of these services (repeatable)
        #[arg(long = "logs", value_name = "SERVICE")]
        logs: Vec<String>,

        /// Do not stream process output
        #[arg(long, conflicts_with = "logs")]
        quiet: bool,
    },
    /// Show declared services, their ports and health
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check service health
    Health {
        /// Only check this service (repeatable)
        #[arg(short, long = "service", value_name = "SERVICE")]
        services: Vec<String>,

        /// Keep checking and print events as JSON lines
        #[arg(long)]
        stream: bool,

        /// Interval between checks when streaming (1s to 60s)
        #[arg(long, default_value = "5s", value_parser = parse_interval)]
        interval: std::time::Duration,

        /// Print Prometheus metrics after the check
        #[arg(long, conflicts_with = "stream")]
        metrics: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List persisted port assignments
    Ports {
        /// Drop assignments unused for a week
        #[arg(long)]
        clean: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the dependency levels
    Graph,
}

fn parse_interval(value: &str) -> Result<std::time::Duration, String> {
    devfleet::config::parse_duration_string(value)
        .ok_or_else(|| format!("invalid duration '{}' (expected e.g. 5s, 500ms, 1m)", value))
}
