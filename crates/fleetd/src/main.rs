//! fleetd, the FleetGrid daemon.
//!
//! Loads a fleet config, registers the configured instances, and runs the
//! load balancer's health-check and autoscaling loops until Ctrl-C.
//! Lifecycle events are written to the log.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config fleet.toml
//! fleetd run --config fleet.toml --log-format json
//! fleetd check --config fleet.toml
//! ```

mod config;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use fleetgrid_balancer::LoadBalancer;
use fleetgrid_state::FleetEvent;

const DEFAULT_LOG_FILTER: &str = "info,fleetd=debug,fleetgrid=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid load balancer daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the balancer with health checking and autoscaling.
    Run {
        /// Path to the fleet config.
        #[arg(short, long, default_value = "fleet.toml")]
        config: PathBuf,
    },
    /// Validate a config file and print the effective settings.
    Check {
        #[arg(short, long, default_value = "fleet.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Check { config } => check(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let config = config::load(path)?;
    info!(path = %path.display(), "FleetGrid daemon starting");

    let balancer = LoadBalancer::from_config(config)?;
    let logger = tokio::spawn(log_events(balancer.subscribe()));
    balancer.start();

    tokio::signal::ctrl_c().await.context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");

    let stats = balancer.get_instance_stats();
    info!(
        total = stats.total_instances,
        healthy = stats.healthy_instances,
        connections = stats.total_connections,
        "final fleet state"
    );
    balancer.shutdown();
    let _ = logger.await;

    info!("FleetGrid daemon stopped");
    Ok(())
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = config::load(path)?;
    let scaling = &config.autoscaling;

    println!("{}: ok", path.display());
    println!("  strategy:    {}", config.strategy.name);
    println!("  instances:   {}", config.instances.len());
    if scaling.enabled {
        println!(
            "  autoscaling: {}..{} instances, cooldown {}s",
            scaling.min_instances, scaling.max_instances, scaling.cooldown_period
        );
    } else {
        println!("  autoscaling: disabled");
    }
    println!(
        "  health:      every {}s, GET {} ({}ms timeout)",
        config.health.interval_secs, config.health.path, config.health.timeout_ms
    );

    let effective = toml::to_string_pretty(&config).context("failed to render effective config")?;
    println!("\n# effective config\n{effective}");
    Ok(())
}

/// Log every fleet event until the bus closes.
async fn log_events(mut events: broadcast::Receiver<FleetEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let payload = serde_json::to_string(&event).unwrap_or_default();
                match event {
                    FleetEvent::ConnectionIncremented { .. }
                    | FleetEvent::ConnectionDecremented { .. } => {
                        debug!(event = event.name(), %payload, "fleet event");
                    }
                    _ => info!(event = event.name(), %payload, "fleet event"),
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event logger fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("event logger stopped");
}
