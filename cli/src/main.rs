// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AEGIS Parallel CLI
//!
//! The `aegis-parallel` binary drives the concurrent execution engine from
//! plan files, with simulated executors standing in for workflow nodes.
//!
//! ## Commands
//!
//! - `aegis-parallel batch run` - Run a fork-join batch plan
//! - `aegis-parallel gateway run|validate` - Fork a gateway pair and wait for its join
//! - `aegis-parallel config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

use aegis_parallel::commands::{self, BatchCommand, ConfigCommand, GatewayCommand};
use aegis_parallel_core::domain::engine_config::{EngineConfigManifest, MetricsConfig};

/// AEGIS Parallel - Fork-join batches, parallel gateways and deadlock detection
#[derive(Parser)]
#[command(name = "aegis-parallel")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "AEGIS_PARALLEL_CONFIG",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the configured level
    #[arg(long, global = true, env = "AEGIS_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fork-join batch operations
    #[command(name = "batch")]
    Batch {
        #[command(subcommand)]
        command: BatchCommand,
    },

    /// Parallel gateway operations
    #[command(name = "gateway")]
    Gateway {
        #[command(subcommand)]
        command: GatewayCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        // Config commands report load errors themselves
        Some(Commands::Config { command }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), cli.log_json)?;
            return commands::config::handle_command(command, cli.config).await;
        }
        Some(command) => command,
        None => {
            // No command provided - show help
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    };

    let config = EngineConfigManifest::load_or_default(cli.config)
        .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let logging = &config.spec.observability.logging;
    let level = cli.log_level.unwrap_or_else(|| logging.level.clone());
    init_logging(&level, cli.log_json || logging.format == "json")?;

    if let Some(metrics) = config.spec.observability.metrics.as_ref().filter(|m| m.enabled) {
        init_metrics(metrics)?;
    }

    match command {
        Commands::Batch { command } => commands::batch::handle_command(command, config).await,
        Commands::Gateway { command } => commands::gateway::handle_command(command, config).await,
        Commands::Config { .. } => Ok(()),
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }

    Ok(())
}

/// Install the Prometheus exporter and describe the engine's metrics
fn init_metrics(config: &MetricsConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    describe_counter!("aegis_parallel_batches_total", "Batches submitted, by mode");
    describe_counter!(
        "aegis_parallel_batches_completed_total",
        "Batches sealed, by termination cause"
    );
    describe_counter!(
        "aegis_parallel_branch_results_total",
        "Branch results accepted, by status"
    );
    describe_histogram!(
        "aegis_parallel_branch_duration_ms",
        "Branch run time in milliseconds"
    );
    describe_counter!(
        "aegis_parallel_branch_timeouts_total",
        "Branches timed out by the sweep"
    );
    describe_counter!(
        "aegis_parallel_late_results_total",
        "Results discarded because their batch was already terminal"
    );
    describe_counter!("aegis_parallel_joins_total", "Join waits finished, by status");
    describe_counter!(
        "aegis_parallel_deadlocks_total",
        "Deadlock cycles resolved, by policy"
    );

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}
