// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use aegis_parallel_core::domain::engine_config::EngineConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default spelled out
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./aegis-parallel.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, force } => generate(output, force).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = EngineConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. AEGIS_PARALLEL_CONFIG: {}",
            std::env::var("AEGIS_PARALLEL_CONFIG")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./aegis-parallel.yaml");
        println!("  4. ~/.aegis/parallel.yaml");
        println!("  5. /etc/aegis/parallel.yaml");
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    let executor = &config.spec.executor;
    println!("{}", "Fork-Join Executor:".bold());
    println!("  Max concurrency: {}", executor.default_max_concurrency);
    println!(
        "  Batch timeout: {}",
        humantime_serde::re::humantime::format_duration(executor.default_batch_timeout)
    );
    match executor.default_branch_timeout {
        Some(timeout) => println!(
            "  Branch timeout: {}",
            humantime_serde::re::humantime::format_duration(timeout)
        ),
        None => println!("  Branch timeout: {}", "(none)".dimmed()),
    }
    println!(
        "  Cancel grace period: {}",
        humantime_serde::re::humantime::format_duration(executor.cancel_grace_period)
    );
    println!(
        "  Retention window: {}",
        humantime_serde::re::humantime::format_duration(executor.retention_window)
    );
    println!();

    let detector = &config.spec.deadlock_detector;
    println!("{}", "Deadlock Detector:".bold());
    if detector.enabled {
        println!("  Enabled: {}", "yes".green());
    } else {
        println!("  Enabled: {}", "no".yellow());
    }
    println!(
        "  Interval: {}",
        humantime_serde::re::humantime::format_duration(detector.interval)
    );
    println!("  Policy: {}", detector.policy);
    println!();

    let observability = &config.spec.observability;
    println!("{}", "Observability:".bold());
    println!("  Event buffer: {}", config.spec.events.capacity);
    println!(
        "  Logging: {} ({})",
        observability.logging.level, observability.logging.format
    );
    match &observability.metrics {
        Some(metrics) if metrics.enabled => {
            println!("  Metrics: Prometheus on port {}", metrics.port)
        }
        _ => println!("  Metrics: {}", "(disabled)".dimmed()),
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = EngineConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists. Use --force to overwrite it.",
            output.display()
        );
    }

    EngineConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("aegis-parallel.yaml");

        generate(output.clone(), false).await.unwrap();
        assert!(generate(output.clone(), false).await.is_err());
        generate(output.clone(), true).await.unwrap();

        validate(Some(output)).await.unwrap();
    }
}
