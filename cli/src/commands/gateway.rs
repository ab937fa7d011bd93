// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Gateway commands
//!
//! Commands: run, validate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use aegis_parallel_core::domain::engine_config::EngineConfigManifest;
use aegis_parallel_core::domain::gateway::{JoinOutcome, JoinStatus};
use aegis_parallel_core::ConcurrencyEngine;

use super::{print_structured, OutputFormat};
use crate::plan::{load_plan, GatewayPlan};
use crate::simulated_runner::SimulatedRunner;

#[derive(Subcommand)]
pub enum GatewayCommand {
    /// Fork a gateway plan and wait for its join
    Run {
        /// Plan file (YAML, or JSON by extension)
        #[arg(value_name = "PLAN")]
        plan: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,

        /// Cancel branches still running once the join is satisfied
        #[arg(long)]
        cancel_pending: bool,
    },

    /// Check that a gateway plan describes a well-formed pair
    Validate {
        #[arg(value_name = "PLAN")]
        plan: PathBuf,
    },
}

pub async fn handle_command(command: GatewayCommand, config: EngineConfigManifest) -> Result<()> {
    match command {
        GatewayCommand::Run {
            plan,
            output,
            cancel_pending,
        } => run(plan, output, cancel_pending, config).await,
        GatewayCommand::Validate { plan } => validate(plan).await,
    }
}

async fn run(
    plan_path: PathBuf,
    output: OutputFormat,
    cancel_pending: bool,
    config: EngineConfigManifest,
) -> Result<()> {
    let plan: GatewayPlan = load_plan(&plan_path)?;
    let spec = plan.to_spec()?;

    let runner = Arc::new(SimulatedRunner::new(plan.executors.clone()));
    let engine = ConcurrencyEngine::new(config, runner);
    engine.start();

    engine
        .register_gateway_pair(spec.clone())
        .context("Failed to register gateway pair")?;
    let batch_id = engine.fork(&spec, plan.payload.clone())?;
    info!("Forked {} into batch {}", spec.fork_id, batch_id);

    let result = engine.await_join(&spec).await;

    if cancel_pending && engine.cancel_fork(&spec.join_id)? {
        info!("Cancelled branches still running behind {}", spec.join_id);
    }
    engine.shutdown();

    let outcome = result.with_context(|| format!("Join {} failed", spec.join_id))?;
    if !print_structured(&outcome, output)? {
        print_outcome(&outcome);
    }
    Ok(())
}

async fn validate(plan_path: PathBuf) -> Result<()> {
    println!("Validating gateway plan...");

    let plan: GatewayPlan = load_plan(&plan_path)?;
    let spec = plan.to_spec()?;
    spec.validate().context("Gateway plan validation failed")?;

    println!(
        "{}",
        format!(
            "✓ {} -> {} with {} targets, join needs {}",
            spec.fork_id,
            spec.join_id,
            spec.branch_targets.len(),
            spec.required_arrivals()
        )
        .green()
    );
    Ok(())
}

fn print_outcome(outcome: &JoinOutcome) {
    let status = match outcome.status {
        JoinStatus::Complete => "complete".green(),
        JoinStatus::PartialFailure => "partial failure".yellow(),
    };
    println!("{} Join {} ({})", "✓".green(), outcome.join_id, status);
    println!("  Merged: {}", outcome.merged);
    println!(
        "  Arrived: {}",
        outcome
            .arrived
            .iter()
            .map(|id| id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    if !outcome.pending.is_empty() {
        println!(
            "  Still pending: {}",
            outcome
                .pending
                .iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
                .dimmed()
        );
    }
    for failure in &outcome.failures {
        println!(
            "  {} {} {:?}: {}",
            "✗".red(),
            failure.branch_id.as_str(),
            failure.error.kind,
            failure.error.message
        );
    }
}
