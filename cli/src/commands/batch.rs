// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Batch commands
//!
//! Commands: run

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use aegis_parallel_core::domain::batch::{BatchReport, BatchVerdict};
use aegis_parallel_core::domain::engine_config::EngineConfigManifest;
use aegis_parallel_core::domain::errors::EngineError;
use aegis_parallel_core::{BatchOptions, ConcurrencyEngine};

use super::{follow_events, print_results, print_structured, OutputFormat};
use crate::plan::{load_plan, BatchPlan};
use crate::simulated_runner::SimulatedRunner;

#[derive(Subcommand)]
pub enum BatchCommand {
    /// Run a batch plan against simulated executors
    Run {
        /// Plan file (YAML, or JSON by extension)
        #[arg(value_name = "PLAN")]
        plan: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,

        /// Print engine events as they happen
        #[arg(long)]
        events: bool,
    },
}

pub async fn handle_command(command: BatchCommand, config: EngineConfigManifest) -> Result<()> {
    match command {
        BatchCommand::Run {
            plan,
            output,
            events,
        } => run(plan, output, events, config).await,
    }
}

async fn run(
    plan_path: PathBuf,
    output: OutputFormat,
    show_events: bool,
    config: EngineConfigManifest,
) -> Result<()> {
    let plan: BatchPlan = load_plan(&plan_path)?;
    info!(
        "Running batch plan {:?} ({} tasks, mode {})",
        plan_path,
        plan.tasks.len(),
        plan.mode
    );

    let runner = Arc::new(SimulatedRunner::new(plan.executors.clone()));
    let engine = ConcurrencyEngine::new(config, runner);
    engine.start();

    let follower = show_events.then(|| tokio::spawn(follow_events(engine.subscribe())));

    let options = BatchOptions {
        batch_timeout: plan.batch_timeout,
        max_concurrency: plan.max_concurrency,
        parent_token: None,
    };
    let result = engine.execute_batch(plan.tasks, plan.mode, options).await;

    engine.shutdown();
    if let Some(follower) = follower {
        follower.abort();
    }

    match result {
        Ok(report) => {
            if !print_structured(&report, output)? {
                print_report(&report);
            }
            Ok(())
        }
        Err(EngineError::AllBranchesFailed { batch_id, failures }) => {
            if !print_structured(&failures, output)? {
                println!("{} Batch {}", "✗".red(), batch_id);
                for failure in &failures {
                    println!(
                        "  {:<20} {:?}: {}",
                        failure.branch_id.as_str(),
                        failure.error.kind,
                        failure.error.message
                    );
                }
            }
            anyhow::bail!("All {} branches failed", failures.len())
        }
        Err(e) => Err(e).context("Batch execution failed"),
    }
}

fn print_report(report: &BatchReport) {
    let headline = match report.verdict() {
        BatchVerdict::AllSucceeded => "all branches succeeded".green(),
        BatchVerdict::PartialFailure => "partial failure".yellow(),
        BatchVerdict::Failed => "failed".red(),
        BatchVerdict::ForcedTermination(cause) => cause.as_str().yellow(),
    };
    println!("{} Batch {} ({})", "✓".green(), report.batch_id, report.mode);
    println!("  Termination: {}", report.termination.as_str());
    println!("  Verdict: {}", headline);
    if let Some(decisive) = &report.decisive {
        println!("  Decided by: {}", decisive.branch_id.as_str().bold());
    }
    println!(
        "  Elapsed: {}ms",
        (report.finished_at - report.started_at).num_milliseconds()
    );
    println!();
    print_results(&report.results);
}
