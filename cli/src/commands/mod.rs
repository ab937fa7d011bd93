// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the aegis-parallel CLI

pub mod batch;
pub mod config;
pub mod gateway;

pub use self::batch::BatchCommand;
pub use self::config::ConfigCommand;
pub use self::gateway::GatewayCommand;

use anyhow::Result;
use clap::ValueEnum;
use colored::{ColoredString, Colorize};
use serde::Serialize;

use aegis_parallel_core::domain::branch::{BranchOutcome, BranchResult};
use aegis_parallel_core::domain::events::EngineEvent;
use aegis_parallel_core::infrastructure::event_bus::{EventBusError, EventReceiver};

/// How command results are printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

/// Print `value` as JSON or YAML. Returns `false` for `Table`, which each
/// command renders itself.
pub(crate) fn print_structured<T: Serialize>(value: &T, format: OutputFormat) -> Result<bool> {
    match format {
        OutputFormat::Table => Ok(false),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
            Ok(true)
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(value)?);
            Ok(true)
        }
    }
}

pub(crate) fn colored_status(status: BranchOutcome) -> ColoredString {
    match status {
        BranchOutcome::Success => status.as_str().green(),
        BranchOutcome::Failed => status.as_str().red(),
        BranchOutcome::TimedOut => status.as_str().yellow(),
        BranchOutcome::Cancelled => status.as_str().dimmed(),
    }
}

/// One table row per branch result.
pub(crate) fn print_results(results: &[BranchResult]) {
    println!(
        "  {:<20} {:<12} {:>10}  {}",
        "BRANCH".bold(),
        "STATUS".bold(),
        "DURATION".bold(),
        "DETAIL".bold()
    );
    for result in results {
        let detail = match (&result.value, &result.error, &result.cancel_reason) {
            (Some(value), _, _) => value.to_string(),
            (_, Some(error), _) => format!("{:?}: {}", error.kind, error.message),
            (_, _, Some(reason)) => format!("{:?}", reason),
            _ => String::new(),
        };
        println!(
            "  {:<20} {:<12} {:>8}ms  {}",
            result.branch_id.as_str(),
            colored_status(result.status),
            result.duration_millis,
            detail
        );
    }
}

/// Print engine events until the bus closes.
pub(crate) async fn follow_events(mut events: EventReceiver) {
    loop {
        match events.recv().await {
            Ok(event) => print_event(&event),
            Err(EventBusError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

fn print_event(event: &EngineEvent) {
    let detail = match event {
        EngineEvent::BranchStarted { branch_id, executor_ref, .. } => {
            format!("{} on {}", branch_id, executor_ref)
        }
        EngineEvent::BranchCompleted { branch_id, status, duration_ms, .. } => {
            format!("{} {} after {}ms", branch_id, status.as_str(), duration_ms)
        }
        EngineEvent::BranchTimedOut { branch_id, timeout_ms, .. } => {
            format!("{} exceeded {}ms", branch_id, timeout_ms)
        }
        EngineEvent::LateResultDiscarded { branch_id, status, .. } => {
            format!("{} reported {} after termination", branch_id, status.as_str())
        }
        EngineEvent::BatchCompleted { termination, succeeded, failed, cancelled, .. } => format!(
            "{} ({} ok, {} failed, {} cancelled)",
            termination.as_str(),
            succeeded,
            failed,
            cancelled
        ),
        EngineEvent::DeadlockDetected { cycle, .. } => format!("{} nodes", cycle.len()),
        EngineEvent::DeadlockResolved { victims, policy, .. } => {
            format!("{} victim(s) by {}", victims.len(), policy)
        }
        _ => String::new(),
    };
    println!("{} {} {}", "»".dimmed(), event.name().cyan(), detail.dimmed());
}
