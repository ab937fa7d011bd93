// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Branch execution
//!
//! Drives one branch from `Pending` to a reported result: waits for a
//! concurrency slot, marks the branch running, invokes the runner and races
//! it against the branch timeout and the branch cancellation token.
//!
//! Cancellation is cooperative. After cancellation or a timeout the runner
//! keeps a grace period to acknowledge; a value it still produces is handed
//! to the store, which discards it as late. After the grace period the
//! runner future is dropped and the branch no longer holds its slot.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Branch Runner wrapper around the external `BranchRunner`

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::domain::batch::BatchId;
use crate::domain::branch::{BranchError, BranchErrorKind, BranchResult, BranchTask};
use crate::domain::runner::{BranchRunner, RunnerError};
use crate::infrastructure::state_store::ExecutionStateStore;

pub(crate) struct BranchContext {
    pub batch_id: BatchId,
    pub task: BranchTask,
    /// Effective timeout: the task's own, else the engine default.
    pub timeout: Option<Duration>,
    pub grace: Duration,
    pub token: CancellationToken,
    pub semaphore: Arc<Semaphore>,
    pub runner: Arc<dyn BranchRunner>,
    pub store: Arc<ExecutionStateStore>,
}

enum FirstOutcome {
    Finished(Result<serde_json::Value, RunnerError>),
    Cancelled,
    TimedOut(Duration),
}

pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

pub(crate) fn to_branch_result(
    task: &BranchTask,
    outcome: Result<serde_json::Value, RunnerError>,
    elapsed: Duration,
) -> BranchResult {
    let millis = elapsed.as_millis() as u64;
    match outcome {
        Ok(value) => BranchResult::success(task.id.clone(), value, millis),
        Err(e) => BranchResult::failed(
            task.id.clone(),
            BranchError::new(BranchErrorKind::RunnerFailure, e.to_string()),
            millis,
        ),
    }
}

/// Run one branch to completion. Never panics on its own; a panicking runner
/// unwinds this task and is picked up by the batch supervisor.
pub(crate) async fn run_branch(ctx: BranchContext) {
    let span = info_span!(
        "branch",
        batch_id = %ctx.batch_id,
        branch_id = %ctx.task.id,
        executor = %ctx.task.executor_ref,
    );
    execute(ctx).instrument(span).await
}

async fn execute(ctx: BranchContext) {
    let BranchContext {
        batch_id,
        task,
        timeout,
        grace,
        token,
        semaphore,
        runner,
        store,
    } = ctx;

    // Fair semaphore: slots are granted in submission order.
    let _permit = tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!("Branch cancelled before it was dispatched");
            return;
        }
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    if let Err(rejected) = store.mark_running(batch_id, &task.id, timeout) {
        debug!(?rejected, "Branch not started");
        return;
    }

    let started = Instant::now();
    // a timeout past the clock's range never fires
    let deadline = timeout.and_then(|t| started.checked_add(t));
    let invoke = runner.invoke(&task.executor_ref, task.input.clone(), token.clone());
    tokio::pin!(invoke);

    let first = tokio::select! {
        outcome = &mut invoke => FirstOutcome::Finished(outcome),
        _ = token.cancelled() => FirstOutcome::Cancelled,
        _ = sleep_until_opt(deadline) => match timeout {
            Some(timeout) => FirstOutcome::TimedOut(timeout),
            None => FirstOutcome::Cancelled,
        },
    };

    match first {
        FirstOutcome::Finished(outcome) => {
            let result = to_branch_result(&task, outcome, started.elapsed());
            store.record_result(batch_id, result);
        }
        FirstOutcome::TimedOut(timeout) => {
            store.time_out_branch(batch_id, &task.id, timeout);
            await_acknowledgement(batch_id, &task, invoke, grace, started, &store).await;
        }
        FirstOutcome::Cancelled => {
            debug!("Cancellation requested, waiting for runner to acknowledge");
            await_acknowledgement(batch_id, &task, invoke, grace, started, &store).await;
        }
    }
}

async fn await_acknowledgement<F>(
    batch_id: BatchId,
    task: &BranchTask,
    invoke: std::pin::Pin<&mut F>,
    grace: Duration,
    started: Instant,
    store: &ExecutionStateStore,
) where
    F: std::future::Future<Output = Result<serde_json::Value, RunnerError>>,
{
    match tokio::time::timeout(grace, invoke).await {
        Ok(Err(RunnerError::Cancelled)) => debug!("Runner acknowledged cancellation"),
        Ok(outcome) => {
            // The branch is already terminal, so this is recorded as late.
            store.record_result(batch_id, to_branch_result(task, outcome, started.elapsed()));
        }
        Err(_) => debug!(?grace, "Runner did not acknowledge cancellation within grace period"),
    }
}
