// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Integration tests for the fork-join executor
//!
//! Branches run against a scripted runner under a paused clock, so delays
//! are exact and the tests are deterministic.

mod common;

use aegis_parallel_core::domain::batch::{BatchVerdict, ExecutionMode, TerminationCause};
use aegis_parallel_core::domain::branch::{BranchErrorKind, BranchOutcome, BranchTask, CancelReason};
use aegis_parallel_core::domain::errors::EngineError;
use aegis_parallel_core::domain::events::EngineEvent;
use aegis_parallel_core::{BatchOptions, BatchRequest};
use common::{engine, engine_with, Script, ScriptedRunner};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn tasks(names: &[&str]) -> Vec<BranchTask> {
    names
        .iter()
        .map(|name| BranchTask::new(*name, *name, json!({ "name": name })))
        .collect()
}

fn ids(results: &[aegis_parallel_core::domain::branch::BranchResult]) -> Vec<&str> {
    results.iter().map(|r| r.branch_id.as_str()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_all_mode_preserves_submission_order() {
    let runner = ScriptedRunner::new()
        .script("a", Script::ok(50, json!("A")))
        .script("b", Script::ok(80, json!("B")))
        .script("c", Script::ok(30, json!("C")));
    let engine = engine(runner);

    let report = engine
        .execute_batch(tasks(&["a", "b", "c"]), ExecutionMode::All, BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(ids(&report.results), vec!["a", "b", "c"]);
    assert!(report.results.iter().all(|r| r.status == BranchOutcome::Success));
    assert_eq!(
        report.results.iter().map(|r| r.value.clone().unwrap()).collect::<Vec<_>>(),
        vec![json!("A"), json!("B"), json!("C")]
    );
    assert_eq!(report.termination, TerminationCause::PolicySatisfied);
    assert_eq!(report.verdict(), BatchVerdict::AllSucceeded);
    assert!(report.decisive.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_all_mode_is_terminal_only_after_every_branch() {
    let runner = ScriptedRunner::new()
        .script("a", Script::ok(50, json!(1)))
        .script("b", Script::ok(80, json!(2)))
        .script("c", Script::ok(30, json!(3)));
    let engine = engine(runner);

    let pending = engine
        .submit_batch(BatchRequest::new(tasks(&["a", "b", "c"]), ExecutionMode::All))
        .unwrap();
    let batch_id = pending.batch_id();

    tokio::time::sleep(Duration::from_millis(60)).await;
    let snapshot = engine.batch_status(batch_id).unwrap();
    assert!(!snapshot.terminal);
    assert_eq!(snapshot.count(BranchOutcome::Success), 2);
    assert_eq!(snapshot.running(), 1);

    let report = pending.wait().await.unwrap();
    assert_eq!(report.results.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_all_mode_reports_partial_failure() {
    let runner = ScriptedRunner::new()
        .script("a", Script::ok(10, json!(1)))
        .script("b", Script::fail(20, "disk full"))
        .script("c", Script::ok(30, json!(3)));
    let engine = engine(runner);

    let report = engine
        .execute_batch(tasks(&["a", "b", "c"]), ExecutionMode::All, BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(report.verdict(), BatchVerdict::PartialFailure);
    let failed = &report.results[1];
    assert_eq!(failed.status, BranchOutcome::Failed);
    let error = failed.error.as_ref().unwrap();
    assert_eq!(error.kind, BranchErrorKind::RunnerFailure);
    assert!(error.message.contains("disk full"));
}

#[tokio::test(start_paused = true)]
async fn test_any_mode_stops_at_first_terminal_and_cancels_the_rest() {
    let runner = ScriptedRunner::new()
        .script("fast", Script::ok(10, json!("winner")))
        .script("slow", Script::ok(500, json!("late")))
        .script("slower", Script::ok(900, json!("later")));
    let engine = engine(runner.clone());

    let report = engine
        .execute_batch(
            tasks(&["slow", "fast", "slower"]),
            ExecutionMode::Any,
            BatchOptions::default(),
        )
        .await
        .unwrap();

    let decisive = report.decisive.as_ref().unwrap();
    assert_eq!(decisive.branch_id.as_str(), "fast");
    assert_eq!(decisive.value, Some(json!("winner")));
    assert_eq!(ids(&report.results), vec!["slow", "fast", "slower"]);
    for loser in [&report.results[0], &report.results[2]] {
        assert_eq!(loser.status, BranchOutcome::Cancelled);
        assert_eq!(loser.cancel_reason, Some(CancelReason::PolicySatisfied));
    }

    // runners observe the signal once they are polled again
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(runner.cancelled(), vec!["slow".to_string(), "slower".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_any_mode_is_decided_by_a_failure_too() {
    let runner = ScriptedRunner::new()
        .script("a", Script::fail(10, "nope"))
        .script("b", Script::ok(50, json!(2)));
    let engine = engine(runner);

    let report = engine
        .execute_batch(tasks(&["a", "b"]), ExecutionMode::Any, BatchOptions::default())
        .await
        .unwrap();

    let decisive = report.decisive.unwrap();
    assert_eq!(decisive.branch_id.as_str(), "a");
    assert_eq!(decisive.status, BranchOutcome::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_first_success_skips_failures() {
    let runner = ScriptedRunner::new()
        .script("a", Script::fail(10, "first"))
        .script("b", Script::ok(20, json!("ok")))
        .script("c", Script::ok(300, json!("too late")));
    let engine = engine(runner);

    let report = engine
        .execute_batch(
            tasks(&["a", "b", "c"]),
            ExecutionMode::FirstSuccess,
            BatchOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.decisive.unwrap().branch_id.as_str(), "b");
    assert_eq!(report.results[0].status, BranchOutcome::Failed);
    assert_eq!(report.results[2].status, BranchOutcome::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_first_success_aggregates_every_failure() {
    let runner = ScriptedRunner::new()
        .script("a", Script::fail(30, "alpha broke"))
        .script("b", Script::fail(10, "beta broke"))
        .script("c", Script::fail(20, "gamma broke"));
    let engine = engine(runner);

    let err = engine
        .execute_batch(
            tasks(&["a", "b", "c"]),
            ExecutionMode::FirstSuccess,
            BatchOptions::default(),
        )
        .await
        .unwrap_err();

    match err {
        EngineError::AllBranchesFailed { failures, .. } => {
            assert_eq!(failures.len(), 3);
            let messages: Vec<_> = failures.iter().map(|f| f.error.message.clone()).collect();
            assert!(messages[0].contains("alpha"));
            assert!(messages[1].contains("beta"));
            assert!(messages[2].contains("gamma"));
        }
        other => panic!("expected AllBranchesFailed, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_majority_terminates_after_three_of_five() {
    let runner = ScriptedRunner::new()
        .script("a", Script::ok(10, json!(1)))
        .script("b", Script::fail(20, "flaky"))
        .script("c", Script::ok(30, json!(3)))
        .script("d", Script::ok(400, json!(4)))
        .script("e", Script::ok(800, json!(5)));
    let engine = engine(runner);

    let report = engine
        .execute_batch(
            tasks(&["a", "b", "c", "d", "e"]),
            ExecutionMode::Majority,
            BatchOptions::default(),
        )
        .await
        .unwrap();

    let statuses: Vec<_> = report.results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            BranchOutcome::Success,
            BranchOutcome::Failed,
            BranchOutcome::Success,
            BranchOutcome::Cancelled,
            BranchOutcome::Cancelled,
        ]
    );
    assert_eq!(report.termination, TerminationCause::PolicySatisfied);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_bound_queues_excess_branches() {
    let mut runner = ScriptedRunner::new();
    let names = ["t1", "t2", "t3", "t4", "t5", "t6"];
    for name in names {
        runner = runner.script(name, Script::ok(10, json!(name)));
    }
    let engine = engine(runner.clone());

    let options = BatchOptions {
        max_concurrency: Some(2),
        ..Default::default()
    };
    let report = engine
        .execute_batch(tasks(&names), ExecutionMode::All, options)
        .await
        .unwrap();

    assert_eq!(report.successes().count(), 6);
    assert_eq!(runner.max_in_flight(), 2);
    // slots are granted in submission order
    assert_eq!(runner.invoked(), names.to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_batch_timeout_forces_termination() {
    let runner = ScriptedRunner::new()
        .script("quick", Script::ok(10, json!("done")))
        .script("stuck", Script::ok(60_000, json!("never")));
    let engine = engine(runner);

    let options = BatchOptions {
        batch_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let report = engine
        .execute_batch(tasks(&["quick", "stuck"]), ExecutionMode::All, options)
        .await
        .unwrap();

    assert_eq!(report.termination, TerminationCause::BatchTimeout);
    assert_eq!(report.verdict(), BatchVerdict::ForcedTermination(TerminationCause::BatchTimeout));
    assert_eq!(report.results[0].status, BranchOutcome::Success);
    assert_eq!(report.results[1].status, BranchOutcome::TimedOut);
    assert_eq!(
        report.results[1].error.as_ref().unwrap().kind,
        BranchErrorKind::BatchTimeout
    );
    assert!(matches!(
        report.into_result(),
        Err(EngineError::BatchTimeout { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_branch_timeout_is_distinct_from_failure() {
    let runner = ScriptedRunner::new()
        .script("ok", Script::ok(10, json!(1)))
        .script("slow", Script::ok(5_000, json!(2)));
    let engine = engine(runner);

    let batch = vec![
        BranchTask::new("ok", "ok", json!(null)),
        BranchTask::new("slow", "slow", json!(null)).with_timeout(Duration::from_millis(100)),
    ];
    let report = engine
        .execute_batch(batch, ExecutionMode::All, BatchOptions::default())
        .await
        .unwrap();

    assert_eq!(report.termination, TerminationCause::PolicySatisfied);
    let slow = &report.results[1];
    assert_eq!(slow.status, BranchOutcome::TimedOut);
    assert_eq!(slow.error.as_ref().unwrap().kind, BranchErrorKind::Timeout);
    assert_eq!(report.verdict(), BatchVerdict::PartialFailure);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_batch_cancels_open_branches() {
    let runner = ScriptedRunner::new()
        .script("a", Script::ok(10, json!(1)))
        .script("b", Script::ok(10_000, json!(2)))
        .script("c", Script::ok(10_000, json!(3)));
    let engine = engine(runner.clone());

    let pending = engine
        .submit_batch(BatchRequest::new(tasks(&["a", "b", "c"]), ExecutionMode::All))
        .unwrap();
    let batch_id = pending.batch_id();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.cancel_batch(batch_id).unwrap());
    assert!(!engine.cancel_batch(batch_id).unwrap());

    let report = pending.wait().await.unwrap();
    assert_eq!(report.termination, TerminationCause::Cancelled);
    assert_eq!(report.results[0].status, BranchOutcome::Success);
    for result in &report.results[1..] {
        assert_eq!(result.status, BranchOutcome::Cancelled);
        assert_eq!(result.cancel_reason, Some(CancelReason::BatchCancelled));
    }
    assert!(matches!(report.into_result(), Err(EngineError::BatchCancelled(_))));

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(runner.cancelled(), vec!["b".to_string(), "c".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_parent_token_cancels_nested_batch() {
    let runner = ScriptedRunner::new()
        .script("a", Script::ok(10_000, json!(1)))
        .script("b", Script::ok(10_000, json!(2)));
    let engine = engine(runner);
    let parent = CancellationToken::new();

    let pending = engine
        .submit_batch(
            BatchRequest::new(tasks(&["a", "b"]), ExecutionMode::All)
                .with_parent_token(parent.clone()),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    parent.cancel();

    let report = pending.wait().await.unwrap();
    assert_eq!(report.termination, TerminationCause::Cancelled);
    assert!(report.results.iter().all(|r| r.status == BranchOutcome::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_runner_fails_only_its_branch() {
    let runner = ScriptedRunner::new()
        .script("good", Script::ok(10, json!("fine")))
        .script("bad", Script::panic(5))
        .script("also_good", Script::ok(20, json!("fine too")));
    let engine = engine(runner);

    let report = engine
        .execute_batch(
            tasks(&["good", "bad", "also_good"]),
            ExecutionMode::All,
            BatchOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.results[0].status, BranchOutcome::Success);
    assert_eq!(report.results[1].status, BranchOutcome::Failed);
    assert_eq!(
        report.results[1].error.as_ref().unwrap().kind,
        BranchErrorKind::Panicked
    );
    assert_eq!(report.results[2].status, BranchOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_late_result_is_discarded_and_reported() {
    let runner = ScriptedRunner::new()
        .script("fast", Script::ok(10, json!("winner")))
        .script("stubborn", Script::ok(200, json!("late")).ignoring_cancel());
    let engine = engine(runner);
    let mut events = engine.subscribe();

    let report = engine
        .execute_batch(tasks(&["fast", "stubborn"]), ExecutionMode::Any, BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(report.results[1].status, BranchOutcome::Cancelled);

    let late = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(EngineEvent::LateResultDiscarded { branch_id, status, .. }) =
                events.recv().await
            {
                return (branch_id, status);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(late.0.as_str(), "stubborn");
    assert_eq!(late.1, BranchOutcome::Success);

    // the terminal record is unchanged
    let snapshot = engine.get_batch_status(report.batch_id).await.unwrap();
    assert_eq!(snapshot.count(BranchOutcome::Cancelled), 1);
    assert_eq!(snapshot.count(BranchOutcome::Success), 1);
}

#[tokio::test(start_paused = true)]
async fn test_status_falls_back_to_repository_after_eviction() {
    let runner = ScriptedRunner::new().script("a", Script::ok(10, json!(1)));
    let engine = engine(runner);

    let report = engine
        .execute_batch(tasks(&["a"]), ExecutionMode::All, BatchOptions::default())
        .await
        .unwrap();

    // consumed by the caller and persisted by the supervisor
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(engine.batch_status(report.batch_id).is_none());

    let snapshot = engine.get_batch_status(report.batch_id).await.unwrap();
    assert!(snapshot.terminal);
    assert_eq!(snapshot.termination, Some(TerminationCause::PolicySatisfied));
}

#[tokio::test(start_paused = true)]
async fn test_wait_after_eviction_reads_the_persisted_batch() {
    let runner = ScriptedRunner::new()
        .script("a", Script::ok(10, json!("A")))
        .script("b", Script::fail(20, "boom"));
    let engine = engine(runner);

    let pending = engine
        .submit_batch(BatchRequest::new(tasks(&["a", "b"]), ExecutionMode::All))
        .unwrap();
    let batch_id = pending.batch_id();

    // sealed and persisted, then dropped from the live store before anyone waited
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.store().evict(batch_id));

    let report = pending.wait().await.unwrap();
    assert_eq!(report.batch_id, batch_id);
    assert_eq!(ids(&report.results), vec!["a", "b"]);
    assert_eq!(report.termination, TerminationCause::PolicySatisfied);
    assert_eq!(report.verdict(), BatchVerdict::PartialFailure);
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_branch_timeout_never_fires() {
    let runner = ScriptedRunner::new()
        .script("a", Script::ok(30, json!(1)))
        .script("b", Script::ok(60, json!(2)));
    let engine = engine(runner);

    let batch: Vec<BranchTask> = tasks(&["a", "b"])
        .into_iter()
        .map(|task| task.with_timeout(Duration::MAX))
        .collect();
    let pending = engine
        .submit_batch(BatchRequest::new(batch, ExecutionMode::All).with_timeout(Duration::MAX))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    let swept = engine.store().sweep_timeouts(tokio::time::Instant::now());
    assert!(swept.is_empty());

    let report = pending.wait().await.unwrap();
    assert!(report.results.iter().all(|r| r.status == BranchOutcome::Success));
    assert_eq!(report.verdict(), BatchVerdict::AllSucceeded);
}

#[tokio::test(start_paused = true)]
async fn test_engine_defaults_come_from_config() {
    let runner = ScriptedRunner::new().script("slow", Script::ok(10_000, json!(1)));
    let mut config = common::config();
    config.spec.executor.default_branch_timeout = Some(Duration::from_millis(100));
    let engine = engine_with(config, runner);

    let report = engine
        .execute_batch(tasks(&["slow"]), ExecutionMode::All, BatchOptions::default())
        .await
        .unwrap();
    assert_eq!(report.results[0].status, BranchOutcome::TimedOut);
}

#[tokio::test]
async fn test_invalid_batches_are_rejected_before_execution() {
    let runner = ScriptedRunner::new().script("a", Script::ok(1, json!(1)));
    let engine = engine(runner.clone());

    let empty = engine
        .execute_batch(vec![], ExecutionMode::All, BatchOptions::default())
        .await;
    assert!(matches!(empty, Err(EngineError::InvalidBatch(_))));

    let zero = engine
        .execute_batch(
            tasks(&["a"]),
            ExecutionMode::All,
            BatchOptions {
                max_concurrency: Some(0),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(zero, Err(EngineError::InvalidBatch(_))));

    let duplicate = engine
        .execute_batch(tasks(&["a", "a"]), ExecutionMode::All, BatchOptions::default())
        .await;
    assert!(matches!(duplicate, Err(EngineError::InvalidBatch(_))));

    assert!(runner.invoked().is_empty());
    assert!(engine.store().is_empty());
}
