// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Integration tests for deadlock detection, resolution and the timeout sweep

mod common;

use aegis_parallel_core::domain::batch::{BatchId, ExecutionMode};
use aegis_parallel_core::domain::branch::{
    BranchErrorKind, BranchId, BranchOutcome, BranchTask, CancelReason,
};
use aegis_parallel_core::domain::errors::EngineError;
use aegis_parallel_core::domain::events::EngineEvent;
use aegis_parallel_core::domain::gateway::{GatewayPairSpec, JoinStatus};
use aegis_parallel_core::domain::wait_graph::{DeadlockPolicy, WaitEdge, WaitNodeId};
use aegis_parallel_core::ConcurrencyEngine;
use common::{engine, engine_with, Script, ScriptedRunner};
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn node(id: &str) -> WaitNodeId {
    WaitNodeId::new(id)
}

/// Register external waiters `ids[i] -> ids[i + 1]`, closing the ring.
fn ring(engine: &ConcurrencyEngine, ids: &[&str]) -> Vec<CancellationToken> {
    let tokens: Vec<_> = ids
        .iter()
        .map(|id| {
            let token = CancellationToken::new();
            engine.register_waiter(node(id), Some(token.clone()));
            token
        })
        .collect();
    for (i, id) in ids.iter().enumerate() {
        let next = ids[(i + 1) % ids.len()];
        engine.register_wait_edge(WaitEdge::new(*id, vec![node(next)]));
    }
    tokens
}

fn is_rotation(cycle: &[WaitNodeId], expected: &[&str]) -> bool {
    let expected: Vec<WaitNodeId> = expected.iter().map(|id| node(id)).collect();
    cycle.len() == expected.len()
        && (0..expected.len()).any(|shift| {
            cycle
                .iter()
                .enumerate()
                .all(|(i, n)| *n == expected[(i + shift) % expected.len()])
        })
}

fn engine_with_policy(runner: std::sync::Arc<ScriptedRunner>, policy: DeadlockPolicy) -> ConcurrencyEngine {
    let mut config = common::config();
    config.spec.deadlock_detector.policy = policy;
    engine_with(config, runner)
}

#[tokio::test]
async fn test_three_node_cycle_is_detected() {
    let engine = engine(ScriptedRunner::new());
    engine.register_wait_edge(WaitEdge::new("A", vec![node("B")]));
    engine.register_wait_edge(WaitEdge::new("B", vec![node("C")]));
    engine.register_wait_edge(WaitEdge::new("C", vec![node("A")]));

    let detected = engine.store().find_cycle().unwrap();
    assert!(is_rotation(&detected.cycle, &["A", "B", "C"]));
}

#[tokio::test]
async fn test_cycles_of_every_length_contain_exactly_their_nodes() {
    let names = ["n0", "n1", "n2", "n3", "n4", "n5"];
    for k in 2..=names.len() {
        let engine = engine(ScriptedRunner::new());
        ring(&engine, &names[..k]);
        // a tail hanging off the ring is not part of the cycle
        engine.register_wait_edge(WaitEdge::new("tail", vec![node("n0")]));

        let detected = engine.store().find_cycle().unwrap();
        let found: BTreeSet<_> = detected.cycle.iter().cloned().collect();
        let expected: BTreeSet<_> = names[..k].iter().map(|id| node(id)).collect();
        assert_eq!(detected.cycle.len(), k);
        assert_eq!(found, expected);
    }
}

#[tokio::test]
async fn test_acyclic_graphs_report_no_cycle() {
    let engine = engine(ScriptedRunner::new());
    // diamond
    engine.register_wait_edge(WaitEdge::new("A", vec![node("B"), node("C")]));
    engine.register_wait_edge(WaitEdge::new("B", vec![node("D")]));
    engine.register_wait_edge(WaitEdge::new("C", vec![node("D")]));
    // long chain
    for i in 0..50 {
        engine.register_wait_edge(WaitEdge::new(
            format!("chain-{i}").as_str(),
            vec![node(&format!("chain-{}", i + 1))],
        ));
    }

    assert!(engine.store().find_cycle().is_none());
    assert!(engine.scan_for_deadlocks().cycles.is_empty());
}

#[tokio::test]
async fn test_cancel_youngest_breaks_cycle_through_victim() {
    let engine = engine(ScriptedRunner::new());
    let tokens = ring(&engine, &["A", "B", "C"]);
    let mut events = engine.subscribe();

    let report = engine.scan_for_deadlocks();
    assert_eq!(report.cycles.len(), 1);
    assert_eq!(report.cycles[0].victims, vec![node("C")]);
    assert!(tokens[2].is_cancelled());
    assert!(!tokens[0].is_cancelled() && !tokens[1].is_cancelled());

    assert!(engine.store().find_cycle().is_none());
    assert!(engine.scan_for_deadlocks().cycles.is_empty());

    let names: Vec<_> = events.drain().into_iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["deadlock_detected", "deadlock_resolved"]);
}

#[tokio::test]
async fn test_cancel_oldest_and_cancel_all_policies() {
    let oldest = engine_with_policy(ScriptedRunner::new(), DeadlockPolicy::CancelOldest);
    let tokens = ring(&oldest, &["A", "B", "C"]);
    let report = oldest.scan_for_deadlocks();
    assert_eq!(report.cycles[0].victims, vec![node("A")]);
    assert!(tokens[0].is_cancelled());

    let all = engine_with_policy(ScriptedRunner::new(), DeadlockPolicy::CancelAll);
    let tokens = ring(&all, &["A", "B", "C"]);
    let report = all.scan_for_deadlocks();
    assert_eq!(report.cycles[0].victims.len(), 3);
    assert!(tokens.iter().all(|t| t.is_cancelled()));
    assert_eq!(all.store().wait_edge_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_branch_waiting_on_its_own_join_is_cancelled() {
    let runner = ScriptedRunner::new()
        .script("x", Script::ok(10_000, json!("x")))
        .script("y", Script::ok(50, json!("y")));
    let engine = engine(runner.clone());
    let spec = GatewayPairSpec::new("fork", "join", ["x", "y"]);
    engine.register_gateway_pair(spec.clone()).unwrap();

    let batch_id = engine.fork(&spec, json!({})).unwrap();
    // let the branches start so they are registered as wait nodes
    tokio::time::sleep(Duration::from_millis(1)).await;
    engine.register_wait_edge(WaitEdge::new(
        WaitNodeId::branch(batch_id, &BranchId::new("x")),
        vec![WaitNodeId::join(&spec.join_id)],
    ));

    let report = engine.scan_for_deadlocks();
    assert_eq!(report.cycles.len(), 1);
    assert_eq!(
        report.cycles[0].victims,
        vec![WaitNodeId::branch(batch_id, &BranchId::new("x"))]
    );

    let outcome = engine.await_join(&spec).await.unwrap();
    assert_eq!(outcome.status, JoinStatus::PartialFailure);
    assert_eq!(outcome.merged, json!(["y"]));
    assert_eq!(outcome.failures[0].branch_id.as_str(), "x");
    assert_eq!(outcome.failures[0].error.kind, BranchErrorKind::Cancelled);

    let snapshot = engine.batch_status(batch_id).unwrap();
    let x = snapshot.branches[0].result.as_ref().unwrap();
    assert_eq!(x.cancel_reason, Some(CancelReason::DeadlockResolution));
    // siblings are not cancelled by deadlock resolution
    assert_eq!(snapshot.branches[1].result.as_ref().unwrap().status, BranchOutcome::Success);
    assert_eq!(runner.cancelled(), vec!["x".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_join_chosen_as_victim_fails_with_deadlock() {
    let runner = ScriptedRunner::new()
        .script("x", Script::ok(10_000, json!("x")))
        .script("y", Script::ok(10_000, json!("y")));
    let engine = engine_with_policy(runner, DeadlockPolicy::CancelOldest);
    let spec = GatewayPairSpec::new("fork", "join", ["x", "y"]);
    engine.register_gateway_pair(spec.clone()).unwrap();

    let batch_id = engine.fork(&spec, json!({})).unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    engine.register_wait_edge(WaitEdge::new(
        WaitNodeId::branch(batch_id, &BranchId::new("y")),
        vec![WaitNodeId::join(&spec.join_id)],
    ));

    let report = engine.scan_for_deadlocks();
    assert_eq!(report.cycles[0].victims, vec![WaitNodeId::join(&spec.join_id)]);

    match engine.await_join(&spec).await {
        Err(EngineError::Deadlock { node }) => assert_eq!(node, WaitNodeId::join(&spec.join_id)),
        other => panic!("expected a deadlock error, got {other:?}"),
    }
    // the fork's branches are untouched and can still be cancelled explicitly
    assert_eq!(engine.batch_status(batch_id).unwrap().running(), 2);
    assert!(engine.cancel_fork(&spec.join_id).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_times_out_overdue_branches() {
    let engine = engine(ScriptedRunner::new());
    let store = engine.store();
    let batch_id = BatchId::new();
    let branch = BranchId::new("stuck");
    store.create_batch(
        batch_id,
        vec![
            BranchTask::new("stuck", "nowhere", json!(null)),
            BranchTask::new("waiting", "nowhere", json!(null)),
        ],
        ExecutionMode::All,
        chrono::Utc::now() + chrono::Duration::hours(1),
        None,
    );
    store
        .mark_running(batch_id, &branch, Some(Duration::from_millis(50)))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(engine.scan_for_deadlocks().timed_out.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = engine.scan_for_deadlocks();
    assert_eq!(report.timed_out, vec![(batch_id, branch.clone())]);

    let snapshot = engine.batch_status(batch_id).unwrap();
    let result = snapshot.branches[0].result.as_ref().unwrap();
    assert_eq!(result.status, BranchOutcome::TimedOut);
    assert_eq!(result.error.as_ref().unwrap().kind, BranchErrorKind::Timeout);
    // the pending sibling has no clock yet
    assert!(snapshot.branches[1].result.is_none());
    assert!(branch_token_cancelled(&engine, batch_id, &branch));
}

fn branch_token_cancelled(engine: &ConcurrencyEngine, batch_id: BatchId, branch: &BranchId) -> bool {
    engine
        .store()
        .branch_token(batch_id, branch)
        .is_some_and(|t| t.is_cancelled())
}

#[tokio::test(start_paused = true)]
async fn test_retention_sweep_evicts_unconsumed_batches() {
    let runner = ScriptedRunner::new().script("a", Script::ok(10, json!(1)));
    let mut config = common::config();
    config.spec.executor.retention_window = Duration::from_secs(1);
    let engine = engine_with(config, runner);
    let spec = GatewayPairSpec::new("fork", "join", ["a"]);
    engine.register_gateway_pair(spec.clone()).unwrap();

    let batch_id = engine.fork(&spec, json!({})).unwrap();
    engine.await_join(&spec).await.unwrap();
    assert!(engine.batch_status(batch_id).is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let report = engine.scan_for_deadlocks();
    assert_eq!(report.evicted, vec![batch_id]);
    assert!(engine.batch_status(batch_id).is_none());
    assert!(engine.get_batch_status(batch_id).await.unwrap().terminal);
}

#[tokio::test(start_paused = true)]
async fn test_background_loop_resolves_deadlocks() {
    let mut config = common::config();
    config.spec.deadlock_detector.interval = Duration::from_millis(50);
    let engine = engine_with(config, ScriptedRunner::new());
    let mut events = engine.subscribe();

    engine.start();
    assert!(engine.detector().is_running());
    // idempotent
    assert!(!engine.detector().start());

    let tokens = ring(&engine, &["A", "B"]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(tokens[1].is_cancelled());

    let resolved = events
        .drain()
        .into_iter()
        .find(|e| matches!(e, EngineEvent::DeadlockResolved { .. }));
    match resolved {
        Some(EngineEvent::DeadlockResolved { victims, policy, .. }) => {
            assert_eq!(victims, vec![node("B")]);
            assert_eq!(policy, "cancel-youngest");
        }
        other => panic!("expected a resolution event, got {other:?}"),
    }

    engine.shutdown();
    assert!(!engine.detector().is_running());
    engine.shutdown();
}

#[tokio::test]
async fn test_disabled_detector_does_not_start() {
    let mut config = common::config();
    config.spec.deadlock_detector.enabled = false;
    let engine = engine_with(config, ScriptedRunner::new());

    engine.start();
    assert!(!engine.detector().is_running());
    // a manual scan still works
    assert!(engine.scan_for_deadlocks().is_empty());
}
