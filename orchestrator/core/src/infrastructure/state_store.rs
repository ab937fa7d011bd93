// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Execution State Store
//!
//! Single source of truth for live batches and the wait-for graph. Every
//! writer (branch tasks, the batch supervisor, the deadlock detector's sweep,
//! explicit cancellation) goes through [`ExecutionStateStore::record_result`]
//! or one of the sealing operations, all of which take the batch lock. The
//! batch aggregate refuses writes to terminal branches and terminal batches,
//! so exactly one component ever declares a batch terminal.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Guarded state transitions, result feeds, cancellation
//!   tokens, wait registry, timeout sweep and retention
//!
//! Lock order: the batch map lock is released before any batch lock is
//! taken, and the wait registry lock is never held together with a batch
//! lock.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::batch::{
    ApplyRejected, BatchId, BatchReport, BatchSnapshot, ExecutionBatch, ExecutionMode,
    TerminationCause,
};
use crate::domain::branch::{
    BranchError, BranchErrorKind, BranchId, BranchOutcome, BranchResult, BranchStatus,
    BranchTask, CancelReason,
};
use crate::domain::events::EngineEvent;
use crate::domain::wait_graph::{VictimCandidate, WaitEdge, WaitForGraph, WaitNodeId};
use crate::infrastructure::event_bus::EventBus;

/// What happened to a reported result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Applied; `sealed` is set when this result made the batch terminal.
    Accepted { sealed: Option<TerminationCause> },
    /// The branch or batch was already terminal. Logged and dropped.
    Discarded,
    UnknownBatch,
}

#[derive(Debug, Clone, Copy)]
struct BranchClock {
    started: Instant,
    timeout: Option<Duration>,
}

struct BatchState {
    batch: ExecutionBatch,
    clocks: HashMap<BranchId, BranchClock>,
    sealed_at: Option<Instant>,
    consumed: bool,
    persisted: bool,
}

struct BatchEntry {
    state: Mutex<BatchState>,
    token: CancellationToken,
    branch_tokens: HashMap<BranchId, CancellationToken>,
    terminal_tx: watch::Sender<bool>,
    feed_tx: mpsc::UnboundedSender<BranchResult>,
    feed_rx: Mutex<Option<mpsc::UnboundedReceiver<BranchResult>>>,
}

/// Who owns a wait-graph node, and so how it is cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitNodeOwner {
    Branch { batch_id: BatchId, branch_id: BranchId },
    Join,
    External,
}

#[derive(Debug, Clone)]
struct WaitNodeInfo {
    started_at: chrono::DateTime<Utc>,
    token: Option<CancellationToken>,
    owner: WaitNodeOwner,
}

#[derive(Default)]
struct WaitRegistry {
    graph: WaitForGraph,
    nodes: HashMap<WaitNodeId, WaitNodeInfo>,
}

/// A cycle found by [`ExecutionStateStore::find_cycle`] together with the
/// participants that can be cancelled.
#[derive(Debug, Clone)]
pub struct DetectedCycle {
    pub cycle: Vec<WaitNodeId>,
    pub candidates: Vec<VictimCandidate>,
}

pub struct ExecutionStateStore {
    batches: RwLock<HashMap<BatchId, Arc<BatchEntry>>>,
    waits: Mutex<WaitRegistry>,
    event_bus: EventBus,
}

impl ExecutionStateStore {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            batches: RwLock::new(HashMap::new()),
            waits: Mutex::new(WaitRegistry::default()),
            event_bus,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    fn entry(&self, batch_id: BatchId) -> Option<Arc<BatchEntry>> {
        self.batches.read().get(&batch_id).cloned()
    }

    /// Register a new batch with every branch `Pending`.
    ///
    /// Returns the batch-level cancellation token; branch tokens are children
    /// of it.
    pub fn create_batch(
        &self,
        batch_id: BatchId,
        tasks: Vec<BranchTask>,
        mode: ExecutionMode,
        deadline: chrono::DateTime<Utc>,
        parent: Option<&CancellationToken>,
    ) -> CancellationToken {
        let token = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let branch_tokens = tasks
            .iter()
            .map(|t| (t.id.clone(), token.child_token()))
            .collect();
        let (terminal_tx, _) = watch::channel(false);
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();

        let batch = ExecutionBatch::new(batch_id, tasks, mode, Utc::now(), deadline);
        let entry = BatchEntry {
            state: Mutex::new(BatchState {
                batch,
                clocks: HashMap::new(),
                sealed_at: None,
                consumed: false,
                persisted: false,
            }),
            token: token.clone(),
            branch_tokens,
            terminal_tx,
            feed_tx,
            feed_rx: Mutex::new(Some(feed_rx)),
        };
        self.batches.write().insert(batch_id, Arc::new(entry));
        token
    }

    pub fn contains(&self, batch_id: BatchId) -> bool {
        self.batches.read().contains_key(&batch_id)
    }

    pub fn len(&self) -> usize {
        self.batches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.read().is_empty()
    }

    pub fn batch_token(&self, batch_id: BatchId) -> Option<CancellationToken> {
        self.entry(batch_id).map(|e| e.token.clone())
    }

    pub fn branch_token(&self, batch_id: BatchId, branch_id: &BranchId) -> Option<CancellationToken> {
        self.entry(batch_id)
            .and_then(|e| e.branch_tokens.get(branch_id).cloned())
    }

    /// Receiver flipping to `true` once the batch is terminal.
    pub fn subscribe_terminal(&self, batch_id: BatchId) -> Option<watch::Receiver<bool>> {
        self.entry(batch_id).map(|e| e.terminal_tx.subscribe())
    }

    /// Take the batch's result feed. Only the first caller gets it.
    pub fn take_result_feed(
        &self,
        batch_id: BatchId,
    ) -> Option<mpsc::UnboundedReceiver<BranchResult>> {
        self.entry(batch_id).and_then(|e| e.feed_rx.lock().take())
    }

    pub fn snapshot(&self, batch_id: BatchId) -> Option<BatchSnapshot> {
        self.entry(batch_id).map(|e| e.state.lock().batch.snapshot())
    }

    /// Report of a terminal batch; `None` while it is still running.
    pub fn report(&self, batch_id: BatchId) -> Option<BatchReport> {
        let entry = self.entry(batch_id)?;
        let state = entry.state.lock();
        if !state.batch.terminal {
            return None;
        }
        let report = BatchReport::from_batch(&state.batch);
        Some(report)
    }

    pub fn is_terminal(&self, batch_id: BatchId) -> Option<bool> {
        self.entry(batch_id).map(|e| e.state.lock().batch.terminal)
    }

    /// `Pending → Running`. Starts the branch clock and registers the branch
    /// as a wait-graph node.
    pub fn mark_running(
        &self,
        batch_id: BatchId,
        branch_id: &BranchId,
        timeout: Option<Duration>,
    ) -> Result<(), ApplyRejected> {
        let entry = self.entry(batch_id).ok_or(ApplyRejected::UnknownBranch)?;
        let now = Utc::now();
        let executor_ref = {
            let mut state = entry.state.lock();
            state.batch.mark_running(branch_id, now)?;
            state.clocks.insert(
                branch_id.clone(),
                BranchClock {
                    started: Instant::now(),
                    timeout,
                },
            );
            state
                .batch
                .branch(branch_id)
                .map(|b| b.task.executor_ref.to_string())
                .unwrap_or_default()
        };

        self.register_node(
            WaitNodeId::branch(batch_id, branch_id),
            entry.branch_tokens.get(branch_id).cloned(),
            WaitNodeOwner::Branch {
                batch_id,
                branch_id: branch_id.clone(),
            },
        );

        debug!(batch_id = %batch_id, branch_id = %branch_id, "Branch running");
        self.event_bus.publish(EngineEvent::BranchStarted {
            batch_id,
            branch_id: branch_id.clone(),
            executor_ref,
            started_at: now,
        });
        Ok(())
    }

    /// Apply a branch result. The first terminal write for a branch wins;
    /// results for terminal branches or terminal batches are discarded and
    /// logged.
    pub fn record_result(&self, batch_id: BatchId, result: BranchResult) -> RecordOutcome {
        let Some(entry) = self.entry(batch_id) else {
            warn!(
                batch_id = %batch_id,
                branch_id = %result.branch_id,
                "Discarding result for unknown or evicted batch"
            );
            metrics::counter!("aegis_parallel_late_results_total").increment(1);
            return RecordOutcome::UnknownBatch;
        };

        let applied = {
            let mut state = entry.state.lock();
            let applied = state.batch.apply_result(result.clone(), Utc::now());
            if matches!(&applied, Ok(a) if a.sealed.is_some()) {
                state.sealed_at = Some(Instant::now());
            }
            applied
        };

        match applied {
            Ok(applied) => {
                let mut accepted = Vec::with_capacity(1 + applied.closed.len());
                accepted.push(result);
                accepted.extend(applied.closed);
                self.after_transition(batch_id, &entry, accepted, applied.sealed);
                RecordOutcome::Accepted {
                    sealed: applied.sealed,
                }
            }
            Err(ApplyRejected::UnknownBranch) => {
                warn!(
                    batch_id = %batch_id,
                    branch_id = %result.branch_id,
                    "Discarding result for a branch not in this batch"
                );
                RecordOutcome::Discarded
            }
            Err(rejection) => {
                warn!(
                    batch_id = %batch_id,
                    branch_id = %result.branch_id,
                    status = result.status.as_str(),
                    reason = ?rejection,
                    "Discarding late branch result"
                );
                metrics::counter!("aegis_parallel_late_results_total").increment(1);
                self.event_bus.publish(EngineEvent::LateResultDiscarded {
                    batch_id,
                    branch_id: result.branch_id,
                    status: result.status,
                    discarded_at: Utc::now(),
                });
                RecordOutcome::Discarded
            }
        }
    }

    /// Force the batch terminal because its deadline elapsed.
    pub fn expire_batch(&self, batch_id: BatchId) -> bool {
        let Some(entry) = self.entry(batch_id) else {
            return false;
        };
        let closed = {
            let mut state = entry.state.lock();
            let closed = state.batch.expire(Utc::now());
            if closed.is_some() {
                state.sealed_at = Some(Instant::now());
            }
            closed
        };
        let Some(closed) = closed else {
            return false;
        };

        warn!(
            batch_id = %batch_id,
            open_branches = closed.len(),
            "Batch exceeded its deadline, forcing termination"
        );
        self.event_bus.publish(EngineEvent::BatchTimedOut {
            batch_id,
            open_branches: closed.len(),
            timed_out_at: Utc::now(),
        });
        self.after_transition(batch_id, &entry, closed, Some(TerminationCause::BatchTimeout));
        true
    }

    /// Cancel the whole batch. Open branches become `Cancelled`.
    pub fn cancel_batch(&self, batch_id: BatchId) -> bool {
        let Some(entry) = self.entry(batch_id) else {
            return false;
        };
        let closed = {
            let mut state = entry.state.lock();
            let closed = state.batch.cancel(Utc::now());
            if closed.is_some() {
                state.sealed_at = Some(Instant::now());
            }
            closed
        };
        let Some(closed) = closed else {
            return false;
        };

        info!(batch_id = %batch_id, open_branches = closed.len(), "Batch cancelled");
        self.event_bus.publish(EngineEvent::BatchCancelled {
            batch_id,
            reason: CancelReason::BatchCancelled,
            cancelled_at: Utc::now(),
        });
        self.after_transition(batch_id, &entry, closed, Some(TerminationCause::Cancelled));
        true
    }

    /// Cancel one branch with the given reason and signal its token.
    pub fn cancel_branch(
        &self,
        batch_id: BatchId,
        branch_id: &BranchId,
        reason: CancelReason,
    ) -> RecordOutcome {
        let elapsed = self.elapsed_millis(batch_id, branch_id);
        let outcome =
            self.record_result(batch_id, BranchResult::cancelled(branch_id.clone(), reason, elapsed));
        if let Some(token) = self.branch_token(batch_id, branch_id) {
            token.cancel();
        }
        outcome
    }

    /// Record a per-branch timeout and signal the branch to stop.
    pub fn time_out_branch(
        &self,
        batch_id: BatchId,
        branch_id: &BranchId,
        timeout: Duration,
    ) -> RecordOutcome {
        let elapsed = self.elapsed_millis(batch_id, branch_id);
        let result = BranchResult::timed_out(
            branch_id.clone(),
            BranchError::new(
                BranchErrorKind::Timeout,
                format!("branch exceeded its timeout of {:?}", timeout),
            ),
            elapsed,
        );
        let outcome = self.record_result(batch_id, result);
        if let Some(token) = self.branch_token(batch_id, branch_id) {
            token.cancel();
        }
        if matches!(outcome, RecordOutcome::Accepted { .. }) {
            info!(batch_id = %batch_id, branch_id = %branch_id, ?timeout, "Branch timed out");
            metrics::counter!("aegis_parallel_branch_timeouts_total").increment(1);
            self.event_bus.publish(EngineEvent::BranchTimedOut {
                batch_id,
                branch_id: branch_id.clone(),
                timeout_ms: timeout.as_millis() as u64,
                timed_out_at: Utc::now(),
            });
        }
        outcome
    }

    fn elapsed_millis(&self, batch_id: BatchId, branch_id: &BranchId) -> u64 {
        self.entry(batch_id)
            .and_then(|e| e.state.lock().clocks.get(branch_id).copied())
            .map(|c| c.started.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    /// Force every running branch whose clock passed its timeout to
    /// `TimedOut`. Returns the branches that were timed out by this sweep.
    pub fn sweep_timeouts(&self, now: Instant) -> Vec<(BatchId, BranchId)> {
        let entries: Vec<(BatchId, Arc<BatchEntry>)> = self
            .batches
            .read()
            .iter()
            .map(|(id, e)| (*id, e.clone()))
            .collect();

        let mut expired = Vec::new();
        for (batch_id, entry) in entries {
            let state = entry.state.lock();
            if state.batch.terminal {
                continue;
            }
            for branch in state.batch.branches() {
                if branch.status != BranchStatus::Running {
                    continue;
                }
                let Some(clock) = state.clocks.get(branch.id()) else {
                    continue;
                };
                let Some(timeout) = clock.timeout else {
                    continue;
                };
                let Some(deadline) = clock.started.checked_add(timeout) else {
                    continue;
                };
                if deadline <= now {
                    expired.push((batch_id, branch.id().clone(), timeout));
                }
            }
        }

        expired
            .into_iter()
            .filter_map(|(batch_id, branch_id, timeout)| {
                match self.time_out_branch(batch_id, &branch_id, timeout) {
                    RecordOutcome::Accepted { .. } => Some((batch_id, branch_id)),
                    _ => None,
                }
            })
            .collect()
    }

    /// Shared bookkeeping after results were applied.
    fn after_transition(
        &self,
        batch_id: BatchId,
        entry: &BatchEntry,
        accepted: Vec<BranchResult>,
        sealed: Option<TerminationCause>,
    ) {
        let completed_at = Utc::now();
        for result in &accepted {
            metrics::counter!(
                "aegis_parallel_branch_results_total",
                "status" => result.status.as_str()
            )
            .increment(1);
            metrics::histogram!("aegis_parallel_branch_duration_ms")
                .record(result.duration_millis as f64);
            if let Some(error) = &result.error {
                debug!(
                    batch_id = %batch_id,
                    branch_id = %result.branch_id,
                    kind = ?error.kind,
                    "Branch failed: {}",
                    error.message
                );
            }
            self.event_bus.publish(EngineEvent::BranchCompleted {
                batch_id,
                branch_id: result.branch_id.clone(),
                status: result.status,
                duration_ms: result.duration_millis,
                completed_at,
            });
            // nobody listening is fine
            let _ = entry.feed_tx.send(result.clone());
            self.unregister_node(&WaitNodeId::branch(batch_id, &result.branch_id));
        }

        let Some(cause) = sealed else {
            return;
        };

        // Signal every still-running branch to stop.
        entry.token.cancel();
        entry.terminal_tx.send_replace(true);

        let snapshot = entry.state.lock().batch.snapshot();
        let succeeded = snapshot.count(BranchOutcome::Success);
        let cancelled = snapshot.count(BranchOutcome::Cancelled);
        let failed = snapshot.count(BranchOutcome::Failed) + snapshot.count(BranchOutcome::TimedOut);

        metrics::counter!(
            "aegis_parallel_batches_completed_total",
            "termination" => cause.as_str()
        )
        .increment(1);
        info!(
            batch_id = %batch_id,
            termination = cause.as_str(),
            succeeded,
            failed,
            cancelled,
            "Batch completed"
        );
        self.event_bus.publish(EngineEvent::BatchCompleted {
            batch_id,
            termination: cause,
            succeeded,
            failed,
            cancelled,
            completed_at,
        });
    }

    /// Mark the batch's report as delivered to its waiter. Returns `true`
    /// when the batch can be evicted now.
    pub fn mark_consumed(&self, batch_id: BatchId) -> bool {
        self.entry(batch_id)
            .map(|e| {
                let mut state = e.state.lock();
                state.consumed = true;
                state.persisted
            })
            .unwrap_or(false)
    }

    /// Mark the batch as saved to the repository. Returns `true` when the
    /// batch can be evicted now.
    pub fn mark_persisted(&self, batch_id: BatchId) -> bool {
        self.entry(batch_id)
            .map(|e| {
                let mut state = e.state.lock();
                state.persisted = true;
                state.consumed
            })
            .unwrap_or(false)
    }

    pub fn evict(&self, batch_id: BatchId) -> bool {
        let removed = self.batches.write().remove(&batch_id).is_some();
        if removed {
            debug!(batch_id = %batch_id, "Evicted batch from state store");
        }
        removed
    }

    /// Evict terminal batches sealed at least `retention` ago.
    pub fn evict_expired(&self, now: Instant, retention: Duration) -> Vec<BatchId> {
        let entries: Vec<(BatchId, Arc<BatchEntry>)> = self
            .batches
            .read()
            .iter()
            .map(|(id, e)| (*id, e.clone()))
            .collect();
        let stale: Vec<BatchId> = entries
            .into_iter()
            .filter(|(_, e)| {
                let sealed_at = e.state.lock().sealed_at;
                sealed_at
                    .and_then(|sealed| sealed.checked_add(retention))
                    .is_some_and(|expires| expires <= now)
            })
            .map(|(id, _)| id)
            .collect();
        stale.into_iter().filter(|id| self.evict(*id)).collect()
    }

    // ---- wait registry ----

    /// Register (or refresh) a node that may take part in wait edges.
    pub fn register_node(
        &self,
        node: WaitNodeId,
        token: Option<CancellationToken>,
        owner: WaitNodeOwner,
    ) {
        self.waits.lock().nodes.insert(
            node,
            WaitNodeInfo {
                started_at: Utc::now(),
                token,
                owner,
            },
        );
    }

    /// Drop a node and every edge touching it.
    pub fn unregister_node(&self, node: &WaitNodeId) {
        let mut waits = self.waits.lock();
        waits.nodes.remove(node);
        waits.graph.remove_node(node);
    }

    pub fn add_wait_edge(&self, edge: WaitEdge) {
        debug!(waiter = %edge.waiter, targets = edge.waits_for.len(), "Registering wait edge");
        self.waits.lock().graph.add_edge(edge);
    }

    pub fn remove_wait_edge(&self, waiter: &WaitNodeId, target: &WaitNodeId) {
        self.waits.lock().graph.remove_edge(waiter, target);
    }

    pub fn wait_edge_count(&self) -> usize {
        self.waits.lock().graph.edge_count()
    }

    /// Run cycle detection over the current graph.
    pub fn find_cycle(&self) -> Option<DetectedCycle> {
        self.find_cycle_skipping(&[])
    }

    /// Cycle detection ignoring the given `(waiter, target)` edges.
    pub fn find_cycle_skipping(&self, skipped: &[(WaitNodeId, WaitNodeId)]) -> Option<DetectedCycle> {
        let waits = self.waits.lock();
        let cycle = waits.graph.detect_cycle_skipping(skipped)?;
        let candidates = cycle
            .iter()
            .filter_map(|node| {
                let info = waits.nodes.get(node)?;
                info.token.as_ref()?;
                Some(VictimCandidate {
                    node: node.clone(),
                    started_at: info.started_at,
                    registration_seq: waits.graph.registration_seq(node).unwrap_or(u64::MAX),
                })
            })
            .collect();
        Some(DetectedCycle { cycle, candidates })
    }

    /// Cancel a wait-graph node chosen as a deadlock victim.
    ///
    /// Branch victims are recorded as `Cancelled(DeadlockResolution)`; joins
    /// and external waiters have their token cancelled. The node is removed
    /// from the graph either way.
    pub fn cancel_node(&self, node: &WaitNodeId) -> bool {
        let info = self.waits.lock().nodes.get(node).cloned();
        let Some(info) = info else {
            return false;
        };

        match &info.owner {
            WaitNodeOwner::Branch {
                batch_id,
                branch_id,
            } => {
                self.cancel_branch(*batch_id, branch_id, CancelReason::DeadlockResolution);
            }
            WaitNodeOwner::Join | WaitNodeOwner::External => {
                if let Some(token) = &info.token {
                    token.cancel();
                }
            }
        }
        self.unregister_node(node);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ExecutionStateStore {
        ExecutionStateStore::new(EventBus::new(64))
    }

    fn create(store: &ExecutionStateStore, n: usize, mode: ExecutionMode) -> BatchId {
        let batch_id = BatchId::new();
        let tasks = (0..n)
            .map(|i| BranchTask::new(format!("b{i}"), "node", json!(i)))
            .collect();
        store.create_batch(
            batch_id,
            tasks,
            mode,
            Utc::now() + chrono::Duration::seconds(60),
            None,
        );
        batch_id
    }

    fn b(id: &str) -> BranchId {
        BranchId::new(id)
    }

    #[tokio::test]
    async fn test_first_writer_wins_and_late_result_discarded() {
        let store = store();
        let mut events = store.event_bus().subscribe();
        let batch_id = create(&store, 2, ExecutionMode::Any);
        store.mark_running(batch_id, &b("b0"), None).unwrap();
        store.mark_running(batch_id, &b("b1"), None).unwrap();

        let first = store.record_result(batch_id, BranchResult::success(b("b0"), json!(1), 5));
        assert_eq!(
            first,
            RecordOutcome::Accepted {
                sealed: Some(TerminationCause::PolicySatisfied)
            }
        );

        let late = store.record_result(batch_id, BranchResult::success(b("b1"), json!(2), 9));
        assert_eq!(late, RecordOutcome::Discarded);

        let report = store.report(batch_id).unwrap();
        assert_eq!(report.decisive.unwrap().branch_id, b("b0"));
        assert_eq!(report.results[1].status, BranchOutcome::Cancelled);

        let names: Vec<&str> = events.drain().iter().map(|e| e.name()).collect();
        assert!(names.contains(&"batch_completed"));
        assert!(names.contains(&"late_result_discarded"));
    }

    #[tokio::test]
    async fn test_sealing_cancels_tokens_and_flips_terminal_flag() {
        let store = store();
        let batch_id = create(&store, 2, ExecutionMode::All);
        let branch_token = store.branch_token(batch_id, &b("b1")).unwrap();
        let mut terminal = store.subscribe_terminal(batch_id).unwrap();

        assert!(store.cancel_batch(batch_id));
        assert!(!store.cancel_batch(batch_id));
        assert!(branch_token.is_cancelled());
        assert!(*terminal.borrow_and_update());

        let snapshot = store.snapshot(batch_id).unwrap();
        assert_eq!(snapshot.termination, Some(TerminationCause::Cancelled));
        assert_eq!(snapshot.count(BranchOutcome::Cancelled), 2);
    }

    #[tokio::test]
    async fn test_result_feed_carries_every_accepted_result() {
        let store = store();
        let batch_id = create(&store, 3, ExecutionMode::Majority);
        let mut feed = store.take_result_feed(batch_id).unwrap();
        assert!(store.take_result_feed(batch_id).is_none());

        store.record_result(batch_id, BranchResult::success(b("b2"), json!(2), 1));
        store.record_result(batch_id, BranchResult::success(b("b0"), json!(0), 1));

        let order: Vec<BranchId> = (0..3).map(|_| feed.try_recv().unwrap().branch_id).collect();
        assert_eq!(order, vec![b("b2"), b("b0"), b("b1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_times_out_running_branches_only() {
        let store = store();
        let batch_id = create(&store, 2, ExecutionMode::All);
        store
            .mark_running(batch_id, &b("b0"), Some(Duration::from_millis(100)))
            .unwrap();

        assert!(store.sweep_timeouts(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_millis(150)).await;

        let swept = store.sweep_timeouts(Instant::now());
        assert_eq!(swept, vec![(batch_id, b("b0"))]);
        assert!(store.branch_token(batch_id, &b("b0")).unwrap().is_cancelled());

        let snapshot = store.snapshot(batch_id).unwrap();
        assert_eq!(snapshot.count(BranchOutcome::TimedOut), 1);
        assert_eq!(snapshot.pending(), 1);
        assert!(!snapshot.terminal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_batches_are_evicted_after_retention() {
        let store = store();
        let batch_id = create(&store, 1, ExecutionMode::All);
        let running = create(&store, 1, ExecutionMode::All);
        store.expire_batch(batch_id);

        assert!(store.evict_expired(Instant::now(), Duration::from_secs(10)).is_empty());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            store.evict_expired(Instant::now(), Duration::from_secs(10)),
            vec![batch_id]
        );
        assert!(store.contains(running));
        assert!(!store.contains(batch_id));
    }

    #[tokio::test]
    async fn test_consumed_and_persisted_gate_eviction() {
        let store = store();
        let batch_id = create(&store, 1, ExecutionMode::All);
        assert!(!store.mark_consumed(batch_id));
        assert!(store.mark_persisted(batch_id));
    }

    #[tokio::test]
    async fn test_cycle_candidates_and_branch_victim() {
        let store = store();
        let batch_id = create(&store, 2, ExecutionMode::All);
        store.mark_running(batch_id, &b("b0"), None).unwrap();
        store.mark_running(batch_id, &b("b1"), None).unwrap();
        let n0 = WaitNodeId::branch(batch_id, &b("b0"));
        let n1 = WaitNodeId::branch(batch_id, &b("b1"));
        store.add_wait_edge(WaitEdge::new(n0.clone(), vec![n1.clone()]));
        store.add_wait_edge(WaitEdge::new(n1.clone(), vec![n0.clone()]));

        let detected = store.find_cycle().unwrap();
        assert_eq!(detected.cycle.len(), 2);
        assert_eq!(detected.candidates.len(), 2);

        assert!(store.cancel_node(&n1));
        assert!(store.find_cycle().is_none());
        let snapshot = store.snapshot(batch_id).unwrap();
        let cancelled = snapshot.branches[1].result.clone().unwrap();
        assert_eq!(cancelled.cancel_reason, Some(CancelReason::DeadlockResolution));
    }
}
