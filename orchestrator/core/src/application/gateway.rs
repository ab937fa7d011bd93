// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Parallel Gateway
//!
//! Fork splits one payload into a branch per target of a registered
//! [`GatewayPairSpec`] and returns immediately; Join waits on the fork's
//! result feed until the pair's [`JoinStrategy`](crate::domain::gateway::JoinStrategy)
//! is satisfied and merges the arrivals.
//!
//! A fork registers its join as a wait-graph node waiting on every spawned
//! branch, so the deadlock detector can see the synchronization point. The
//! join node is removed once the join returns, whatever the outcome.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Fork / Join use cases on top of the fork-join executor

use chrono::Utc;
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::branch_execution::sleep_until_opt;
use crate::application::fork_join::{BatchRequest, ForkJoinExecutor};
use crate::domain::batch::{BatchId, ExecutionMode};
use crate::domain::branch::{BranchResult, BranchTask};
use crate::domain::errors::EngineError;
use crate::domain::events::EngineEvent;
use crate::domain::gateway::{
    GatewayId, GatewayPairSpec, GatewayRegistry, JoinAccumulator, JoinOutcome, JoinStatus,
};
use crate::domain::wait_graph::{WaitEdge, WaitNodeId};
use crate::infrastructure::state_store::{ExecutionStateStore, WaitNodeOwner};

/// Wait for a pair's join strategy over a stream of arrivals and merge them.
///
/// Failed, timed-out and cancelled branches count as arrivals. Returns
/// `JoinTimeout` when the pair's timeout elapses first, `Deadlock` when
/// `cancel` fires (the join was chosen as a deadlock victim), and
/// `JoinIncomplete` when the stream ends before the strategy is satisfied.
pub async fn await_and_merge<S>(
    spec: &GatewayPairSpec,
    arrivals: S,
    cancel: &CancellationToken,
) -> Result<JoinOutcome, EngineError>
where
    S: Stream<Item = BranchResult> + Unpin,
{
    let mut arrivals = arrivals;
    let mut accumulator = JoinAccumulator::new(spec);
    let required = spec.required_arrivals();
    let deadline = spec.timeout.and_then(|t| Instant::now().checked_add(t));

    while !accumulator.is_satisfied() {
        tokio::select! {
            next = arrivals.next() => match next {
                Some(result) => {
                    if !accumulator.push(result) {
                        debug!(join_id = %spec.join_id, "Ignoring duplicate or foreign arrival");
                    }
                }
                None => {
                    return Err(EngineError::JoinIncomplete {
                        join_id: spec.join_id.clone(),
                        arrived: accumulator.arrived(),
                        required,
                    });
                }
            },
            _ = cancel.cancelled() => {
                return Err(EngineError::Deadlock {
                    node: WaitNodeId::join(&spec.join_id),
                });
            }
            _ = sleep_until_opt(deadline) => {
                return Err(EngineError::JoinTimeout {
                    join_id: spec.join_id.clone(),
                    arrived: accumulator.arrived(),
                    required,
                });
            }
        }
    }

    Ok(accumulator.finish())
}

struct ActiveFork {
    batch_id: BatchId,
    /// Taken by the first `await_join`.
    feed: Option<mpsc::UnboundedReceiver<BranchResult>>,
    join_token: CancellationToken,
    joined: bool,
}

pub struct ParallelGateway {
    executor: Arc<ForkJoinExecutor>,
    store: Arc<ExecutionStateStore>,
    registry: RwLock<GatewayRegistry>,
    /// Latest fork per join id.
    forks: Mutex<HashMap<GatewayId, ActiveFork>>,
}

impl ParallelGateway {
    pub fn new(executor: Arc<ForkJoinExecutor>, store: Arc<ExecutionStateStore>) -> Self {
        Self {
            executor,
            store,
            registry: RwLock::new(GatewayRegistry::new()),
            forks: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and register a Fork/Join pair. Pairing errors are reported
    /// as `InvalidBatch` and leave the registry unchanged.
    pub fn register_gateway_pair(&self, spec: GatewayPairSpec) -> Result<(), EngineError> {
        let join_id = spec.join_id.clone();
        let fork_id = spec.fork_id.clone();
        self.registry.write().register(spec)?;
        info!(fork_id = %fork_id, join_id = %join_id, "Gateway pair registered");
        Ok(())
    }

    pub fn registered_pair(&self, join_id: &GatewayId) -> Option<GatewayPairSpec> {
        self.registry.read().by_join(join_id).cloned()
    }

    fn ensure_registered(&self, spec: &GatewayPairSpec) -> Result<(), EngineError> {
        let registry = self.registry.read();
        match registry.by_join(&spec.join_id) {
            Some(registered) if registered.fork_id == spec.fork_id => Ok(()),
            _ => Err(EngineError::GatewayNotFound(spec.fork_id.clone())),
        }
    }

    /// Dispatch `payload` to every branch target and return without waiting.
    pub fn fork(
        &self,
        spec: &GatewayPairSpec,
        payload: serde_json::Value,
    ) -> Result<BatchId, EngineError> {
        self.ensure_registered(spec)?;

        let mut forks = self.forks.lock();
        if forks.get(&spec.join_id).is_some_and(|f| !f.joined) {
            return Err(EngineError::GatewayBusy(spec.join_id.clone()));
        }

        let tasks = spec
            .branch_targets
            .iter()
            .map(|target| {
                let task = BranchTask::new(target.as_str(), target.as_str(), payload.clone());
                match spec.branch_timeout {
                    Some(timeout) => task.with_timeout(timeout),
                    None => task,
                }
            })
            .collect();
        let mut request = BatchRequest::new(tasks, ExecutionMode::All)
            .with_max_concurrency(spec.branch_targets.len());
        if let Some(timeout) = spec.timeout {
            request = request.with_timeout(timeout);
        }

        let pending = self.executor.submit_batch(request)?;
        let batch_id = pending.batch_id();
        let feed = self.store.take_result_feed(batch_id);

        let join_node = WaitNodeId::join(&spec.join_id);
        let join_token = CancellationToken::new();
        self.store
            .register_node(join_node.clone(), Some(join_token.clone()), WaitNodeOwner::Join);
        self.store.add_wait_edge(WaitEdge::new(
            join_node,
            spec.branch_ids()
                .iter()
                .map(|branch_id| WaitNodeId::branch(batch_id, branch_id))
                .collect(),
        ));

        forks.insert(
            spec.join_id.clone(),
            ActiveFork {
                batch_id,
                feed,
                join_token,
                joined: false,
            },
        );
        drop(forks);

        info!(
            fork_id = %spec.fork_id,
            join_id = %spec.join_id,
            batch_id = %batch_id,
            branch_count = spec.branch_targets.len(),
            "Fork dispatched"
        );
        self.store.event_bus().publish(EngineEvent::GatewayForked {
            fork_id: spec.fork_id.clone(),
            join_id: spec.join_id.clone(),
            batch_id,
            branch_count: spec.branch_targets.len(),
            forked_at: Utc::now(),
        });

        Ok(batch_id)
    }

    /// Wait on the latest fork of this pair and merge its arrivals.
    pub async fn await_join(&self, spec: &GatewayPairSpec) -> Result<JoinOutcome, EngineError> {
        self.ensure_registered(spec)?;

        let (batch_id, feed, join_token) = {
            let mut forks = self.forks.lock();
            let fork = forks
                .get_mut(&spec.join_id)
                .filter(|f| !f.joined)
                .ok_or_else(|| EngineError::NoActiveFork(spec.join_id.clone()))?;
            let feed = fork
                .feed
                .take()
                .ok_or_else(|| EngineError::GatewayBusy(spec.join_id.clone()))?;
            (fork.batch_id, feed, fork.join_token.clone())
        };

        let result =
            await_and_merge(spec, UnboundedReceiverStream::new(feed), &join_token).await;

        self.store.unregister_node(&WaitNodeId::join(&spec.join_id));
        if let Some(fork) = self.forks.lock().get_mut(&spec.join_id) {
            if fork.batch_id == batch_id {
                fork.joined = true;
            }
        }

        match &result {
            Ok(outcome) => {
                match outcome.status {
                    JoinStatus::Complete => info!(
                        join_id = %spec.join_id,
                        batch_id = %batch_id,
                        arrived = outcome.arrived.len(),
                        "Join completed"
                    ),
                    JoinStatus::PartialFailure => warn!(
                        join_id = %spec.join_id,
                        batch_id = %batch_id,
                        failures = outcome.failures.len(),
                        "Join completed with failed branches"
                    ),
                }
                metrics::counter!(
                    "aegis_parallel_joins_total",
                    "status" => join_status_label(outcome.status)
                )
                .increment(1);
                self.store.event_bus().publish(EngineEvent::JoinCompleted {
                    join_id: spec.join_id.clone(),
                    batch_id,
                    status: outcome.status,
                    arrived: outcome.arrived.len(),
                    completed_at: Utc::now(),
                });
            }
            Err(e) => {
                warn!(join_id = %spec.join_id, batch_id = %batch_id, "Join failed: {}", e);
                metrics::counter!("aegis_parallel_joins_total", "status" => "error").increment(1);
            }
        }
        result
    }

    /// Cancel the branches of the pair's latest fork, e.g. the ones still
    /// running after a partial join. Returns `false` when nothing was left
    /// to cancel.
    pub fn cancel_fork(&self, join_id: &GatewayId) -> Result<bool, EngineError> {
        let batch_id = self
            .forks
            .lock()
            .get(join_id)
            .map(|f| f.batch_id)
            .ok_or_else(|| EngineError::NoActiveFork(join_id.clone()))?;
        match self.executor.cancel_batch(batch_id) {
            Ok(cancelled) => Ok(cancelled),
            // already evicted, so already terminal
            Err(EngineError::BatchNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Batch id of the pair's latest fork.
    pub fn fork_batch(&self, join_id: &GatewayId) -> Option<BatchId> {
        self.forks.lock().get(join_id).map(|f| f.batch_id)
    }
}

fn join_status_label(status: JoinStatus) -> &'static str {
    match status {
        JoinStatus::Complete => "complete",
        JoinStatus::PartialFailure => "partial_failure",
    }
}
