// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Fork-Join Executor
//!
//! Runs a set of [`BranchTask`]s concurrently under a completion policy
//! ([`ExecutionMode`]) and a concurrency bound, returning a [`BatchReport`].
//!
//! Each submitted batch gets a supervisor task that owns the branch tasks'
//! `JoinSet`. The supervisor enforces the batch deadline (even when no caller
//! is waiting), turns runner panics into `Panicked` branch failures, gives
//! cancelled branches a grace period to stop, and finally persists the
//! terminal snapshot.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Fork-join execution use case (`submit_batch`, `execute_batch`,
//!   `cancel_batch`, `get_batch_status`)

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::application::branch_execution::{run_branch, BranchContext};
use crate::domain::batch::{
    BatchId, BatchReport, BatchSnapshot, ExecutionMode, TerminationCause,
};
use crate::domain::branch::{BranchError, BranchErrorKind, BranchId, BranchResult, BranchTask};
use crate::domain::engine_config::ExecutorConfig;
use crate::domain::errors::{BranchFailure, EngineError};
use crate::domain::events::EngineEvent;
use crate::domain::repository::BatchRepository;
use crate::domain::runner::BranchRunner;
use crate::infrastructure::state_store::ExecutionStateStore;

/// Upper bound used when a requested timeout cannot be represented.
const MAX_DEADLINE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Input of one fork-join invocation.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub tasks: Vec<BranchTask>,
    pub mode: ExecutionMode,
    /// Whole-batch deadline; engine default when unset.
    pub batch_timeout: Option<Duration>,
    /// Concurrency bound; engine default when unset.
    pub max_concurrency: Option<usize>,
    /// Cancelling the parent cancels this batch's branches.
    pub parent_token: Option<CancellationToken>,
}

impl BatchRequest {
    pub fn new(tasks: Vec<BranchTask>, mode: ExecutionMode) -> Self {
        Self {
            tasks,
            mode,
            batch_timeout: None,
            max_concurrency: None,
            parent_token: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_parent_token(mut self, token: CancellationToken) -> Self {
        self.parent_token = Some(token);
        self
    }

    /// Rejects malformed input before anything is registered.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.tasks.is_empty() {
            return Err(EngineError::invalid("batch has no tasks"));
        }
        if self.max_concurrency == Some(0) {
            return Err(EngineError::invalid("max_concurrency must be at least 1"));
        }
        if self.batch_timeout.is_some_and(|t| t.is_zero()) {
            return Err(EngineError::invalid("batch timeout must be positive"));
        }
        let mut seen = HashSet::with_capacity(self.tasks.len());
        for task in &self.tasks {
            if !seen.insert(&task.id) {
                return Err(EngineError::invalid(format!(
                    "branch id '{}' appears more than once",
                    task.id
                )));
            }
            if task.timeout.is_some_and(|t| t.is_zero()) {
                return Err(EngineError::invalid(format!(
                    "branch '{}' has a zero timeout",
                    task.id
                )));
            }
        }
        Ok(())
    }
}

/// Per-call overrides of the executor defaults.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub batch_timeout: Option<Duration>,
    pub max_concurrency: Option<usize>,
    pub parent_token: Option<CancellationToken>,
}

impl BatchRequest {
    pub fn with_options(tasks: Vec<BranchTask>, mode: ExecutionMode, options: BatchOptions) -> Self {
        Self {
            tasks,
            mode,
            batch_timeout: options.batch_timeout,
            max_concurrency: options.max_concurrency,
            parent_token: options.parent_token,
        }
    }
}

/// Handle to a submitted batch.
pub struct PendingBatch {
    batch_id: BatchId,
    mode: ExecutionMode,
    terminal: watch::Receiver<bool>,
    store: Arc<ExecutionStateStore>,
    repository: Arc<dyn BatchRepository>,
}

impl PendingBatch {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Wait until the batch is terminal and return its report.
    ///
    /// Forced terminations (batch timeout, cancellation) still return `Ok`
    /// with per-branch status; use [`BatchReport::into_result`] for a strict
    /// view. A `FirstSuccess` batch in which every branch failed returns
    /// `EngineError::AllBranchesFailed` listing each failure.
    pub async fn wait(mut self) -> Result<BatchReport, EngineError> {
        let batch_id = self.batch_id;
        self.terminal
            .wait_for(|terminal| *terminal)
            .await
            .map_err(|_| EngineError::BatchNotFound(batch_id))?;

        let report = match self.store.report(batch_id) {
            Some(report) => {
                if self.store.mark_consumed(batch_id) {
                    self.store.evict(batch_id);
                }
                report
            }
            // sealed and evicted before anyone waited
            None => self
                .repository
                .find_by_id(batch_id)
                .await?
                .as_ref()
                .and_then(BatchReport::from_snapshot)
                .ok_or(EngineError::BatchNotFound(batch_id))?,
        };

        if self.mode == ExecutionMode::FirstSuccess
            && report.termination == TerminationCause::AllFailed
        {
            let failures = report
                .results
                .iter()
                .filter_map(|r| {
                    r.error.clone().map(|error| BranchFailure {
                        branch_id: r.branch_id.clone(),
                        error,
                    })
                })
                .collect();
            return Err(EngineError::AllBranchesFailed { batch_id, failures });
        }
        Ok(report)
    }
}

pub struct ForkJoinExecutor {
    store: Arc<ExecutionStateStore>,
    runner: Arc<dyn BranchRunner>,
    repository: Arc<dyn BatchRepository>,
    config: ExecutorConfig,
}

impl ForkJoinExecutor {
    pub fn new(
        store: Arc<ExecutionStateStore>,
        runner: Arc<dyn BranchRunner>,
        repository: Arc<dyn BatchRepository>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            runner,
            repository,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Register the batch and start its branches without waiting.
    pub fn submit_batch(&self, request: BatchRequest) -> Result<PendingBatch, EngineError> {
        request.validate()?;

        let batch_id = BatchId::new();
        let batch_timeout = request
            .batch_timeout
            .unwrap_or(self.config.default_batch_timeout)
            .min(MAX_DEADLINE);
        let max_concurrency = request
            .max_concurrency
            .unwrap_or(self.config.default_max_concurrency)
            .max(1);
        let branch_count = request.tasks.len();
        let mode = request.mode;

        let submitted_at = Utc::now();
        let deadline_at = submitted_at
            + chrono::Duration::from_std(batch_timeout).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let deadline = Instant::now() + batch_timeout;

        self.store.create_batch(
            batch_id,
            request.tasks.clone(),
            mode,
            deadline_at,
            request.parent_token.as_ref(),
        );
        let terminal = self
            .store
            .subscribe_terminal(batch_id)
            .ok_or(EngineError::BatchNotFound(batch_id))?;

        info!(
            batch_id = %batch_id,
            mode = mode.as_str(),
            branch_count,
            max_concurrency,
            ?batch_timeout,
            "Batch submitted"
        );
        metrics::counter!("aegis_parallel_batches_total", "mode" => mode.as_str()).increment(1);
        self.store.event_bus().publish(EngineEvent::BatchSubmitted {
            batch_id,
            mode,
            branch_count,
            max_concurrency,
            submitted_at,
        });

        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut join_set = JoinSet::new();
        let mut task_branches = HashMap::with_capacity(branch_count);
        for task in request.tasks {
            let token = match self.store.branch_token(batch_id, &task.id) {
                Some(token) => token,
                None => continue,
            };
            let branch_id = task.id.clone();
            let ctx = BranchContext {
                batch_id,
                timeout: task.timeout.or(self.config.default_branch_timeout),
                task,
                grace: self.config.cancel_grace_period,
                token,
                semaphore: semaphore.clone(),
                runner: self.runner.clone(),
                store: self.store.clone(),
            };
            let handle = join_set.spawn(run_branch(ctx));
            task_branches.insert(handle.id(), branch_id);
        }

        let supervisor = Supervisor {
            batch_id,
            store: self.store.clone(),
            repository: self.repository.clone(),
            join_set,
            task_branches,
            deadline,
            grace: self.config.cancel_grace_period,
        };
        tokio::spawn(
            supervisor
                .run()
                .instrument(info_span!("batch", batch_id = %batch_id, mode = mode.as_str())),
        );

        Ok(PendingBatch {
            batch_id,
            mode,
            terminal,
            store: self.store.clone(),
            repository: self.repository.clone(),
        })
    }

    /// Submit and wait.
    pub async fn execute_batch(&self, request: BatchRequest) -> Result<BatchReport, EngineError> {
        self.submit_batch(request)?.wait().await
    }

    /// Cancel every non-terminal branch of a live batch. Returns `false` when
    /// the batch was already terminal.
    pub fn cancel_batch(&self, batch_id: BatchId) -> Result<bool, EngineError> {
        if !self.store.contains(batch_id) {
            return Err(EngineError::BatchNotFound(batch_id));
        }
        Ok(self.store.cancel_batch(batch_id))
    }

    /// Current, possibly in-progress state of a live batch. Never waits.
    pub fn batch_status(&self, batch_id: BatchId) -> Option<BatchSnapshot> {
        self.store.snapshot(batch_id)
    }

    /// Like [`batch_status`](Self::batch_status), falling back to the
    /// repository once the batch has been evicted.
    pub async fn get_batch_status(&self, batch_id: BatchId) -> Result<BatchSnapshot, EngineError> {
        if let Some(snapshot) = self.store.snapshot(batch_id) {
            return Ok(snapshot);
        }
        self.repository
            .find_by_id(batch_id)
            .await?
            .ok_or(EngineError::BatchNotFound(batch_id))
    }
}

struct Supervisor {
    batch_id: BatchId,
    store: Arc<ExecutionStateStore>,
    repository: Arc<dyn BatchRepository>,
    join_set: JoinSet<()>,
    task_branches: HashMap<tokio::task::Id, BranchId>,
    deadline: Instant,
    grace: Duration,
}

impl Supervisor {
    async fn run(mut self) {
        let batch_id = self.batch_id;
        let (Some(mut terminal), Some(token)) = (
            self.store.subscribe_terminal(batch_id),
            self.store.batch_token(batch_id),
        ) else {
            return;
        };

        let expiry = tokio::time::sleep_until(self.deadline);
        tokio::pin!(expiry);

        loop {
            tokio::select! {
                joined = self.join_set.join_next_with_id(), if !self.join_set.is_empty() => {
                    if let Some(Err(e)) = joined {
                        self.on_join_error(e);
                    }
                }
                _ = &mut expiry => {
                    self.store.expire_batch(batch_id);
                    break;
                }
                _ = terminal.wait_for(|t| *t) => break,
                // a parent batch or join was cancelled
                _ = token.cancelled() => {
                    self.store.cancel_batch(batch_id);
                    break;
                }
            }
        }

        self.drain().await;
        self.persist().await;
    }

    fn on_join_error(&self, e: JoinError) {
        if !e.is_panic() {
            return;
        }
        let Some(branch_id) = self.task_branches.get(&e.id()) else {
            return;
        };
        error!(batch_id = %self.batch_id, branch_id = %branch_id, "Branch runner panicked");
        self.store.record_result(
            self.batch_id,
            BranchResult::failed(
                branch_id.clone(),
                BranchError::new(BranchErrorKind::Panicked, "branch runner panicked"),
                0,
            ),
        );
    }

    /// Give cancelled branches the grace period, then stop tracking them.
    async fn drain(&mut self) {
        let join_set = &mut self.join_set;
        let task_branches = &self.task_branches;
        let store = &self.store;
        let batch_id = self.batch_id;

        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = join_set.join_next_with_id().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        if let Some(branch_id) = task_branches.get(&e.id()) {
                            warn!(batch_id = %batch_id, branch_id = %branch_id, "Branch runner panicked after batch terminated");
                            store.record_result(
                                batch_id,
                                BranchResult::failed(
                                    branch_id.clone(),
                                    BranchError::new(BranchErrorKind::Panicked, "branch runner panicked"),
                                    0,
                                ),
                            );
                        }
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            debug!(
                batch_id = %batch_id,
                remaining = self.join_set.len(),
                "Detaching branches that did not stop within the grace period"
            );
            self.join_set.detach_all();
        }
    }

    async fn persist(&self) {
        let Some(snapshot) = self.store.snapshot(self.batch_id) else {
            return;
        };
        if let Err(e) = self.repository.save(&snapshot).await {
            warn!(batch_id = %self.batch_id, "Failed to persist terminal batch: {}", e);
        }
        if self.store.mark_persisted(self.batch_id) {
            self.store.evict(self.batch_id);
        }
    }
}
