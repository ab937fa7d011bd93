// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Execution Batch Aggregate
//!
//! One fork-join invocation. The batch owns its branch states (in submission
//! order), evaluates the completion policy after every accepted result, and
//! seals itself exactly once.
//!
//! ## Completion Policy
//! | Mode | Decides when | Remaining branches |
//! |------|--------------|--------------------|
//! | `All` | every branch is terminal | none left |
//! | `Any` | first terminal branch (any status) | cancelled |
//! | `FirstSuccess` | first `Success`, or all failed | cancelled |
//! | `Majority` | `floor(n/2)+1` terminal branches | cancelled |
//!
//! ## Invariants
//!
//! - Once `terminal` is true no result is ever applied again; late results
//!   are rejected with [`ApplyRejected::BatchTerminal`] and left untouched.
//! - Sealing (policy, timeout, cancellation) moves every non-terminal branch
//!   to `Terminal` in the same critical section that sets `terminal`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::domain::branch::{
    BranchError, BranchErrorKind, BranchId, BranchOutcome, BranchResult, BranchState,
    BranchStatus, BranchTask, CancelReason,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Completion policy of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    All,
    Any,
    Majority,
    FirstSuccess,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Any => "any",
            Self::Majority => "majority",
            Self::FirstSuccess => "first_success",
        }
    }

    /// Whether the caller gets a single deciding result in addition to the set.
    pub fn has_decisive_result(&self) -> bool {
        matches!(self, Self::Any | Self::FirstSuccess)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "all" => Ok(Self::All),
            "any" => Ok(Self::Any),
            "majority" => Ok(Self::Majority),
            "first_success" | "firstsuccess" => Ok(Self::FirstSuccess),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

/// Why a batch became terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    /// The completion policy was satisfied.
    PolicySatisfied,
    /// `FirstSuccess` ran out of branches without a success.
    AllFailed,
    /// The batch deadline elapsed.
    BatchTimeout,
    /// A caller cancelled the batch.
    Cancelled,
}

impl TerminationCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicySatisfied => "policy_satisfied",
            Self::AllFailed => "all_failed",
            Self::BatchTimeout => "batch_timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_forced(&self) -> bool {
        matches!(self, Self::BatchTimeout | Self::Cancelled)
    }
}

/// Why [`ExecutionBatch::apply_result`] refused a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyRejected {
    BatchTerminal,
    UnknownBranch,
    BranchTerminal,
}

/// Effect of an accepted result on the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// Set when this result made the batch terminal.
    pub sealed: Option<TerminationCause>,
    /// Results synthesised for branches closed by the seal (cancelled siblings).
    pub closed: Vec<BranchResult>,
}

/// Aggregate of one fork-join invocation. Persisted form is [`BatchSnapshot`].
#[derive(Debug, Clone)]
pub struct ExecutionBatch {
    pub batch_id: BatchId,
    pub mode: ExecutionMode,
    branches: Vec<BranchState>,
    index: HashMap<BranchId, usize>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub terminal: bool,
    pub termination: Option<TerminationCause>,
    pub terminated_at: Option<DateTime<Utc>>,
    /// The branch whose result decided an `Any` / `FirstSuccess` batch.
    pub decided_by: Option<BranchId>,
    /// Branch ids in the order their results were accepted.
    arrival_order: Vec<BranchId>,
}

impl ExecutionBatch {
    /// Build a new batch. Task ids must already be validated as unique.
    pub fn new(
        batch_id: BatchId,
        tasks: Vec<BranchTask>,
        mode: ExecutionMode,
        created_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        let branches: Vec<BranchState> = tasks.into_iter().map(BranchState::new).collect();
        let index = branches
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id().clone(), i))
            .collect();
        Self {
            batch_id,
            mode,
            branches,
            index,
            created_at,
            deadline,
            terminal: false,
            termination: None,
            terminated_at: None,
            decided_by: None,
            arrival_order: Vec::new(),
        }
    }

    pub fn branches(&self) -> &[BranchState] {
        &self.branches
    }

    pub fn branch(&self, id: &BranchId) -> Option<&BranchState> {
        self.index.get(id).map(|&i| &self.branches[i])
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn arrival_order(&self) -> &[BranchId] {
        &self.arrival_order
    }

    pub fn terminal_count(&self) -> usize {
        self.branches.iter().filter(|b| b.is_terminal()).count()
    }

    /// Number of terminal branches a `Majority` batch needs.
    pub fn majority_threshold(&self) -> usize {
        self.branches.len() / 2 + 1
    }

    /// `Pending → Running` for one branch. Refused once the batch is terminal.
    pub fn mark_running(
        &mut self,
        branch_id: &BranchId,
        now: DateTime<Utc>,
    ) -> Result<(), ApplyRejected> {
        if self.terminal {
            return Err(ApplyRejected::BatchTerminal);
        }
        let idx = *self.index.get(branch_id).ok_or(ApplyRejected::UnknownBranch)?;
        self.branches[idx]
            .mark_running(now)
            .map_err(|_| ApplyRejected::BranchTerminal)
    }

    /// Record a branch result and evaluate the completion policy.
    ///
    /// A terminal batch is never mutated: late results return
    /// `Err(ApplyRejected::BatchTerminal)` without touching `branches` and
    /// without re-running the policy.
    pub fn apply_result(
        &mut self,
        result: BranchResult,
        now: DateTime<Utc>,
    ) -> Result<Applied, ApplyRejected> {
        if self.terminal {
            return Err(ApplyRejected::BatchTerminal);
        }
        let idx = *self
            .index
            .get(&result.branch_id)
            .ok_or(ApplyRejected::UnknownBranch)?;

        let branch_id = result.branch_id.clone();
        let succeeded = result.is_success();
        self.branches[idx]
            .record(result, now)
            .map_err(|_| ApplyRejected::BranchTerminal)?;
        self.arrival_order.push(branch_id.clone());

        let decision = self.evaluate_policy(succeeded);
        let closed = match decision {
            Some(cause) => {
                if self.mode.has_decisive_result() && cause == TerminationCause::PolicySatisfied {
                    self.decided_by = Some(branch_id);
                }
                self.seal(cause, now)
            }
            None => Vec::new(),
        };

        Ok(Applied {
            sealed: decision,
            closed,
        })
    }

    fn evaluate_policy(&self, latest_succeeded: bool) -> Option<TerminationCause> {
        let total = self.branches.len();
        let done = self.terminal_count();
        match self.mode {
            ExecutionMode::All => (done == total).then_some(TerminationCause::PolicySatisfied),
            ExecutionMode::Any => Some(TerminationCause::PolicySatisfied),
            ExecutionMode::FirstSuccess => {
                if latest_succeeded {
                    Some(TerminationCause::PolicySatisfied)
                } else if done == total {
                    Some(TerminationCause::AllFailed)
                } else {
                    None
                }
            }
            ExecutionMode::Majority => {
                (done >= self.majority_threshold()).then_some(TerminationCause::PolicySatisfied)
            }
        }
    }

    /// Force the batch terminal because its deadline elapsed. Open branches
    /// become `TimedOut` with a `BatchTimeout` error.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<Vec<BranchResult>> {
        if self.terminal {
            return None;
        }
        Some(self.seal(TerminationCause::BatchTimeout, now))
    }

    /// Force the batch terminal on caller request. Open branches become `Cancelled`.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Option<Vec<BranchResult>> {
        if self.terminal {
            return None;
        }
        Some(self.seal(TerminationCause::Cancelled, now))
    }

    /// Close every open branch and mark the batch terminal.
    fn seal(&mut self, cause: TerminationCause, now: DateTime<Utc>) -> Vec<BranchResult> {
        let mut closed = Vec::new();
        for branch in self.branches.iter_mut().filter(|b| !b.is_terminal()) {
            let elapsed = branch.elapsed_millis(now);
            let id = branch.id().clone();
            let result = match cause {
                TerminationCause::BatchTimeout => BranchResult::timed_out(
                    id,
                    BranchError::new(
                        BranchErrorKind::BatchTimeout,
                        "batch deadline elapsed before the branch finished",
                    ),
                    elapsed,
                ),
                TerminationCause::Cancelled => {
                    BranchResult::cancelled(id, CancelReason::BatchCancelled, elapsed)
                }
                TerminationCause::PolicySatisfied | TerminationCause::AllFailed => {
                    BranchResult::cancelled(id, CancelReason::PolicySatisfied, elapsed)
                }
            };
            // Branch is open, so record cannot be refused.
            if branch.record(result.clone(), now).is_ok() {
                closed.push(result);
            }
        }
        self.terminal = true;
        self.termination = Some(cause);
        self.terminated_at = Some(now);
        closed
    }

    /// All recorded results in submission order.
    pub fn results(&self) -> Vec<BranchResult> {
        self.branches
            .iter()
            .filter_map(|b| b.result.clone())
            .collect()
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            batch_id: self.batch_id,
            mode: self.mode,
            created_at: self.created_at,
            deadline: self.deadline,
            terminal: self.terminal,
            termination: self.termination,
            terminated_at: self.terminated_at,
            decided_by: self.decided_by.clone(),
            branches: self
                .branches
                .iter()
                .map(|b| BranchSnapshot {
                    branch_id: b.id().clone(),
                    executor_ref: b.task.executor_ref.to_string(),
                    status: b.status,
                    result: b.result.clone(),
                    started_at: b.started_at,
                    finished_at: b.finished_at,
                })
                .collect(),
        }
    }
}

/// Point-in-time view of one branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSnapshot {
    pub branch_id: BranchId,
    pub executor_ref: String,
    pub status: BranchStatus,
    pub result: Option<BranchResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Point-in-time, possibly in-progress, view of a batch. This is also the
/// opaque record handed to a `BatchRepository`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub batch_id: BatchId,
    pub mode: ExecutionMode,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub terminal: bool,
    pub termination: Option<TerminationCause>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub decided_by: Option<BranchId>,
    pub branches: Vec<BranchSnapshot>,
}

impl BatchSnapshot {
    pub fn count(&self, outcome: BranchOutcome) -> usize {
        self.branches
            .iter()
            .filter_map(|b| b.result.as_ref())
            .filter(|r| r.status == outcome)
            .count()
    }

    pub fn running(&self) -> usize {
        self.branches
            .iter()
            .filter(|b| b.status == BranchStatus::Running)
            .count()
    }

    pub fn pending(&self) -> usize {
        self.branches
            .iter()
            .filter(|b| b.status == BranchStatus::Pending)
            .count()
    }
}

/// How a terminal batch turned out, for callers that only need the headline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchVerdict {
    AllSucceeded,
    PartialFailure,
    Failed,
    ForcedTermination(TerminationCause),
}

/// Final result of a terminal batch as returned to the caller.
///
/// `results` always holds one entry per submitted task, in submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub mode: ExecutionMode,
    pub termination: TerminationCause,
    pub results: Vec<BranchResult>,
    /// Deciding result for `Any` / `FirstSuccess`.
    pub decisive: Option<BranchResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    /// Build the report from a terminal batch.
    pub fn from_batch(batch: &ExecutionBatch) -> Self {
        let results = batch.results();
        let decisive = batch
            .decided_by
            .as_ref()
            .and_then(|id| results.iter().find(|r| &r.branch_id == id).cloned());
        Self {
            batch_id: batch.batch_id,
            mode: batch.mode,
            termination: batch.termination.unwrap_or(TerminationCause::PolicySatisfied),
            results,
            decisive,
            started_at: batch.created_at,
            finished_at: batch.terminated_at.unwrap_or_else(Utc::now),
        }
    }

    /// Rebuild the report of a sealed batch from its persisted snapshot.
    pub fn from_snapshot(snapshot: &BatchSnapshot) -> Option<Self> {
        if !snapshot.terminal {
            return None;
        }
        let results: Vec<BranchResult> = snapshot
            .branches
            .iter()
            .filter_map(|b| b.result.clone())
            .collect();
        let decisive = snapshot
            .decided_by
            .as_ref()
            .and_then(|id| results.iter().find(|r| &r.branch_id == id).cloned());
        Some(Self {
            batch_id: snapshot.batch_id,
            mode: snapshot.mode,
            termination: snapshot.termination.unwrap_or(TerminationCause::PolicySatisfied),
            results,
            decisive,
            started_at: snapshot.created_at,
            finished_at: snapshot.terminated_at.unwrap_or_else(Utc::now),
        })
    }

    pub fn successes(&self) -> impl Iterator<Item = &BranchResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &BranchResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.status, BranchOutcome::Failed | BranchOutcome::TimedOut))
    }

    pub fn verdict(&self) -> BatchVerdict {
        if self.termination.is_forced() {
            return BatchVerdict::ForcedTermination(self.termination);
        }
        let failed = self.failures().count();
        let succeeded = self.successes().count();
        match (succeeded, failed) {
            (0, _) => BatchVerdict::Failed,
            (_, 0) => BatchVerdict::AllSucceeded,
            _ => BatchVerdict::PartialFailure,
        }
    }

    /// Strict view: forced terminations become errors.
    pub fn into_result(self) -> Result<Self, crate::domain::errors::EngineError> {
        match self.termination {
            TerminationCause::BatchTimeout => Err(crate::domain::errors::EngineError::BatchTimeout {
                batch_id: self.batch_id,
                results: self.results,
            }),
            TerminationCause::Cancelled => {
                Err(crate::domain::errors::EngineError::BatchCancelled(self.batch_id))
            }
            _ => Ok(self),
        }
    }
}
