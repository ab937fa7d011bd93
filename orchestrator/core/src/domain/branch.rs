// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Branch Domain Model
//!
//! A **branch** is one unit of concurrent work inside a fork-join batch. This
//! module holds the value objects describing a branch (`BranchTask`), the
//! immutable outcome it produces (`BranchResult`) and the per-branch lifecycle
//! wrapper tracked by the execution state store (`BranchState`).
//!
//! ## Lifecycle
//!
//! ```text
//! Pending ──mark_running──▶ Running ──record──▶ Terminal
//!    │                                             ▲
//!    └──────────────────record─────────────────────┘
//! ```
//!
//! Transitions are one-directional. The first writer to move a branch into
//! `Terminal` wins; every later write is rejected and reported to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier of a branch, unique within its batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(String);

impl BranchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BranchId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Opaque reference to the external runner that executes a branch
/// (a workflow node id, an agent name, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutorRef(String);

impl ExecutorRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of concurrent work submitted as part of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchTask {
    pub id: BranchId,
    pub executor_ref: ExecutorRef,
    /// Opaque payload handed to the runner untouched.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Overrides the batch default branch timeout when set.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl BranchTask {
    pub fn new(
        id: impl Into<String>,
        executor_ref: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id: BranchId::new(id),
            executor_ref: ExecutorRef::new(executor_ref),
            input,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Final status recorded on a [`BranchResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchOutcome {
    Success,
    Failed,
    TimedOut,
    Cancelled,
}

impl BranchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Classification of a branch error. `RunnerFailure` and `Timeout` are the
/// BranchFailure / BranchTimeout kinds; they count the same for completion
/// policies but are tagged apart for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchErrorKind {
    /// The runner returned an error.
    RunnerFailure,
    /// The branch exceeded its own timeout.
    Timeout,
    /// The whole batch exceeded its deadline while this branch was in flight.
    BatchTimeout,
    /// The runner task panicked.
    Panicked,
    /// The branch was cancelled; used when a cancelled arrival is reported
    /// among a join's failures.
    Cancelled,
}

/// Error carried by a failed or timed-out branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct BranchError {
    pub kind: BranchErrorKind,
    pub message: String,
}

impl BranchError {
    pub fn new(kind: BranchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Why a branch was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The batch completion policy was satisfied without this branch.
    PolicySatisfied,
    /// A caller cancelled the whole batch.
    BatchCancelled,
    /// The branch was chosen as the victim of deadlock resolution.
    DeadlockResolution,
}

/// Outcome of one branch. Immutable once recorded.
///
/// `error` is present iff `status` is `Failed` or `TimedOut`; `value` only on
/// `Success`; `cancel_reason` only on `Cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchResult {
    pub branch_id: BranchId,
    pub status: BranchOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BranchError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    pub duration_millis: u64,
}

impl BranchResult {
    pub fn success(branch_id: BranchId, value: serde_json::Value, duration_millis: u64) -> Self {
        Self {
            branch_id,
            status: BranchOutcome::Success,
            value: Some(value),
            error: None,
            cancel_reason: None,
            duration_millis,
        }
    }

    pub fn failed(branch_id: BranchId, error: BranchError, duration_millis: u64) -> Self {
        Self {
            branch_id,
            status: BranchOutcome::Failed,
            value: None,
            error: Some(error),
            cancel_reason: None,
            duration_millis,
        }
    }

    pub fn timed_out(branch_id: BranchId, error: BranchError, duration_millis: u64) -> Self {
        Self {
            branch_id,
            status: BranchOutcome::TimedOut,
            value: None,
            error: Some(error),
            cancel_reason: None,
            duration_millis,
        }
    }

    pub fn cancelled(branch_id: BranchId, reason: CancelReason, duration_millis: u64) -> Self {
        Self {
            branch_id,
            status: BranchOutcome::Cancelled,
            value: None,
            error: None,
            cancel_reason: Some(reason),
            duration_millis,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Lifecycle phase of a branch inside the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Pending,
    Running,
    Terminal,
}

/// Why a branch transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejected {
    /// The branch is already terminal; the late writer loses.
    AlreadyTerminal,
    /// `mark_running` on a branch that is not pending.
    NotPending,
}

/// Per-branch lifecycle wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchState {
    pub task: BranchTask,
    pub status: BranchStatus,
    pub result: Option<BranchResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BranchState {
    pub fn new(task: BranchTask) -> Self {
        Self {
            task,
            status: BranchStatus::Pending,
            result: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> &BranchId {
        &self.task.id
    }

    pub fn is_terminal(&self) -> bool {
        self.status == BranchStatus::Terminal
    }

    /// `Pending → Running`.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), TransitionRejected> {
        match self.status {
            BranchStatus::Pending => {
                self.status = BranchStatus::Running;
                self.started_at = Some(now);
                Ok(())
            }
            BranchStatus::Running => Err(TransitionRejected::NotPending),
            BranchStatus::Terminal => Err(TransitionRejected::AlreadyTerminal),
        }
    }

    /// `Pending | Running → Terminal`. Only the first call succeeds.
    pub fn record(
        &mut self,
        result: BranchResult,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionRejected> {
        if self.is_terminal() {
            return Err(TransitionRejected::AlreadyTerminal);
        }
        self.status = BranchStatus::Terminal;
        self.result = Some(result);
        self.finished_at = Some(now);
        Ok(())
    }

    /// Milliseconds between start (if any) and `now`.
    pub fn elapsed_millis(&self, now: DateTime<Utc>) -> u64 {
        self.started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(id: &str) -> BranchState {
        BranchState::new(BranchTask::new(id, "node-a", json!({"k": 1})))
    }

    #[test]
    fn test_lifecycle_is_one_directional() {
        let mut branch = state("b1");
        let now = Utc::now();

        assert!(branch.mark_running(now).is_ok());
        assert_eq!(branch.mark_running(now), Err(TransitionRejected::NotPending));

        let result = BranchResult::success(BranchId::new("b1"), json!(42), 10);
        assert!(branch.record(result, now).is_ok());
        assert!(branch.is_terminal());
        assert_eq!(branch.mark_running(now), Err(TransitionRejected::AlreadyTerminal));
    }

    #[test]
    fn test_first_terminal_writer_wins() {
        let mut branch = state("b1");
        let now = Utc::now();
        branch.mark_running(now).unwrap();

        let first = BranchResult::success(BranchId::new("b1"), json!("first"), 5);
        let late = BranchResult::failed(
            BranchId::new("b1"),
            BranchError::new(BranchErrorKind::RunnerFailure, "late"),
            6,
        );

        branch.record(first.clone(), now).unwrap();
        assert_eq!(branch.record(late, now), Err(TransitionRejected::AlreadyTerminal));
        assert_eq!(branch.result, Some(first));
    }

    #[test]
    fn test_pending_branch_can_be_cancelled_directly() {
        let mut branch = state("b1");
        let result = BranchResult::cancelled(BranchId::new("b1"), CancelReason::BatchCancelled, 0);
        assert!(branch.record(result, Utc::now()).is_ok());
        assert!(branch.started_at.is_none());
    }

    #[test]
    fn test_error_present_only_for_failures() {
        let ok = BranchResult::success(BranchId::new("a"), json!(1), 1);
        assert!(ok.error.is_none());

        let timed_out = BranchResult::timed_out(
            BranchId::new("a"),
            BranchError::new(BranchErrorKind::Timeout, "too slow"),
            1,
        );
        assert!(timed_out.error.is_some());

        let cancelled = BranchResult::cancelled(BranchId::new("a"), CancelReason::PolicySatisfied, 1);
        assert!(cancelled.error.is_none());
        assert_eq!(cancelled.cancel_reason, Some(CancelReason::PolicySatisfied));
    }
}
