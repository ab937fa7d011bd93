// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::batch::{BatchId, ExecutionMode, TerminationCause};
use crate::domain::branch::{BranchId, BranchOutcome, CancelReason};
use crate::domain::gateway::{GatewayId, JoinStatus};
use crate::domain::wait_graph::WaitNodeId;

/// Audit events emitted by the engine.
///
/// Deadlock detection and resolution are always emitted as a pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    BatchSubmitted {
        batch_id: BatchId,
        mode: ExecutionMode,
        branch_count: usize,
        max_concurrency: usize,
        submitted_at: DateTime<Utc>,
    },
    BranchStarted {
        batch_id: BatchId,
        branch_id: BranchId,
        executor_ref: String,
        started_at: DateTime<Utc>,
    },
    BranchCompleted {
        batch_id: BatchId,
        branch_id: BranchId,
        status: BranchOutcome,
        duration_ms: u64,
        completed_at: DateTime<Utc>,
    },
    BranchTimedOut {
        batch_id: BatchId,
        branch_id: BranchId,
        timeout_ms: u64,
        timed_out_at: DateTime<Utc>,
    },
    /// A result arrived after its batch was already terminal and was dropped.
    LateResultDiscarded {
        batch_id: BatchId,
        branch_id: BranchId,
        status: BranchOutcome,
        discarded_at: DateTime<Utc>,
    },
    BatchCompleted {
        batch_id: BatchId,
        termination: TerminationCause,
        succeeded: usize,
        failed: usize,
        cancelled: usize,
        completed_at: DateTime<Utc>,
    },
    BatchCancelled {
        batch_id: BatchId,
        reason: CancelReason,
        cancelled_at: DateTime<Utc>,
    },
    BatchTimedOut {
        batch_id: BatchId,
        open_branches: usize,
        timed_out_at: DateTime<Utc>,
    },
    GatewayForked {
        fork_id: GatewayId,
        join_id: GatewayId,
        batch_id: BatchId,
        branch_count: usize,
        forked_at: DateTime<Utc>,
    },
    JoinCompleted {
        join_id: GatewayId,
        batch_id: BatchId,
        status: JoinStatus,
        arrived: usize,
        completed_at: DateTime<Utc>,
    },
    DeadlockDetected {
        cycle: Vec<WaitNodeId>,
        detected_at: DateTime<Utc>,
    },
    DeadlockResolved {
        cycle: Vec<WaitNodeId>,
        victims: Vec<WaitNodeId>,
        policy: String,
        resolved_at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// The batch this event belongs to, when there is one.
    pub fn batch_id(&self) -> Option<BatchId> {
        match self {
            EngineEvent::BatchSubmitted { batch_id, .. }
            | EngineEvent::BranchStarted { batch_id, .. }
            | EngineEvent::BranchCompleted { batch_id, .. }
            | EngineEvent::BranchTimedOut { batch_id, .. }
            | EngineEvent::LateResultDiscarded { batch_id, .. }
            | EngineEvent::BatchCompleted { batch_id, .. }
            | EngineEvent::BatchCancelled { batch_id, .. }
            | EngineEvent::BatchTimedOut { batch_id, .. }
            | EngineEvent::GatewayForked { batch_id, .. }
            | EngineEvent::JoinCompleted { batch_id, .. } => Some(*batch_id),
            EngineEvent::DeadlockDetected { .. } | EngineEvent::DeadlockResolved { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::BatchSubmitted { .. } => "batch_submitted",
            EngineEvent::BranchStarted { .. } => "branch_started",
            EngineEvent::BranchCompleted { .. } => "branch_completed",
            EngineEvent::BranchTimedOut { .. } => "branch_timed_out",
            EngineEvent::LateResultDiscarded { .. } => "late_result_discarded",
            EngineEvent::BatchCompleted { .. } => "batch_completed",
            EngineEvent::BatchCancelled { .. } => "batch_cancelled",
            EngineEvent::BatchTimedOut { .. } => "batch_timed_out",
            EngineEvent::GatewayForked { .. } => "gateway_forked",
            EngineEvent::JoinCompleted { .. } => "join_completed",
            EngineEvent::DeadlockDetected { .. } => "deadlock_detected",
            EngineEvent::DeadlockResolved { .. } => "deadlock_resolved",
        }
    }
}
