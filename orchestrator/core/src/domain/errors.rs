// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Engine Error Taxonomy
//!
//! | Kind | Where it surfaces |
//! |------|-------------------|
//! | `InvalidBatch` | returned before any execution starts |
//! | BranchFailure / BranchTimeout | recorded on the `BranchResult` ([`BranchErrorKind`]) |
//! | `Deadlock` | audit event; returned to a join whose wait was broken |
//! | `BatchTimeout` | batch `TerminationCause`; error via `BatchReport::into_result` |
//!
//! Branch-level failures are recovered by the completion policy and never
//! abort the caller; only batch-level conditions become `EngineError`s.
//!
//! [`BranchErrorKind`]: crate::domain::branch::BranchErrorKind

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::batch::BatchId;
use crate::domain::branch::{BranchError, BranchId, BranchResult};
use crate::domain::gateway::GatewayId;
use crate::domain::repository::RepositoryError;
use crate::domain::wait_graph::WaitNodeId;

/// One failed branch inside an aggregate failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchFailure {
    pub branch_id: BranchId,
    pub error: BranchError,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Batch {batch_id} exceeded its deadline")]
    BatchTimeout {
        batch_id: BatchId,
        results: Vec<BranchResult>,
    },

    #[error("Batch {0} was cancelled")]
    BatchCancelled(BatchId),

    #[error("All {} branches of batch {batch_id} failed", failures.len())]
    AllBranchesFailed {
        batch_id: BatchId,
        failures: Vec<BranchFailure>,
    },

    #[error("Wait on {node} was broken by deadlock resolution")]
    Deadlock { node: WaitNodeId },

    #[error("Join {join_id} timed out with {arrived}/{required} arrivals")]
    JoinTimeout {
        join_id: GatewayId,
        arrived: usize,
        required: usize,
    },

    #[error("Join {join_id} ran out of arrivals ({arrived}/{required})")]
    JoinIncomplete {
        join_id: GatewayId,
        arrived: usize,
        required: usize,
    },

    #[error("Batch {0} not found")]
    BatchNotFound(BatchId),

    #[error("Gateway pair for {0} not registered")]
    GatewayNotFound(GatewayId),

    #[error("No active fork is waiting on join {0}")]
    NoActiveFork(GatewayId),

    #[error("Join {0} already has an active fork")]
    GatewayBusy(GatewayId),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidBatch(message.into())
    }
}
