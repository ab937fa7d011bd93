// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Branch runner collaborator.
//!
//! The engine never knows what a branch does. It hands the executor reference,
//! the opaque input and a cancellation token to a [`BranchRunner`] supplied by
//! the surrounding system (workflow node executor, agent caller, ...).
//!
//! Cancellation is cooperative: runners should watch `cancel` at their own
//! checkpoints. The engine tolerates runners that hang, error, panic or ignore
//! the token entirely.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::branch::ExecutorRef;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0}")]
    Failed(String),

    #[error("Executor '{0}' is not known to this runner")]
    UnknownExecutor(String),

    #[error("Runner observed cancellation")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait BranchRunner: Send + Sync {
    /// Execute one branch and return its value.
    async fn invoke(
        &self,
        executor_ref: &ExecutorRef,
        input: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, RunnerError>;
}
