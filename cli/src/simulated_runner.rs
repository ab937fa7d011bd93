// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Simulated branch runner
//!
//! Stands in for a real workflow node executor so plans can be dry-run from
//! the command line. Each executor follows its [`ExecutorScript`]; executors
//! without a script echo their input.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use aegis_parallel_core::domain::branch::ExecutorRef;
use aegis_parallel_core::domain::runner::{BranchRunner, RunnerError};

use crate::plan::ExecutorScript;

pub struct SimulatedRunner {
    scripts: HashMap<String, ExecutorScript>,
}

impl SimulatedRunner {
    pub fn new(scripts: HashMap<String, ExecutorScript>) -> Self {
        Self { scripts }
    }
}

#[async_trait]
impl BranchRunner for SimulatedRunner {
    async fn invoke(
        &self,
        executor_ref: &ExecutorRef,
        input: Value,
        cancel: CancellationToken,
    ) -> Result<Value, RunnerError> {
        let Some(script) = self.scripts.get(executor_ref.as_str()) else {
            return Ok(input);
        };

        if let Some(delay) = script.delay {
            if script.ignore_cancel {
                tokio::time::sleep(delay).await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        debug!(executor = %executor_ref, "Simulated executor cancelled");
                        return Err(RunnerError::Cancelled);
                    }
                }
            }
        }

        if let Some(message) = &script.fail {
            return Err(RunnerError::Failed(message.clone()));
        }
        Ok(script.value.clone().unwrap_or(input))
    }
}
