// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Plan files
//!
//! YAML (or JSON, by extension) descriptions of a batch or a gateway pair
//! for the `batch run` and `gateway run` commands, together with the
//! scripts the simulated runner follows for each executor.
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Parse and validate operator-supplied plans

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use aegis_parallel_core::domain::batch::ExecutionMode;
use aegis_parallel_core::domain::branch::BranchTask;
use aegis_parallel_core::domain::gateway::{GatewayPairSpec, JoinStrategy, MergeStrategy};

/// What a simulated executor does when invoked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorScript {
    /// Simulated work time.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub delay: Option<Duration>,
    /// Returned value; the branch input is echoed when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Fail with this message instead of returning a value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail: Option<String>,
    /// Keep working after cancellation is requested.
    #[serde(default)]
    pub ignore_cancel: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchPlan {
    pub mode: ExecutionMode,
    #[serde(default, with = "humantime_serde")]
    pub batch_timeout: Option<Duration>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    pub tasks: Vec<BranchTask>,
    #[serde(default)]
    pub executors: HashMap<String, ExecutorScript>,
}

fn default_join_strategy() -> String {
    "wait-all".to_string()
}

fn default_merge_strategy() -> String {
    "collect-all".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPlan {
    pub fork_id: String,
    pub join_id: String,
    pub targets: Vec<String>,
    /// `wait-all`, `wait-any`, `wait-majority` or `wait-n:<n>`
    #[serde(default = "default_join_strategy")]
    pub join_strategy: String,
    /// `collect-all`, `merge-map`, `first-result` or `aggregate:<sum|count|concat>`
    #[serde(default = "default_merge_strategy")]
    pub merge_strategy: String,
    #[serde(default)]
    pub include_errors: bool,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub branch_timeout: Option<Duration>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub executors: HashMap<String, ExecutorScript>,
}

impl GatewayPlan {
    pub fn to_spec(&self) -> Result<GatewayPairSpec> {
        let join_strategy: JoinStrategy = self
            .join_strategy
            .parse()
            .map_err(anyhow::Error::msg)
            .context("Invalid join_strategy")?;
        let merge_strategy: MergeStrategy = self
            .merge_strategy
            .parse()
            .map_err(anyhow::Error::msg)
            .context("Invalid merge_strategy")?;

        let mut spec = GatewayPairSpec::new(&self.fork_id, &self.join_id, self.targets.iter())
            .with_join_strategy(join_strategy)
            .with_merge_strategy(merge_strategy);
        if self.include_errors {
            spec = spec.with_errors_included();
        }
        if let Some(timeout) = self.timeout {
            spec = spec.with_timeout(timeout);
        }
        if let Some(timeout) = self.branch_timeout {
            spec = spec.with_branch_timeout(timeout);
        }
        Ok(spec)
    }
}

/// Load a plan, choosing the format by file extension.
pub fn load_plan<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file: {:?}", path))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&content).with_context(|| format!("Failed to parse plan: {:?}", path))
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse plan: {:?}", path))
    }
}
