// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Parallel Gateway Domain Model
//!
//! Static configuration binding a Fork node to its Join node, the join
//! strategies deciding how many arrivals are needed, and the merge strategies
//! combining arrived values.
//!
//! ## Merge Strategies
//! | Strategy | Result |
//! |----------|--------|
//! | `CollectAll` | array in `branch_targets` order, never arrival order |
//! | `MergeMap` | shallow object merge, later arrival overwrites earlier keys |
//! | `FirstResult` | first value to arrive |
//! | `Aggregate(fn)` | caller reduction over values in arrival order |
//!
//! Failed arrivals count toward the join strategy but are excluded from the
//! merge unless the pair sets `include_errors`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::branch::{BranchError, BranchErrorKind, BranchId, BranchOutcome, BranchResult, ExecutorRef};
use crate::domain::errors::{BranchFailure, EngineError};

/// Identifier of a Fork or Join node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GatewayId(String);

impl GatewayId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GatewayId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How many arrivals a Join needs before it merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    WaitAll,
    WaitAny,
    WaitMajority,
    WaitN(usize),
}

impl JoinStrategy {
    /// Arrivals required for `branch_count` branches.
    pub fn required(&self, branch_count: usize) -> usize {
        match self {
            Self::WaitAll => branch_count,
            Self::WaitAny => 1,
            Self::WaitMajority => branch_count / 2 + 1,
            Self::WaitN(n) => *n,
        }
    }
}

impl std::str::FromStr for JoinStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase().replace('-', "_");
        match lowered.as_str() {
            "wait_all" | "all" => Ok(Self::WaitAll),
            "wait_any" | "any" => Ok(Self::WaitAny),
            "wait_majority" | "majority" => Ok(Self::WaitMajority),
            other => other
                .strip_prefix("wait_n:")
                .or_else(|| other.strip_prefix("n:"))
                .and_then(|n| n.trim().parse().ok())
                .map(Self::WaitN)
                .ok_or_else(|| format!("unknown join strategy '{s}'")),
        }
    }
}

type ReduceFn = dyn Fn(&[Value]) -> Value + Send + Sync;

/// Named reduction used by [`MergeStrategy::Aggregate`].
#[derive(Clone)]
pub struct Aggregator {
    name: String,
    reduce: Arc<ReduceFn>,
}

impl Aggregator {
    pub fn new(
        name: impl Into<String>,
        reduce: impl Fn(&[Value]) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            reduce: Arc::new(reduce),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, values: &[Value]) -> Value {
        (self.reduce)(values)
    }

    /// Numeric sum. Integers stay integers unless a float is present;
    /// non-numeric values are skipped.
    pub fn sum() -> Self {
        Self::new("sum", |values| {
            if values.iter().all(|v| v.is_i64() || !v.is_number()) {
                Value::from(values.iter().filter_map(Value::as_i64).sum::<i64>())
            } else {
                Value::from(values.iter().filter_map(Value::as_f64).sum::<f64>())
            }
        })
    }

    pub fn count() -> Self {
        Self::new("count", |values| Value::from(values.len()))
    }

    /// String concatenation; non-string values use their JSON text.
    pub fn concat() -> Self {
        Self::new("concat", |values| {
            let joined: String = values
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            Value::String(joined)
        })
    }

    /// Built-in reductions by name.
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "sum" => Some(Self::sum()),
            "count" => Some(Self::count()),
            "concat" => Some(Self::concat()),
            _ => None,
        }
    }
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone)]
pub enum MergeStrategy {
    CollectAll,
    MergeMap,
    FirstResult,
    Aggregate(Aggregator),
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase().replace('-', "_");
        match lowered.as_str() {
            "collect_all" => Ok(Self::CollectAll),
            "merge_map" => Ok(Self::MergeMap),
            "first_result" => Ok(Self::FirstResult),
            other => other
                .strip_prefix("aggregate:")
                .and_then(Aggregator::builtin)
                .map(Self::Aggregate)
                .ok_or_else(|| format!("unknown merge strategy '{s}'")),
        }
    }
}

/// Static configuration binding a Fork to its Join.
#[derive(Debug, Clone)]
pub struct GatewayPairSpec {
    pub fork_id: GatewayId,
    pub join_id: GatewayId,
    /// Ordered target node ids; each spawns one branch with the same id.
    pub branch_targets: Vec<ExecutorRef>,
    pub join_strategy: JoinStrategy,
    pub merge_strategy: MergeStrategy,
    /// Feed failed arrivals into the merge as error markers.
    pub include_errors: bool,
    /// Bounds the fork's branches and the join wait.
    pub timeout: Option<Duration>,
    /// Per-branch timeout for fork-spawned branches.
    pub branch_timeout: Option<Duration>,
}

impl GatewayPairSpec {
    pub fn new(
        fork_id: impl Into<String>,
        join_id: impl Into<String>,
        branch_targets: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            fork_id: GatewayId::new(fork_id),
            join_id: GatewayId::new(join_id),
            branch_targets: branch_targets.into_iter().map(ExecutorRef::new).collect(),
            join_strategy: JoinStrategy::WaitAll,
            merge_strategy: MergeStrategy::CollectAll,
            include_errors: false,
            timeout: None,
            branch_timeout: None,
        }
    }

    pub fn with_join_strategy(mut self, strategy: JoinStrategy) -> Self {
        self.join_strategy = strategy;
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }

    pub fn with_errors_included(mut self) -> Self {
        self.include_errors = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_branch_timeout(mut self, timeout: Duration) -> Self {
        self.branch_timeout = Some(timeout);
        self
    }

    /// Branch ids in target order.
    pub fn branch_ids(&self) -> Vec<BranchId> {
        self.branch_targets
            .iter()
            .map(|t| BranchId::new(t.as_str()))
            .collect()
    }

    pub fn required_arrivals(&self) -> usize {
        self.join_strategy.required(self.branch_targets.len())
    }

    /// Checks that need no knowledge of other pairs.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.branch_targets.is_empty() {
            return Err(EngineError::invalid(format!(
                "fork {} has no branch targets",
                self.fork_id
            )));
        }
        if self.fork_id == self.join_id {
            return Err(EngineError::invalid(format!(
                "fork and join share the id {}",
                self.fork_id
            )));
        }
        let mut seen = HashSet::new();
        for target in &self.branch_targets {
            if !seen.insert(target.as_str()) {
                return Err(EngineError::invalid(format!(
                    "fork {} lists target {} twice",
                    self.fork_id, target
                )));
            }
            if target.as_str() == self.fork_id.as_str() || target.as_str() == self.join_id.as_str() {
                return Err(EngineError::invalid(format!(
                    "gateway {} cannot target its own fork or join",
                    self.fork_id
                )));
            }
        }
        if let JoinStrategy::WaitN(n) = self.join_strategy {
            if n == 0 || n > self.branch_targets.len() {
                return Err(EngineError::invalid(format!(
                    "join {} waits for {} of {} branches",
                    self.join_id,
                    n,
                    self.branch_targets.len()
                )));
            }
        }
        Ok(())
    }
}

/// Registered gateway pairs, keyed by join id.
///
/// Registration enforces the pairing invariants that can be checked without
/// the workflow graph itself:
/// - a fork pairs with exactly one join and a join with exactly one fork;
/// - no two pairs share a branch target;
/// - no pair's branch lands directly on another pair's join (a crossing).
#[derive(Debug, Default)]
pub struct GatewayRegistry {
    pairs: HashMap<GatewayId, GatewayPairSpec>,
    fork_to_join: HashMap<GatewayId, GatewayId>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: GatewayPairSpec) -> Result<(), EngineError> {
        spec.validate()?;

        for existing in self.pairs.values() {
            let same_pair =
                existing.fork_id == spec.fork_id && existing.join_id == spec.join_id;
            if same_pair {
                continue;
            }
            let ids = [&existing.fork_id, &existing.join_id];
            if ids.contains(&&spec.fork_id) || ids.contains(&&spec.join_id) {
                return Err(EngineError::invalid(format!(
                    "gateway pair {}/{} reuses a node of pair {}/{}",
                    spec.fork_id, spec.join_id, existing.fork_id, existing.join_id
                )));
            }
            for target in &spec.branch_targets {
                if existing.branch_targets.contains(target) {
                    return Err(EngineError::invalid(format!(
                        "branch target {} is claimed by fork {} and fork {}",
                        target, existing.fork_id, spec.fork_id
                    )));
                }
                if target.as_str() == existing.join_id.as_str() {
                    return Err(EngineError::invalid(format!(
                        "fork {} crosses into join {} of another pair",
                        spec.fork_id, existing.join_id
                    )));
                }
            }
            if existing
                .branch_targets
                .iter()
                .any(|t| t.as_str() == spec.join_id.as_str())
            {
                return Err(EngineError::invalid(format!(
                    "fork {} crosses into join {} of another pair",
                    existing.fork_id, spec.join_id
                )));
            }
        }

        self.fork_to_join
            .insert(spec.fork_id.clone(), spec.join_id.clone());
        self.pairs.insert(spec.join_id.clone(), spec);
        Ok(())
    }

    pub fn by_join(&self, join_id: &GatewayId) -> Option<&GatewayPairSpec> {
        self.pairs.get(join_id)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Overall state of a join once its strategy is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    Complete,
    /// At least one arrived branch failed; merged successes and the failures
    /// are both reported.
    PartialFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinOutcome {
    pub join_id: GatewayId,
    pub status: JoinStatus,
    pub merged: Value,
    /// Arrived branch ids in arrival order.
    pub arrived: Vec<BranchId>,
    pub failures: Vec<BranchFailure>,
    /// Targets that had not arrived when the join was satisfied, in target order.
    pub pending: Vec<BranchId>,
}

/// Error marker fed into the merge when `include_errors` is set.
fn error_marker(failure: &BranchFailure) -> Value {
    serde_json::json!({
        "branch_id": failure.branch_id.as_str(),
        "error": {
            "kind": failure.error.kind,
            "message": failure.error.message,
        }
    })
}

fn failure_of(result: &BranchResult) -> Option<BranchFailure> {
    match result.status {
        BranchOutcome::Success => None,
        BranchOutcome::Cancelled => Some(BranchFailure {
            branch_id: result.branch_id.clone(),
            error: BranchError::new(BranchErrorKind::Cancelled, "branch was cancelled"),
        }),
        BranchOutcome::Failed | BranchOutcome::TimedOut => Some(BranchFailure {
            branch_id: result.branch_id.clone(),
            error: result.error.clone().unwrap_or_else(|| {
                BranchError::new(BranchErrorKind::RunnerFailure, "branch failed")
            }),
        }),
    }
}

/// Accumulates arrivals for one join and merges them once satisfied.
#[derive(Debug)]
pub struct JoinAccumulator<'a> {
    spec: &'a GatewayPairSpec,
    targets: Vec<BranchId>,
    arrivals: Vec<BranchResult>,
}

impl<'a> JoinAccumulator<'a> {
    pub fn new(spec: &'a GatewayPairSpec) -> Self {
        Self {
            spec,
            targets: spec.branch_ids(),
            arrivals: Vec::new(),
        }
    }

    /// Record an arrival. Unknown or duplicate branches are ignored and
    /// reported as `false`.
    pub fn push(&mut self, result: BranchResult) -> bool {
        let known = self.targets.contains(&result.branch_id);
        let duplicate = self.arrivals.iter().any(|a| a.branch_id == result.branch_id);
        if !known || duplicate {
            return false;
        }
        self.arrivals.push(result);
        true
    }

    pub fn arrived(&self) -> usize {
        self.arrivals.len()
    }

    pub fn is_satisfied(&self) -> bool {
        self.arrivals.len() >= self.spec.required_arrivals()
    }

    fn target_position(&self, id: &BranchId) -> usize {
        self.targets
            .iter()
            .position(|t| t == id)
            .unwrap_or(usize::MAX)
    }

    /// Merge what has arrived so far.
    pub fn finish(self) -> JoinOutcome {
        let failures: Vec<BranchFailure> = self.arrivals.iter().filter_map(failure_of).collect();

        // (target position, value, is_marker) in arrival order
        let mut contributions: Vec<(usize, Value, bool)> = Vec::new();
        for arrival in &self.arrivals {
            let position = self.target_position(&arrival.branch_id);
            match (&arrival.value, failure_of(arrival)) {
                (Some(value), None) => contributions.push((position, value.clone(), false)),
                (_, Some(failure)) if self.spec.include_errors => {
                    contributions.push((position, error_marker(&failure), true));
                }
                _ => {}
            }
        }

        let merged = match &self.spec.merge_strategy {
            MergeStrategy::CollectAll => {
                let mut ordered = contributions;
                ordered.sort_by_key(|(position, _, _)| *position);
                Value::Array(ordered.into_iter().map(|(_, v, _)| v).collect())
            }
            MergeStrategy::MergeMap => {
                let mut map = Map::new();
                let mut markers = Vec::new();
                for (_, value, is_marker) in contributions {
                    match value {
                        marker if is_marker => markers.push(marker),
                        Value::Object(entries) => map.extend(entries),
                        other => {
                            tracing::debug!(value = %other, "Skipping non-object value in map merge");
                        }
                    }
                }
                if !markers.is_empty() {
                    map.insert("_errors".to_string(), Value::Array(markers));
                }
                Value::Object(map)
            }
            MergeStrategy::FirstResult => contributions
                .into_iter()
                .next()
                .map(|(_, v, _)| v)
                .unwrap_or(Value::Null),
            MergeStrategy::Aggregate(aggregator) => {
                let values: Vec<Value> = contributions.into_iter().map(|(_, v, _)| v).collect();
                aggregator.apply(&values)
            }
        };

        let pending = self
            .targets
            .iter()
            .filter(|t| !self.arrivals.iter().any(|a| &a.branch_id == *t))
            .cloned()
            .collect();

        JoinOutcome {
            join_id: self.spec.join_id.clone(),
            status: if failures.is_empty() {
                JoinStatus::Complete
            } else {
                JoinStatus::PartialFailure
            },
            merged,
            arrived: self.arrivals.iter().map(|a| a.branch_id.clone()).collect(),
            failures,
            pending,
        }
    }
}
