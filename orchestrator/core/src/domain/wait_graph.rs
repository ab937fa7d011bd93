// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Wait-For Graph
//!
//! Directed graph `node → nodes it is waiting for`, built from live
//! [`WaitEdge`]s. Joins waiting on fork-spawned branches, nested batches
//! waiting on parent resources and any external waiter register edges here.
//!
//! Iteration order is the order in which nodes were first registered, both
//! for DFS roots and for each node's successors. Cycle detection is therefore
//! deterministic for a given registration history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::domain::batch::BatchId;
use crate::domain::branch::BranchId;
use crate::domain::gateway::GatewayId;

/// A vertex of the wait-for graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WaitNodeId(String);

impl WaitNodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Node for a branch of a batch.
    pub fn branch(batch_id: BatchId, branch_id: &BranchId) -> Self {
        Self(format!("branch:{batch_id}/{branch_id}"))
    }

    /// Node for a join gateway.
    pub fn join(join_id: &GatewayId) -> Self {
        Self(format!("join:{join_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WaitNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WaitNodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// `waiter` blocks until every node in `waits_for` completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitEdge {
    pub waiter: WaitNodeId,
    pub waits_for: Vec<WaitNodeId>,
}

impl WaitEdge {
    pub fn new(waiter: impl Into<WaitNodeId>, waits_for: Vec<WaitNodeId>) -> Self {
        Self {
            waiter: waiter.into(),
            waits_for,
        }
    }
}

/// How a detected cycle is broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadlockPolicy {
    /// Cancel the most recently started participant.
    #[default]
    CancelYoungest,
    CancelOldest,
    CancelAll,
}

impl DeadlockPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CancelYoungest => "cancel-youngest",
            Self::CancelOldest => "cancel-oldest",
            Self::CancelAll => "cancel-all",
        }
    }

    /// Pick victims among the cancellable participants of a cycle.
    ///
    /// Each candidate carries its start time and registration sequence; ties
    /// on start time go to the later registration for `CancelYoungest` and
    /// the earlier one for `CancelOldest`.
    pub fn select_victims(&self, candidates: &[VictimCandidate]) -> Vec<WaitNodeId> {
        let key = |c: &&VictimCandidate| (c.started_at, c.registration_seq);
        match self {
            Self::CancelYoungest => candidates
                .iter()
                .max_by_key(key)
                .map(|c| vec![c.node.clone()])
                .unwrap_or_default(),
            Self::CancelOldest => candidates
                .iter()
                .min_by_key(key)
                .map(|c| vec![c.node.clone()])
                .unwrap_or_default(),
            Self::CancelAll => candidates.iter().map(|c| c.node.clone()).collect(),
        }
    }
}

impl fmt::Display for DeadlockPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeadlockPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "cancel-youngest" | "youngest" => Ok(Self::CancelYoungest),
            "cancel-oldest" | "oldest" => Ok(Self::CancelOldest),
            "cancel-all" | "all" => Ok(Self::CancelAll),
            other => Err(format!("unknown deadlock policy '{other}'")),
        }
    }
}

/// A cycle participant that can be cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VictimCandidate {
    pub node: WaitNodeId,
    pub started_at: DateTime<Utc>,
    pub registration_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

#[derive(Debug, Default, Clone)]
pub struct WaitForGraph {
    next_seq: u64,
    seq: HashMap<WaitNodeId, u64>,
    order: BTreeMap<u64, WaitNodeId>,
    edges: HashMap<WaitNodeId, Vec<WaitNodeId>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, node: &WaitNodeId) {
        if !self.seq.contains_key(node) {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.seq.insert(node.clone(), seq);
            self.order.insert(seq, node.clone());
        }
    }

    /// Registration sequence number of a node, lower is older.
    pub fn registration_seq(&self, node: &WaitNodeId) -> Option<u64> {
        self.seq.get(node).copied()
    }

    pub fn contains(&self, node: &WaitNodeId) -> bool {
        self.seq.contains_key(node)
    }

    /// Add an edge set. Duplicate targets are ignored.
    pub fn add_edge(&mut self, edge: WaitEdge) {
        self.register(&edge.waiter);
        for target in &edge.waits_for {
            self.register(target);
        }
        let targets = self.edges.entry(edge.waiter).or_default();
        for target in edge.waits_for {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }

    /// Remove a single `waiter → target` edge.
    pub fn remove_edge(&mut self, waiter: &WaitNodeId, target: &WaitNodeId) {
        if let Some(targets) = self.edges.get_mut(waiter) {
            targets.retain(|t| t != target);
            if targets.is_empty() {
                self.edges.remove(waiter);
            }
        }
        self.collect_isolated();
    }

    /// Drop the node entirely: outgoing edges, and its appearance in other
    /// waiters' sets.
    pub fn remove_node(&mut self, node: &WaitNodeId) {
        self.edges.remove(node);
        self.edges.retain(|_, targets| {
            targets.retain(|t| t != node);
            !targets.is_empty()
        });
        self.collect_isolated();
    }

    fn collect_isolated(&mut self) {
        let isolated: Vec<WaitNodeId> = self
            .seq
            .keys()
            .filter(|node| {
                !self.edges.contains_key(*node)
                    && !self.edges.values().any(|targets| targets.contains(node))
            })
            .cloned()
            .collect();
        for node in isolated {
            if let Some(seq) = self.seq.remove(&node) {
                self.order.remove(&seq);
            }
        }
    }

    /// Nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &WaitNodeId> {
        self.order.values()
    }

    pub fn waits_for(&self, node: &WaitNodeId) -> &[WaitNodeId] {
        self.edges.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Depth-first search with an explicit recursion stack. A successor that
    /// is currently on the stack closes a cycle; the cycle is returned from
    /// that successor to the current node. Returns the first cycle found when
    /// roots and successors are visited in registration order.
    pub fn detect_cycle(&self) -> Option<Vec<WaitNodeId>> {
        self.detect_cycle_skipping(&[])
    }

    /// Same as [`detect_cycle`](Self::detect_cycle), treating the given
    /// `(waiter, target)` edges as absent.
    pub fn detect_cycle_skipping(
        &self,
        skipped: &[(WaitNodeId, WaitNodeId)],
    ) -> Option<Vec<WaitNodeId>> {
        let mut color: HashMap<&WaitNodeId, Color> = HashMap::with_capacity(self.seq.len());

        for root in self.order.values() {
            if color.get(root).copied().unwrap_or(Color::White) != Color::White {
                continue;
            }

            let mut stack: Vec<(&WaitNodeId, usize)> = vec![(root, 0)];
            color.insert(root, Color::Gray);

            while let Some(top) = stack.len().checked_sub(1) {
                let (node, next) = stack[top];
                let targets = self.waits_for(node);

                if next < targets.len() {
                    stack[top].1 += 1;
                    let target = &targets[next];
                    if skipped.iter().any(|(w, t)| w == node && t == target) {
                        continue;
                    }
                    match color.get(target).copied().unwrap_or(Color::White) {
                        Color::Gray => {
                            if let Some(start) = stack.iter().position(|(n, _)| *n == target) {
                                return Some(
                                    stack[start..].iter().map(|(n, _)| (*n).clone()).collect(),
                                );
                            }
                        }
                        Color::Black => {}
                        Color::White => {
                            color.insert(target, Color::Gray);
                            stack.push((target, 0));
                        }
                    }
                } else {
                    color.insert(node, Color::Black);
                    stack.pop();
                }
            }
        }

        None
    }
}
