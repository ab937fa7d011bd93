// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Use cases of the concurrent execution engine.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Fork-join execution, Fork/Join gateways, deadlock detection

mod branch_execution;
pub mod deadlock_detector;
pub mod engine;
pub mod fork_join;
pub mod gateway;

pub use deadlock_detector::{DeadlockDetector, ResolvedCycle, ScanReport};
pub use engine::ConcurrencyEngine;
pub use fork_join::{BatchOptions, BatchRequest, ForkJoinExecutor, PendingBatch};
pub use gateway::{await_and_merge, ParallelGateway};
