// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Concurrent execution engine
//!
//! Runs branches of a workflow concurrently under a completion policy,
//! synchronizes Fork/Join gateway pairs and breaks circular waits between
//! them.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Crate root; re-exports the domain model and the engine

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::{BatchOptions, BatchRequest, ConcurrencyEngine};
pub use domain::*;
