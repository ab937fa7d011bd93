// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! AEGIS Parallel CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Plan loading, simulated executors and command handlers for the `aegis-parallel` binary

pub mod commands;
pub mod plan;
pub mod simulated_runner;
