// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain model of the concurrent execution engine.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and rules: branch lifecycle, batch completion
//!   policies, gateway pairing and merging, wait-for graph analysis

pub mod batch;
pub mod branch;
pub mod engine_config;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod repository;
pub mod runner;
pub mod wait_graph;
