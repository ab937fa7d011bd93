// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use aegis_parallel_core::domain::branch::ExecutorRef;
use aegis_parallel_core::domain::engine_config::EngineConfigManifest;
use aegis_parallel_core::domain::runner::{BranchRunner, RunnerError};
use aegis_parallel_core::ConcurrencyEngine;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a scripted executor does when invoked.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(Value),
    Fail(String),
    Panic,
}

#[derive(Debug, Clone)]
pub struct Script {
    pub delay: Duration,
    pub behavior: Behavior,
    /// Keep running after cancellation is requested.
    pub ignore_cancel: bool,
}

impl Script {
    pub fn ok(delay_ms: u64, value: Value) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            behavior: Behavior::Succeed(value),
            ignore_cancel: false,
        }
    }

    pub fn fail(delay_ms: u64, message: &str) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            behavior: Behavior::Fail(message.to_string()),
            ignore_cancel: false,
        }
    }

    pub fn panic(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            behavior: Behavior::Panic,
            ignore_cancel: false,
        }
    }

    pub fn ignoring_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }
}

/// Runner whose executors follow fixed scripts, recording what it observed.
#[derive(Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, Script>>,
    invoked: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(self: &Arc<Self>, executor: &str, script: Script) -> Arc<Self> {
        self.scripts.lock().insert(executor.to_string(), script);
        self.clone()
    }

    pub fn invoked(&self) -> Vec<String> {
        self.invoked.lock().clone()
    }

    /// Executors that observed their cancellation token.
    pub fn cancelled(&self) -> Vec<String> {
        let mut cancelled = self.cancelled.lock().clone();
        cancelled.sort();
        cancelled
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BranchRunner for ScriptedRunner {
    async fn invoke(
        &self,
        executor_ref: &ExecutorRef,
        _input: Value,
        cancel: CancellationToken,
    ) -> Result<Value, RunnerError> {
        let name = executor_ref.as_str().to_string();
        let script = self
            .scripts
            .lock()
            .get(&name)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownExecutor(name.clone()))?;
        self.invoked.lock().push(name.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if script.ignore_cancel {
            tokio::time::sleep(script.delay).await;
        } else {
            tokio::select! {
                _ = tokio::time::sleep(script.delay) => {}
                _ = cancel.cancelled() => {
                    self.cancelled.lock().push(name);
                    return Err(RunnerError::Cancelled);
                }
            }
        }

        match script.behavior {
            Behavior::Succeed(value) => Ok(value),
            Behavior::Fail(message) => Err(RunnerError::Failed(message)),
            Behavior::Panic => panic!("scripted panic in {name}"),
        }
    }
}

pub fn config() -> EngineConfigManifest {
    EngineConfigManifest::default()
}

pub fn engine(runner: Arc<ScriptedRunner>) -> ConcurrencyEngine {
    ConcurrencyEngine::new(config(), runner)
}

pub fn engine_with(config: EngineConfigManifest, runner: Arc<ScriptedRunner>) -> ConcurrencyEngine {
    ConcurrencyEngine::new(config, runner)
}
