// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Concurrency Engine
//!
//! Single entry point wiring the execution state store, fork-join executor,
//! parallel gateway and deadlock detector from an [`EngineConfigManifest`].
//! Callers that embed the engine (the CLI, a workflow runtime) only talk to
//! this type.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Public call surface of the concurrent execution engine

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::application::deadlock_detector::{DeadlockDetector, ScanReport};
use crate::application::fork_join::{BatchOptions, BatchRequest, ForkJoinExecutor, PendingBatch};
use crate::application::gateway::ParallelGateway;
use crate::domain::batch::{BatchId, BatchReport, BatchSnapshot, ExecutionMode};
use crate::domain::branch::BranchTask;
use crate::domain::engine_config::EngineConfigManifest;
use crate::domain::errors::EngineError;
use crate::domain::gateway::{GatewayId, GatewayPairSpec, JoinOutcome};
use crate::domain::repository::BatchRepository;
use crate::domain::runner::BranchRunner;
use crate::domain::wait_graph::{WaitEdge, WaitNodeId};
use crate::infrastructure::event_bus::{BatchEventReceiver, EventBus, EventReceiver};
use crate::infrastructure::repositories::InMemoryBatchRepository;
use crate::infrastructure::state_store::{ExecutionStateStore, WaitNodeOwner};

pub struct ConcurrencyEngine {
    config: EngineConfigManifest,
    event_bus: EventBus,
    store: Arc<ExecutionStateStore>,
    executor: Arc<ForkJoinExecutor>,
    gateway: ParallelGateway,
    detector: Arc<DeadlockDetector>,
}

impl ConcurrencyEngine {
    /// Build an engine that keeps terminal batches in memory.
    pub fn new(config: EngineConfigManifest, runner: Arc<dyn BranchRunner>) -> Self {
        Self::with_repository(config, runner, Arc::new(InMemoryBatchRepository::new()))
    }

    pub fn with_repository(
        config: EngineConfigManifest,
        runner: Arc<dyn BranchRunner>,
        repository: Arc<dyn BatchRepository>,
    ) -> Self {
        let event_bus = EventBus::new(config.spec.events.capacity);
        let store = Arc::new(ExecutionStateStore::new(event_bus.clone()));
        let executor = Arc::new(ForkJoinExecutor::new(
            store.clone(),
            runner,
            repository,
            config.spec.executor.clone(),
        ));
        let gateway = ParallelGateway::new(executor.clone(), store.clone());
        let detector = Arc::new(DeadlockDetector::new(
            store.clone(),
            &config.spec.deadlock_detector,
            config.spec.executor.retention_window,
        ));

        Self {
            config,
            event_bus,
            store,
            executor,
            gateway,
            detector,
        }
    }

    pub fn config(&self) -> &EngineConfigManifest {
        &self.config
    }

    pub fn store(&self) -> &Arc<ExecutionStateStore> {
        &self.store
    }

    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        &self.detector
    }

    /// Start background monitoring if the configuration enables it.
    pub fn start(&self) {
        if self.config.spec.deadlock_detector.enabled {
            self.detector.start();
        } else {
            info!("Deadlock detector is disabled");
        }
    }

    pub fn shutdown(&self) {
        self.detector.stop();
    }

    /// Run a batch to its terminal state.
    pub async fn execute_batch(
        &self,
        tasks: Vec<BranchTask>,
        mode: ExecutionMode,
        options: BatchOptions,
    ) -> Result<BatchReport, EngineError> {
        self.executor
            .execute_batch(BatchRequest::with_options(tasks, mode, options))
            .await
    }

    pub fn submit_batch(&self, request: BatchRequest) -> Result<PendingBatch, EngineError> {
        self.executor.submit_batch(request)
    }

    pub fn cancel_batch(&self, batch_id: BatchId) -> Result<bool, EngineError> {
        self.executor.cancel_batch(batch_id)
    }

    /// Non-blocking snapshot of a live batch.
    pub fn batch_status(&self, batch_id: BatchId) -> Option<BatchSnapshot> {
        self.executor.batch_status(batch_id)
    }

    /// Snapshot of a live or persisted batch.
    pub async fn get_batch_status(&self, batch_id: BatchId) -> Result<BatchSnapshot, EngineError> {
        self.executor.get_batch_status(batch_id).await
    }

    pub fn register_gateway_pair(&self, spec: GatewayPairSpec) -> Result<(), EngineError> {
        self.gateway.register_gateway_pair(spec)
    }

    pub fn fork(
        &self,
        spec: &GatewayPairSpec,
        payload: serde_json::Value,
    ) -> Result<BatchId, EngineError> {
        self.gateway.fork(spec, payload)
    }

    pub async fn await_join(&self, spec: &GatewayPairSpec) -> Result<JoinOutcome, EngineError> {
        self.gateway.await_join(spec).await
    }

    pub fn cancel_fork(&self, join_id: &GatewayId) -> Result<bool, EngineError> {
        self.gateway.cancel_fork(join_id)
    }

    pub fn gateway(&self) -> &ParallelGateway {
        &self.gateway
    }

    /// Register a waiter that is not a branch or a join, such as a nested
    /// batch waiting on resources held by its parent. With a token it can be
    /// chosen as a deadlock victim.
    pub fn register_waiter(&self, node: WaitNodeId, token: Option<CancellationToken>) {
        self.store.register_node(node, token, WaitNodeOwner::External);
    }

    pub fn register_wait_edge(&self, edge: WaitEdge) {
        self.store.add_wait_edge(edge);
    }

    pub fn remove_wait_edge(&self, waiter: &WaitNodeId, target: &WaitNodeId) {
        self.store.remove_wait_edge(waiter, target);
    }

    /// Drop a waiter and all its edges once it stops waiting.
    pub fn remove_waiter(&self, node: &WaitNodeId) {
        self.store.unregister_node(node);
    }

    /// Run one deadlock detection pass now.
    pub fn scan_for_deadlocks(&self) -> ScanReport {
        self.detector.scan_once()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    pub fn subscribe_batch(&self, batch_id: BatchId) -> BatchEventReceiver {
        self.event_bus.subscribe_batch(batch_id)
    }
}

impl Drop for ConcurrencyEngine {
    fn drop(&mut self) {
        self.detector.stop();
    }
}
