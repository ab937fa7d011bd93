// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Deadlock Detector - Background monitor for circular waits and stuck branches
//!
//! Periodically scans the wait-for graph held by the [`ExecutionStateStore`].
//! A cycle is reported and broken by cancelling victims chosen by the
//! configured [`DeadlockPolicy`]; the broken waits fail with
//! `EngineError::Deadlock` in their callers. The same pass times out running
//! branches that outlived their timeout and evicts terminal batches past the
//! retention window.
//!
//! Lifecycle is `Stopped -> Running -> Stopped`. `start` is a no-op while
//! running and `stop` is safe in any state.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Deadlock detection and resolution, timeout sweeping

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::batch::BatchId;
use crate::domain::branch::BranchId;
use crate::domain::engine_config::DeadlockDetectorConfig;
use crate::domain::events::EngineEvent;
use crate::domain::wait_graph::{DeadlockPolicy, VictimCandidate, WaitNodeId};
use crate::infrastructure::state_store::ExecutionStateStore;

/// Upper bound on cycles broken in one scan.
const MAX_CYCLES_PER_SCAN: usize = 64;

/// A cycle found in one scan and the nodes cancelled to break it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCycle {
    pub cycle: Vec<WaitNodeId>,
    /// Empty when no participant could be cancelled; the cycle is then only
    /// reported and will be found again by the next scan.
    pub victims: Vec<WaitNodeId>,
}

/// Everything one scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub cycles: Vec<ResolvedCycle>,
    pub timed_out: Vec<(BatchId, BranchId)>,
    pub evicted: Vec<BatchId>,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty() && self.timed_out.is_empty() && self.evicted.is_empty()
    }
}

enum DetectorState {
    Stopped,
    Running {
        shutdown: CancellationToken,
        handle: JoinHandle<()>,
    },
}

pub struct DeadlockDetector {
    store: Arc<ExecutionStateStore>,
    interval: Duration,
    policy: DeadlockPolicy,
    retention: Duration,
    state: Mutex<DetectorState>,
}

impl DeadlockDetector {
    pub fn new(
        store: Arc<ExecutionStateStore>,
        config: &DeadlockDetectorConfig,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            interval: config.interval,
            policy: config.policy,
            retention,
            state: Mutex::new(DetectorState::Stopped),
        }
    }

    pub fn policy(&self) -> DeadlockPolicy {
        self.policy
    }

    pub fn is_running(&self) -> bool {
        match &*self.state.lock() {
            DetectorState::Running { handle, .. } => !handle.is_finished(),
            DetectorState::Stopped => false,
        }
    }

    /// Start the monitoring loop. Returns `false` if it was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        if let DetectorState::Running { handle, .. } = &*state {
            if !handle.is_finished() {
                debug!("Deadlock detector already running");
                return false;
            }
        }

        let shutdown = CancellationToken::new();
        let detector = Arc::clone(self);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { detector.run(token).await });
        *state = DetectorState::Running { shutdown, handle };
        true
    }

    /// Stop the monitoring loop. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        let previous = std::mem::replace(&mut *self.state.lock(), DetectorState::Stopped);
        match previous {
            DetectorState::Running { shutdown, .. } => {
                shutdown.cancel();
                true
            }
            DetectorState::Stopped => false,
        }
    }

    async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval = ?self.interval,
            policy = self.policy.as_str(),
            "Starting deadlock detector"
        );

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let report = self.scan_once();
                    if !report.is_empty() {
                        debug!(
                            cycles = report.cycles.len(),
                            timed_out = report.timed_out.len(),
                            evicted = report.evicted.len(),
                            "Deadlock detector cycle completed"
                        );
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping deadlock detector");
                    break;
                }
            }
        }
    }

    /// Run one detection pass synchronously.
    pub fn scan_once(&self) -> ScanReport {
        let mut report = ScanReport::default();
        // closing edges of cycles nobody can cancel, skipped for the rest of the scan
        let mut stuck: Vec<(WaitNodeId, WaitNodeId)> = Vec::new();

        while report.cycles.len() < MAX_CYCLES_PER_SCAN {
            let Some(detected) = self.store.find_cycle_skipping(&stuck) else {
                break;
            };
            let resolved = self.resolve(detected.cycle, &detected.candidates);
            if resolved.victims.is_empty() {
                if let (Some(first), Some(last)) = (resolved.cycle.first(), resolved.cycle.last()) {
                    stuck.push((last.clone(), first.clone()));
                }
            }
            report.cycles.push(resolved);
        }

        let now = Instant::now();
        report.timed_out = self.store.sweep_timeouts(now);
        for (batch_id, branch_id) in &report.timed_out {
            debug!(batch_id = %batch_id, branch_id = %branch_id, "Timed out overdue branch");
        }
        report.evicted = self.store.evict_expired(now, self.retention);
        report
    }

    fn resolve(
        &self,
        cycle: Vec<WaitNodeId>,
        candidates: &[VictimCandidate],
    ) -> ResolvedCycle {
        let path = cycle
            .iter()
            .map(WaitNodeId::as_str)
            .collect::<Vec<_>>()
            .join(" -> ");
        warn!(cycle = %path, "Deadlock detected");
        self.store.event_bus().publish(EngineEvent::DeadlockDetected {
            cycle: cycle.clone(),
            detected_at: Utc::now(),
        });

        let victims = self.policy.select_victims(candidates);
        if victims.is_empty() {
            warn!(cycle = %path, "No cancellable participant in deadlock cycle");
            return ResolvedCycle { cycle, victims };
        }

        for victim in &victims {
            if self.store.cancel_node(victim) {
                info!(victim = %victim, policy = self.policy.as_str(), "Cancelled deadlock victim");
            }
        }
        metrics::counter!("aegis_parallel_deadlocks_total", "policy" => self.policy.as_str())
            .increment(1);
        self.store.event_bus().publish(EngineEvent::DeadlockResolved {
            cycle: cycle.clone(),
            victims: victims.clone(),
            policy: self.policy.as_str().to_string(),
            resolved_at: Utc::now(),
        });

        ResolvedCycle { cycle, victims }
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        if let DetectorState::Running { shutdown, .. } = &*self.state.get_mut() {
            shutdown.cancel();
        }
    }
}
