// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod repositories;
pub mod state_store;

pub use event_bus::{BatchEventReceiver, EventBus, EventBusError, EventReceiver};
pub use repositories::InMemoryBatchRepository;
pub use state_store::{ExecutionStateStore, RecordOutcome, WaitNodeOwner};
