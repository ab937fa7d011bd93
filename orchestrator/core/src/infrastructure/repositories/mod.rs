// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the persistence contracts defined in
//! `crate::domain::repository`.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Persist and retrieve terminal batches
//! - **Pattern:** Repository (DDD), Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **InMemoryBatchRepository** - Thread-safe HashMap-backed storage for
//!   development, the CLI and tests

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::batch::{BatchId, BatchSnapshot};
use crate::domain::repository::{BatchRepository, RepositoryError};

#[derive(Clone, Default)]
pub struct InMemoryBatchRepository {
    batches: Arc<RwLock<HashMap<BatchId, BatchSnapshot>>>,
}

impl InMemoryBatchRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchRepository for InMemoryBatchRepository {
    async fn save(&self, snapshot: &BatchSnapshot) -> Result<(), RepositoryError> {
        self.batches
            .write()
            .insert(snapshot.batch_id, snapshot.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: BatchId) -> Result<Option<BatchSnapshot>, RepositoryError> {
        Ok(self.batches.read().get(&id).cloned())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<BatchSnapshot>, RepositoryError> {
        let mut batches: Vec<BatchSnapshot> = self.batches.read().values().cloned().collect();
        batches.sort_by(|a, b| b.terminated_at.cmp(&a.terminated_at));
        batches.truncate(limit);
        Ok(batches)
    }

    async fn delete(&self, id: BatchId) -> Result<(), RepositoryError> {
        self.batches
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }
}
