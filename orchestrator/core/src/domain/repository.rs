// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Batch Repository Interface
//!
//! Persistence contract for terminal batches. The engine writes a final
//! [`BatchSnapshot`] when a batch seals and reads it back once the live state
//! has been evicted from the execution state store.
//!
//! | Trait | Record | Implementations |
//! |-------|--------|----------------|
//! | `BatchRepository` | `BatchSnapshot` | `InMemoryBatchRepository` |

use async_trait::async_trait;

use crate::domain::batch::{BatchId, BatchSnapshot};

#[async_trait]
pub trait BatchRepository: Send + Sync {
    /// Save a terminal batch (create or replace).
    async fn save(&self, snapshot: &BatchSnapshot) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: BatchId) -> Result<Option<BatchSnapshot>, RepositoryError>;

    /// Most recently terminated batches first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<BatchSnapshot>, RepositoryError>;

    async fn delete(&self, id: BatchId) -> Result<(), RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
