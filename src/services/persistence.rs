use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

use crate::db::queries;
use crate::models::result::FinalResult;

/// Hand-off point for terminal results.
///
/// Implementations must be idempotent keyed by `work_id`: delivering the same
/// result twice leaves exactly one stored record.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn persist(&self, result: &FinalResult) -> Result<(), PersistError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Result sink unavailable: {0}")]
    Unavailable(String),
}

/// PostgreSQL-backed sink using an upsert on `work_id`.
pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultSink for PgResultStore {
    async fn persist(&self, result: &FinalResult) -> Result<(), PersistError> {
        queries::upsert_final_result(&self.pool, result).await?;
        Ok(())
    }
}

/// In-process sink, used when no database is configured.
#[derive(Default)]
pub struct InMemoryResultStore {
    records: RwLock<HashMap<Uuid, FinalResult>>,
    writes: AtomicU64,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, work_id: Uuid) -> Option<FinalResult> {
        self.read().get(&work_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of persist calls accepted, including re-deliveries.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, FinalResult>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ResultSink for InMemoryResultStore {
    async fn persist(&self, result: &FinalResult) -> Result<(), PersistError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| PersistError::Unavailable("result store lock poisoned".to_string()))?;
        records.insert(result.work_id, result.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
