use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::db::queries;
use crate::models::classification::ClassificationResult;

/// Customer-visible store of classifications, keyed by ledger row id so that
/// record ids reused across source files never collide.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Insert or overwrite; writing the same result twice is a no-op.
    async fn upsert(&self, row_id: &str, result: &ClassificationResult) -> Result<(), SinkError>;

    async fn get(&self, row_id: &str) -> Result<Option<ClassificationResult>, SinkError>;
}

pub struct PgResultSink {
    pool: PgPool,
    table: String,
}

impl PgResultSink {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl ResultSink for PgResultSink {
    async fn upsert(&self, row_id: &str, result: &ClassificationResult) -> Result<(), SinkError> {
        Ok(queries::upsert_result(&self.pool, &self.table, row_id, result).await?)
    }

    async fn get(&self, row_id: &str) -> Result<Option<ClassificationResult>, SinkError> {
        Ok(queries::get_result(&self.pool, &self.table, row_id).await?)
    }
}

#[derive(Default)]
pub struct MemoryResultSink {
    rows: RwLock<HashMap<String, ClassificationResult>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn upsert(&self, row_id: &str, result: &ClassificationResult) -> Result<(), SinkError> {
        self.rows.write().await.insert(row_id.to_string(), result.clone());
        Ok(())
    }

    async fn get(&self, row_id: &str) -> Result<Option<ClassificationResult>, SinkError> {
        Ok(self.rows.read().await.get(row_id).cloned())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
