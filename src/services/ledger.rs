use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::db::queries;
use crate::models::job::{JobRecord, NewJobRecord, Stage, StageUpdate};

/// Result of a conditional stage write.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(JobRecord),
    /// The stored stage no longer matched the expected one. Callers treat the
    /// row as already handled.
    Stale { current: Stage },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

/// Durable per-record lifecycle table.
///
/// All stage changes go through [`JobLedger::transition`], which only writes
/// when the stored stage equals `update.expected`. There are no locks: two
/// workers racing on the same row both issue the write and exactly one wins.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Insert a row in `PREPARING`. Returns false when the id already exists.
    async fn create(&self, job: NewJobRecord) -> Result<bool, LedgerError>;

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, LedgerError>;

    async fn transition(&self, id: &str, update: StageUpdate) -> Result<TransitionOutcome, LedgerError>;

    /// Count a failed attempt against the row and remember its error.
    async fn record_attempt(&self, id: &str, error: &str) -> Result<(), LedgerError>;

    async fn list_batch(&self, batch_id: &str) -> Result<Vec<JobRecord>, LedgerError>;

    async fn list_parent(&self, parent_id: &str) -> Result<Vec<JobRecord>, LedgerError>;

    /// Non-terminal rows last updated before `before`, oldest first.
    async fn list_stale(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>, LedgerError>;

    async fn health_check(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

fn check_edge(update: &StageUpdate) -> Result<(), LedgerError> {
    if !update.expected.can_transition_to(update.next) {
        return Err(LedgerError::IllegalTransition {
            from: update.expected,
            to: update.next,
        });
    }
    Ok(())
}

/// PostgreSQL-backed ledger.
pub struct PgLedger {
    pool: PgPool,
    table: String,
}

impl PgLedger {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl JobLedger for PgLedger {
    async fn create(&self, job: NewJobRecord) -> Result<bool, LedgerError> {
        Ok(queries::insert_job(&self.pool, &self.table, &job).await?)
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, LedgerError> {
        Ok(queries::get_job(&self.pool, &self.table, id).await?)
    }

    async fn transition(&self, id: &str, update: StageUpdate) -> Result<TransitionOutcome, LedgerError> {
        check_edge(&update)?;

        if let Some(record) = queries::transition_job(&self.pool, &self.table, id, &update).await? {
            return Ok(TransitionOutcome::Applied(record));
        }

        // The conditional update missed; report what is stored now.
        match queries::get_job(&self.pool, &self.table, id).await? {
            Some(record) => Ok(TransitionOutcome::Stale { current: record.stage }),
            None => Err(LedgerError::NotFound(id.to_string())),
        }
    }

    async fn record_attempt(&self, id: &str, error: &str) -> Result<(), LedgerError> {
        if !queries::record_attempt(&self.pool, &self.table, id, error).await? {
            return Err(LedgerError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_batch(&self, batch_id: &str) -> Result<Vec<JobRecord>, LedgerError> {
        Ok(queries::list_jobs_by_batch(&self.pool, &self.table, batch_id).await?)
    }

    async fn list_parent(&self, parent_id: &str) -> Result<Vec<JobRecord>, LedgerError> {
        Ok(queries::list_jobs_by_parent(&self.pool, &self.table, parent_id).await?)
    }

    async fn list_stale(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>, LedgerError> {
        Ok(queries::list_stale_jobs(&self.pool, &self.table, before, limit as i64).await?)
    }

    async fn health_check(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-process ledger with the same conditional-write semantics as [`PgLedger`].
#[derive(Default)]
pub struct MemoryLedger {
    rows: RwLock<HashMap<String, JobRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn all(&self) -> Vec<JobRecord> {
        let mut rows: Vec<JobRecord> = self.rows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    /// Rewind a row's `updated_at`, for exercising stale-row reporting.
    pub async fn backdate(&self, id: &str, updated_at: DateTime<Utc>) {
        if let Some(row) = self.rows.write().await.get_mut(id) {
            row.updated_at = updated_at;
        }
    }

    async fn select(&self, filter: impl Fn(&JobRecord) -> bool) -> Vec<JobRecord> {
        let mut rows: Vec<JobRecord> = self
            .rows
            .read()
            .await
            .values()
            .filter(|row| filter(row))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }
}

#[async_trait]
impl JobLedger for MemoryLedger {
    async fn create(&self, job: NewJobRecord) -> Result<bool, LedgerError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&job.id) {
            return Ok(false);
        }
        rows.insert(job.id.clone(), job.into_record(Utc::now()));
        Ok(true)
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>, LedgerError> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn transition(&self, id: &str, update: StageUpdate) -> Result<TransitionOutcome, LedgerError> {
        check_edge(&update)?;

        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if row.stage != update.expected {
            return Ok(TransitionOutcome::Stale { current: row.stage });
        }
        update.apply(row, Utc::now());
        Ok(TransitionOutcome::Applied(row.clone()))
    }

    async fn record_attempt(&self, id: &str, error: &str) -> Result<(), LedgerError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        row.attempts += 1;
        row.error = Some(error.to_string());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn list_batch(&self, batch_id: &str) -> Result<Vec<JobRecord>, LedgerError> {
        Ok(self.select(|row| row.batch_id == batch_id).await)
    }

    async fn list_parent(&self, parent_id: &str) -> Result<Vec<JobRecord>, LedgerError> {
        Ok(self.select(|row| row.parent_id == parent_id).await)
    }

    async fn list_stale(&self, before: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>, LedgerError> {
        let mut rows = self
            .select(|row| !row.stage.is_terminal() && row.updated_at < before)
            .await;
        rows.sort_by_key(|row| row.updated_at);
        rows.truncate(limit);
        Ok(rows)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger row not found: {0}")]
    NotFound(String),

    #[error("Illegal stage transition {from} -> {to}")]
    IllegalTransition { from: Stage, to: Stage },
}
