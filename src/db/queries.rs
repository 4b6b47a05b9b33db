//! SQL for the job status ledger and the customer-visible results table.
//!
//! Table names come from configuration and are validated against
//! `^[a-z_][a-z0-9_]{0,62}$` at startup before being formatted into queries.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use crate::models::classification::ClassificationResult;
use crate::models::job::{JobRecord, NewJobRecord, Stage, StageUpdate};

const JOB_COLUMNS: &str =
    "id, parent_id, batch_id, stage, input_ref, output_ref, inference_job_id, attempts, error, created_at, updated_at";

fn job_from_row(row: &PgRow) -> Result<JobRecord, sqlx::Error> {
    let stage: String = row.try_get("stage")?;
    let stage = Stage::from_str(&stage).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(JobRecord {
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        batch_id: row.try_get("batch_id")?,
        stage,
        input_ref: row.try_get("input_ref")?,
        output_ref: row.try_get("output_ref")?,
        inference_job_id: row.try_get("inference_job_id")?,
        attempts: row.try_get("attempts")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a ledger row in `PREPARING`. Returns false if the id already exists.
pub async fn insert_job(pool: &PgPool, table: &str, job: &NewJobRecord) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO {table} (id, parent_id, batch_id, stage, input_ref)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO NOTHING
        RETURNING id
        "#
    ))
    .bind(&job.id)
    .bind(&job.parent_id)
    .bind(&job.batch_id)
    .bind(Stage::Preparing.to_string())
    .bind(&job.input_ref)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

pub async fn get_job(pool: &PgPool, table: &str, id: &str) -> Result<Option<JobRecord>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM {table} WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Conditional stage write. `None` means the stored stage was not `update.expected`
/// (or the row does not exist).
pub async fn transition_job(
    pool: &PgPool,
    table: &str,
    id: &str,
    update: &StageUpdate,
) -> Result<Option<JobRecord>, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        UPDATE {table}
        SET stage = $3,
            output_ref = COALESCE($4, output_ref),
            inference_job_id = COALESCE($5, inference_job_id),
            error = COALESCE($6, error),
            updated_at = NOW()
        WHERE id = $1 AND stage = $2
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(update.expected.to_string())
    .bind(update.next.to_string())
    .bind(update.output_ref.as_deref())
    .bind(update.inference_job_id.as_deref())
    .bind(update.error.as_deref())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Bump the attempt counter and record the last error. Returns false for an unknown id.
pub async fn record_attempt(pool: &PgPool, table: &str, id: &str, error: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(&format!(
        r#"
        UPDATE {table}
        SET attempts = attempts + 1,
            error = $2,
            updated_at = NOW()
        WHERE id = $1
        "#
    ))
    .bind(id)
    .bind(error)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn list_jobs_by_batch(pool: &PgPool, table: &str, batch_id: &str) -> Result<Vec<JobRecord>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM {table} WHERE batch_id = $1 ORDER BY id"
    ))
    .bind(batch_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

pub async fn list_jobs_by_parent(pool: &PgPool, table: &str, parent_id: &str) -> Result<Vec<JobRecord>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM {table} WHERE parent_id = $1 ORDER BY id"
    ))
    .bind(parent_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Non-terminal rows not updated since `before`, oldest first.
pub async fn list_stale_jobs(
    pool: &PgPool,
    table: &str,
    before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<JobRecord>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {JOB_COLUMNS}
        FROM {table}
        WHERE stage NOT IN ('COMPLETED', 'FAILED')
          AND updated_at < $1
        ORDER BY updated_at ASC
        LIMIT $2
        "#
    ))
    .bind(before)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(job_from_row).collect()
}

/// Idempotent upsert keyed by ledger row id.
pub async fn upsert_result(
    pool: &PgPool,
    table: &str,
    row_id: &str,
    result: &ClassificationResult,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        r#"
        INSERT INTO {table} (id, record_id, input_text, class, rationale)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE
        SET record_id = EXCLUDED.record_id,
            input_text = EXCLUDED.input_text,
            class = EXCLUDED.class,
            rationale = EXCLUDED.rationale,
            updated_at = NOW()
        "#
    ))
    .bind(row_id)
    .bind(&result.id)
    .bind(&result.input_text)
    .bind(&result.class)
    .bind(&result.rationale)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_result(
    pool: &PgPool,
    table: &str,
    row_id: &str,
) -> Result<Option<ClassificationResult>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT record_id, input_text, class, rationale FROM {table} WHERE id = $1"
    ))
    .bind(row_id)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some(r) => Some(ClassificationResult {
            id: r.try_get("record_id")?,
            input_text: r.try_get("input_text")?,
            class: r.try_get("class")?,
            rationale: r.try_get("rationale")?,
        }),
        None => None,
    })
}
