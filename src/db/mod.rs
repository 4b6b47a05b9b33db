use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Create the ledger and result tables if they do not exist.
///
/// Both table names are configurable, so the schema is issued at startup
/// instead of through fixed-name migrations.
pub async fn ensure_schema(pool: &PgPool, ledger_table: &str, results_table: &str) -> Result<(), sqlx::Error> {
    let statements = [
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {ledger_table} (
                id               TEXT PRIMARY KEY,
                parent_id        TEXT NOT NULL,
                batch_id         TEXT NOT NULL,
                stage            TEXT NOT NULL,
                input_ref        TEXT NOT NULL,
                output_ref       TEXT,
                inference_job_id TEXT,
                attempts         INTEGER NOT NULL DEFAULT 0,
                error            TEXT,
                created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ),
        format!("CREATE INDEX IF NOT EXISTS {ledger_table}_batch_idx ON {ledger_table} (batch_id)"),
        format!("CREATE INDEX IF NOT EXISTS {ledger_table}_parent_idx ON {ledger_table} (parent_id)"),
        format!("CREATE INDEX IF NOT EXISTS {ledger_table}_stage_updated_idx ON {ledger_table} (stage, updated_at)"),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {results_table} (
                id         TEXT PRIMARY KEY,
                record_id  TEXT NOT NULL,
                input_text TEXT NOT NULL,
                class      TEXT NOT NULL,
                rationale  TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ),
    ];

    for statement in &statements {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub mod queries;
