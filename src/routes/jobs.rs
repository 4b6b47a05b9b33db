use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::models::job::{JobRecord, StageCounts};

const DEFAULT_STALE_LIMIT: usize = 100;
const MAX_STALE_LIMIT: usize = 1000;

#[derive(Serialize)]
pub struct BatchStatusResponse {
    pub batch_id: String,
    pub counts: StageCounts,
    pub records: Vec<JobRecord>,
}

#[derive(Deserialize)]
pub struct StaleParams {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct StaleRecordsResponse {
    pub stale_after_secs: u64,
    pub records: Vec<JobRecord>,
}

/// GET /api/v1/jobs/{id} — One ledger row.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, StatusCode> {
    match state.ledger.get(&id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(job_id = %id, error = %e, "Ledger lookup failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/v1/batches/{batch_id} — Every row of a batch with per-stage counts.
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchStatusResponse>, StatusCode> {
    let records = state.ledger.list_batch(&batch_id).await.map_err(|e| {
        tracing::error!(batch_id = %batch_id, error = %e, "Ledger batch listing failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if records.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }

    Ok(Json(BatchStatusResponse {
        counts: StageCounts::tally(&records),
        batch_id,
        records,
    }))
}

/// GET /api/v1/ledger/stale — Non-terminal rows not updated within the stale threshold.
pub async fn stale_records(
    State(state): State<AppState>,
    Query(params): Query<StaleParams>,
) -> Result<Json<StaleRecordsResponse>, StatusCode> {
    let limit = params.limit.unwrap_or(DEFAULT_STALE_LIMIT).clamp(1, MAX_STALE_LIMIT);
    let threshold =
        chrono::Duration::from_std(state.stale_after).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let records = state
        .ledger
        .list_stale(Utc::now() - threshold, limit)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Stale ledger listing failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    metrics::gauge!("ledger_stale_records").set(records.len() as f64);
    if !records.is_empty() {
        tracing::warn!(count = records.len(), "Ledger rows stuck in a non-terminal stage");
    }

    Ok(Json(StaleRecordsResponse {
        stale_after_secs: state.stale_after.as_secs(),
        records,
    }))
}
