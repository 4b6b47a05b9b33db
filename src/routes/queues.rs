use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::app_state::AppState;
use crate::models::job::StageKind;
use crate::models::work_item::DeadLetter;
use crate::services::queue::{QueueDepth, WorkQueue};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Serialize)]
pub struct StageQueueDepth {
    pub stage: StageKind,
    pub queue: String,
    #[serde(flatten)]
    pub depth: QueueDepth,
}

#[derive(Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct RedriveResponse {
    pub stage: StageKind,
    pub redriven: usize,
}

fn parse_stage(stage: &str) -> Result<StageKind, StatusCode> {
    StageKind::from_str(stage).map_err(|_| StatusCode::NOT_FOUND)
}

fn limit(params: &LimitParams) -> usize {
    params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// GET /api/v1/queues — Visible, in-flight and dead-lettered counts per stage queue.
pub async fn queue_depths(State(state): State<AppState>) -> Result<Json<Vec<StageQueueDepth>>, StatusCode> {
    let mut depths = Vec::new();
    for (stage, queue) in state.queues.iter() {
        let depth = queue.depth().await.map_err(|e| {
            tracing::error!(queue = queue.name(), error = %e, "Queue depth lookup failed");
            StatusCode::SERVICE_UNAVAILABLE
        })?;

        let label = stage.to_string();
        metrics::gauge!("queue_visible_messages", "stage" => label.clone()).set(depth.visible as f64);
        metrics::gauge!("queue_dead_letters", "stage" => label).set(depth.dead_lettered as f64);

        depths.push(StageQueueDepth {
            stage,
            queue: queue.name().to_string(),
            depth,
        });
    }
    Ok(Json(depths))
}

/// GET /api/v1/queues/{stage}/dead-letters — Inspect parked messages, oldest first.
pub async fn dead_letters(
    State(state): State<AppState>,
    Path(stage): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<DeadLetter>>, StatusCode> {
    let stage = parse_stage(&stage)?;
    let queue = state.queues.for_stage(stage);
    let letters = queue.dead_letters(limit(&params)).await.map_err(|e| {
        tracing::error!(queue = queue.name(), error = %e, "Dead-letter listing failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok(Json(letters))
}

/// POST /api/v1/queues/{stage}/redrive — Move dead letters back onto the stage queue.
pub async fn redrive(
    State(state): State<AppState>,
    Path(stage): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<RedriveResponse>, StatusCode> {
    let stage = parse_stage(&stage)?;
    let queue = state.queues.for_stage(stage);
    let redriven = queue.redrive(limit(&params)).await.map_err(|e| {
        tracing::error!(queue = queue.name(), error = %e, "Redrive failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    tracing::info!(queue = queue.name(), redriven, "Dead letters redriven");
    Ok(Json(RedriveResponse { stage, redriven }))
}
