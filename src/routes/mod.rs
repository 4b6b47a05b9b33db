pub mod health;
pub mod jobs;
pub mod metrics;
pub mod queues;

use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// Operations API: health, ledger inspection and dead-letter management.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs/{id}", get(jobs::get_job))
        .route("/api/v1/batches/{batch_id}", get(jobs::get_batch))
        .route("/api/v1/ledger/stale", get(jobs::stale_records))
        .route("/api/v1/queues", get(queues::queue_depths))
        .route("/api/v1/queues/{stage}/dead-letters", get(queues::dead_letters))
        .route("/api/v1/queues/{stage}/redrive", post(queues::redrive))
        .with_state(state)
}
