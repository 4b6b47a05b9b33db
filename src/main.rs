use axum::routing::get;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use batch_classify::{
    app_state::AppState,
    config::AppConfig,
    db,
    pipeline::StageQueues,
    routes,
    services::ledger::PgLedger,
    telemetry,
};

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    let settings = config.settings().expect("Failed to derive pipeline settings");

    tracing::info!("Initializing batch-classify operations server");

    let prometheus_handle = Arc::new(telemetry::init_metrics().expect("Failed to install Prometheus metrics recorder"));

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Ensuring ledger and result tables");
    db::ensure_schema(&db_pool, &config.job_status_table, &config.results_table)
        .await
        .expect("Failed to create ledger schema");

    tracing::info!("Connecting to Redis stage queues");
    let queues = StageQueues::connect_redis(&config.redis_url, &config.queue_prefix, &settings.queue)
        .expect("Failed to initialize stage queues");

    let ledger = Arc::new(PgLedger::new(db_pool, config.job_status_table.clone()));
    let state = AppState::new(ledger, queues, Duration::from_secs(config.stale_after_secs));

    let app = routes::api_router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024));

    tracing::info!("Starting batch-classify on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .expect("Server error");
}
