use batch_classify::{
    config::AppConfig,
    db,
    models::job::StageKind,
    pipeline::{Pipeline, StageQueues},
    services::{
        inference::HttpInferenceClient, ledger::PgLedger, results::PgResultSink,
        storage::S3ObjectStore,
    },
    telemetry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    tracing::info!("Starting pipeline worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    let settings = config.settings().expect("Failed to derive pipeline settings");
    let stages = config.stages().expect("Failed to parse WORKER_STAGES");

    let metrics_addr = config
        .worker_metrics_addr
        .parse()
        .expect("WORKER_METRICS_ADDR must be a socket address");
    telemetry::init_metrics_listener(metrics_addr).expect("Failed to install Prometheus metrics exporter");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::ensure_schema(&db_pool, &config.job_status_table, &config.results_table)
        .await
        .expect("Failed to create ledger schema");

    // Initialize services
    tracing::info!("Initializing services");
    let store = S3ObjectStore::new(
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object store");

    let queues = StageQueues::connect_redis(&config.redis_url, &config.queue_prefix, &settings.queue)
        .expect("Failed to initialize stage queues");

    let inference = HttpInferenceClient::new(
        &config.inference_endpoint,
        config.inference_api_token.clone(),
        settings.submission.timeout,
    )
    .expect("Failed to initialize inference client");

    let ledger = Arc::new(PgLedger::new(db_pool.clone(), config.job_status_table.clone()));
    let sink = Arc::new(PgResultSink::new(db_pool, config.results_table.clone()));

    let pipeline = Pipeline::new(
        settings,
        Arc::new(store),
        queues,
        ledger,
        sink,
        Arc::new(inference),
    );

    let result_poll = stages
        .contains(&StageKind::Harvest)
        .then(|| Duration::from_secs(config.result_poll_interval_secs));

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, draining in-flight work");
        }
        shutdown.cancel();
    });

    tracing::info!(stages = ?stages, "Worker ready, consuming stage queues");
    pipeline.run(&stages, result_poll, token).await;
    tracing::info!("Worker stopped");
}
