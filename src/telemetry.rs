use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// Initialize structured JSON logging. `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Install the Prometheus recorder and register metric descriptions.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

/// Install the recorder behind its own scrape listener, for processes without a router.
pub fn init_metrics_listener(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(
        "pipeline_messages_total",
        "Work items handled, by stage and disposition"
    );
    metrics::describe_histogram!(
        "pipeline_stage_duration_seconds",
        metrics::Unit::Seconds,
        "Time spent in one stage invocation"
    );
    metrics::describe_gauge!(
        "pipeline_in_flight",
        "Work items currently being processed, by stage"
    );
    metrics::describe_counter!(
        "pipeline_ack_failures_total",
        "Acknowledgements rejected because the receipt had expired"
    );
    metrics::describe_counter!(
        "pipeline_parents_completed_total",
        "Source files whose every record reached a terminal stage"
    );
    metrics::describe_gauge!("queue_visible_messages", "Messages ready for delivery");
    metrics::describe_gauge!("queue_dead_letters", "Messages parked in the dead-letter queue");
    metrics::describe_counter!(
        "inference_jobs_submitted_total",
        "Batch inference jobs started"
    );
    metrics::describe_gauge!(
        "ledger_stale_records",
        "Non-terminal ledger rows older than the stale threshold"
    );
    metrics::describe_counter!(
        "harvest_records_total",
        "Harvested records, by outcome"
    );
}
