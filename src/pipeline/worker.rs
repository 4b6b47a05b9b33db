//! Shared harness that drives one stage from its queue.
//!
//! Every stage follows the same delivery contract:
//!
//! - success: acknowledge
//! - terminal error: mark the affected ledger rows `FAILED`, then acknowledge
//! - transient error or timeout: leave unacknowledged, so the visibility
//!   timeout redelivers it and the redrive policy eventually dead-letters it

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::WorkerSettings;
use crate::models::job::StageKind;
use crate::models::work_item::{EventError, ObjectRef, WorkItem};
use crate::services::governor::ConcurrencyGovernor;
use crate::services::inference::InferenceError;
use crate::services::ledger::LedgerError;
use crate::services::notifications::ArtifactError;
use crate::services::queue::{QueueError, WorkQueue};
use crate::services::results::SinkError;
use crate::services::storage::StorageError;

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// One pipeline transformation, invoked once per work item.
#[async_trait]
pub trait StageHandler: Send + Sync + 'static {
    fn kind(&self) -> StageKind;

    async fn process(&self, object: &ObjectRef) -> Result<StageOutcome, StageError>;

    /// Record a terminal failure against the ledger rows `object` covers.
    async fn record_failure(&self, object: &ObjectRef, error: &StageError) -> Result<(), StageError>;

    /// Note a transient failure before the item is left for redelivery.
    async fn record_retry(&self, _object: &ObjectRef, _error: &StageError) -> Result<(), StageError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Prepared {
        parent_id: String,
        batches: usize,
        records: usize,
    },
    Submitted {
        batch_id: String,
        job_id: String,
        records: usize,
    },
    Harvested {
        batch_id: String,
        completed: usize,
        failed: usize,
    },
    /// A previous delivery already moved every affected row past this stage.
    AlreadyHandled { reason: String },
}

/// What the harness did with a delivered item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed(StageOutcome),
    Failed { error: String },
    Retry { error: String },
    TimedOut,
}

impl Disposition {
    pub fn acknowledges(&self) -> bool {
        matches!(self, Disposition::Completed(_) | Disposition::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Completed(_) => "completed",
            Disposition::Failed { .. } => "failed",
            Disposition::Retry { .. } => "retry",
            Disposition::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Malformed notification: {0}")]
    Event(#[from] EventError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("Result sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Malformed input: {0}")]
    Malformed(String),

    #[error("Unsupported input: {0}")]
    Unsupported(String),

    #[error("Not ready: {0}")]
    NotReady(String),
}

fn storage_is_terminal(error: &StorageError) -> bool {
    matches!(
        error,
        StorageError::NotFound(_) | StorageError::ArtifactConflict(_)
    )
}

impl StageError {
    /// Terminal errors will fail the same way on every redelivery.
    pub fn is_terminal(&self) -> bool {
        match self {
            StageError::Event(_) | StageError::Malformed(_) | StageError::Unsupported(_) => true,
            StageError::Storage(e) => storage_is_terminal(e),
            StageError::Artifact(ArtifactError::Storage(e)) => storage_is_terminal(e),
            StageError::Ledger(e) => {
                matches!(e, LedgerError::IllegalTransition { .. } | LedgerError::NotFound(_))
            }
            StageError::Inference(e) => !e.is_retryable(),
            StageError::Artifact(ArtifactError::Queue(_))
            | StageError::Sink(_)
            | StageError::Queue(_)
            | StageError::NotReady(_) => false,
        }
    }
}

/// Bounded-concurrency consumer of one stage queue.
pub struct StageWorker<S: StageHandler> {
    stage: Arc<S>,
    queue: Arc<dyn WorkQueue>,
    governor: ConcurrencyGovernor,
    settings: WorkerSettings,
}

impl<S: StageHandler> Clone for StageWorker<S> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage.clone(),
            queue: self.queue.clone(),
            governor: self.governor.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<S: StageHandler> StageWorker<S> {
    pub fn new(
        stage: Arc<S>,
        queue: Arc<dyn WorkQueue>,
        governor: ConcurrencyGovernor,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            stage,
            queue,
            governor,
            settings,
        }
    }

    pub fn kind(&self) -> StageKind {
        self.stage.kind()
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    /// Consume until `token` is cancelled, then wait for in-flight items.
    ///
    /// A permit is taken before each receive, so no item is pulled off the
    /// queue (and made invisible) while the stage is at capacity.
    pub async fn run(self, token: CancellationToken) {
        let kind = self.kind();
        tracing::info!(
            stage = %kind,
            queue = self.queue.name(),
            max_concurrency = self.governor.max_concurrency(),
            "Stage worker started"
        );

        loop {
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = self.governor.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = token.cancelled() => break,
                received = self.queue.receive(1, self.settings.receive_wait) => received,
            };

            match received {
                Ok(mut items) => {
                    let Some(item) = items.pop() else {
                        tracing::trace!(stage = %kind, "No messages available");
                        continue;
                    };
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        worker.handle(item).await;
                    });
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(stage = %kind, error = %e, "Receive failed, backing off");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        tracing::info!(stage = %kind, in_flight = self.governor.in_flight(), "Draining stage worker");
        if self.governor.drain().await.is_err() {
            tracing::warn!(stage = %kind, "Governor closed while draining");
        }
        tracing::info!(stage = %kind, "Stage worker stopped");
    }

    /// Receive and process at most one item inline.
    pub async fn poll_once(&self) -> Result<Option<Disposition>, QueueError> {
        let Ok(_permit) = self.governor.acquire().await else {
            return Ok(None);
        };
        let mut items = self.queue.receive(1, self.settings.receive_wait).await?;
        match items.pop() {
            Some(item) => Ok(Some(self.handle(item).await)),
            None => Ok(None),
        }
    }

    /// Process one delivery and apply the ack policy.
    pub async fn handle(&self, item: WorkItem) -> Disposition {
        let kind = self.kind();
        let span = tracing::info_span!(
            "stage",
            stage = %kind,
            message_id = %item.message_id,
            delivery_count = item.delivery_count
        );

        async {
            let started = Instant::now();
            let disposition =
                match tokio::time::timeout(self.settings.execution_budget, self.dispatch(&item)).await {
                    Ok(disposition) => disposition,
                    Err(_) => {
                        tracing::warn!(
                            budget_secs = self.settings.execution_budget.as_secs(),
                            "Stage invocation exceeded its execution budget"
                        );
                        Disposition::TimedOut
                    }
                };

            if disposition.acknowledges() {
                if let Err(e) = self.queue.acknowledge(&item.receipt).await {
                    // The item will be redelivered; the ledger makes the repeat a no-op.
                    metrics::counter!("pipeline_ack_failures_total", "stage" => kind.to_string())
                        .increment(1);
                    tracing::warn!(error = %e, "Acknowledge failed");
                }
            }

            metrics::counter!(
                "pipeline_messages_total",
                "stage" => kind.to_string(),
                "disposition" => disposition.label()
            )
            .increment(1);
            metrics::histogram!("pipeline_stage_duration_seconds", "stage" => kind.to_string())
                .record(started.elapsed().as_secs_f64());

            disposition
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, item: &WorkItem) -> Disposition {
        let object = match item.object() {
            Ok(object) => object,
            Err(e) => {
                tracing::error!(error = %e, body = %item.body, "Discarding unparseable message");
                return Disposition::Failed {
                    error: StageError::from(e).to_string(),
                };
            }
        };

        match self.stage.process(&object).await {
            Ok(outcome) => {
                tracing::info!(object_key = %object.key, ?outcome, "Stage completed");
                Disposition::Completed(outcome)
            }
            Err(error) if error.is_terminal() => {
                tracing::error!(object_key = %object.key, error = %error, "Terminal stage failure");
                match self.stage.record_failure(&object, &error).await {
                    Ok(()) => Disposition::Failed {
                        error: error.to_string(),
                    },
                    Err(record_error) => {
                        tracing::warn!(
                            object_key = %object.key,
                            error = %record_error,
                            "Could not record failure, leaving message for redelivery"
                        );
                        Disposition::Retry {
                            error: record_error.to_string(),
                        }
                    }
                }
            }
            Err(error) => {
                tracing::warn!(object_key = %object.key, error = %error, "Transient stage failure");
                if let Err(e) = self.stage.record_retry(&object, &error).await {
                    tracing::warn!(object_key = %object.key, error = %e, "Could not record retry");
                }
                Disposition::Retry {
                    error: error.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::services::memory_queue::MemoryQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Stage whose behaviour is scripted per call.
    struct ScriptedStage {
        results: Mutex<Vec<Result<StageOutcome, StageError>>>,
        failures_recorded: AtomicUsize,
        retries_recorded: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedStage {
        fn new(results: Vec<Result<StageOutcome, StageError>>) -> Self {
            Self {
                results: Mutex::new(results),
                failures_recorded: AtomicUsize::new(0),
                retries_recorded: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl StageHandler for ScriptedStage {
        fn kind(&self) -> StageKind {
            StageKind::Submission
        }

        async fn process(&self, _object: &ObjectRef) -> Result<StageOutcome, StageError> {
            tokio::time::sleep(self.delay).await;
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                return Ok(done());
            }
            results.remove(0)
        }

        async fn record_failure(&self, _object: &ObjectRef, _error: &StageError) -> Result<(), StageError> {
            self.failures_recorded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn record_retry(&self, _object: &ObjectRef, _error: &StageError) -> Result<(), StageError> {
            self.retries_recorded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn done() -> StageOutcome {
        StageOutcome::AlreadyHandled {
            reason: "scripted".into(),
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            receive_wait: Duration::from_secs(1),
            execution_budget: Duration::from_secs(5),
        }
    }

    fn queue() -> Arc<MemoryQueue> {
        Arc::new(MemoryQueue::new(
            "submission",
            QueueSettings {
                visibility_timeout: Duration::from_secs(30),
                max_receive_count: 3,
                poll_interval: Duration::from_millis(100),
            },
        ))
    }

    fn worker(stage: ScriptedStage, queue: Arc<MemoryQueue>) -> (StageWorker<ScriptedStage>, Arc<ScriptedStage>) {
        let stage = Arc::new(stage);
        let worker = StageWorker::new(
            stage.clone(),
            queue,
            ConcurrencyGovernor::new(StageKind::Submission, 2),
            settings(),
        );
        (worker, stage)
    }

    async fn enqueue_object(queue: &MemoryQueue) {
        queue
            .enqueue_object(&ObjectRef::new("internal", "batch_input/p/p-batch1.jsonl"))
            .await
            .unwrap();
    }

    #[test]
    fn test_error_classification() {
        assert!(StageError::Malformed("x".into()).is_terminal());
        assert!(StageError::Storage(StorageError::NotFound("k".into())).is_terminal());
        assert!(StageError::Artifact(ArtifactError::Storage(StorageError::ArtifactConflict("k".into())))
            .is_terminal());
        assert!(!StageError::Inference(InferenceError::Throttled("slow down".into())).is_terminal());
        assert!(StageError::Inference(InferenceError::Rejected {
            status: 400,
            body: String::new()
        })
        .is_terminal());
        assert!(!StageError::NotReady("rows".into()).is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_acknowledges() {
        let q = queue();
        enqueue_object(&q).await;
        let (worker, _) = worker(ScriptedStage::new(vec![]), q.clone());

        let disposition = worker.poll_once().await.unwrap().unwrap();
        assert_eq!(disposition, Disposition::Completed(done()));
        assert_eq!(q.depth().await.unwrap().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_recorded_and_acknowledged() {
        let q = queue();
        enqueue_object(&q).await;
        let (worker, stage) = worker(
            ScriptedStage::new(vec![Err(StageError::Malformed("bad row".into()))]),
            q.clone(),
        );

        let disposition = worker.poll_once().await.unwrap().unwrap();
        assert!(matches!(disposition, Disposition::Failed { .. }));
        assert_eq!(stage.failures_recorded.load(Ordering::SeqCst), 1);
        assert_eq!(q.depth().await.unwrap(), Default::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_is_left_for_redelivery() {
        let q = queue();
        enqueue_object(&q).await;
        let (worker, stage) = worker(
            ScriptedStage::new(vec![Err(StageError::NotReady("rows".into()))]),
            q.clone(),
        );

        let disposition = worker.poll_once().await.unwrap().unwrap();
        assert!(matches!(disposition, Disposition::Retry { .. }));
        assert_eq!(stage.retries_recorded.load(Ordering::SeqCst), 1);
        assert_eq!(q.depth().await.unwrap().in_flight, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = worker.poll_once().await.unwrap().unwrap();
        assert_eq!(second, Disposition::Completed(done()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_crash() {
        let q = queue();
        enqueue_object(&q).await;
        let mut stage = ScriptedStage::new(vec![]);
        stage.delay = Duration::from_secs(10);
        let (worker, _) = worker(stage, q.clone());

        let disposition = worker.poll_once().await.unwrap().unwrap();
        assert_eq!(disposition, Disposition::TimedOut);
        assert_eq!(q.depth().await.unwrap().in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_body_is_acknowledged() {
        let q = queue();
        q.enqueue("not an event".into()).await.unwrap();
        let (worker, stage) = worker(ScriptedStage::new(vec![]), q.clone());

        let disposition = worker.poll_once().await.unwrap().unwrap();
        assert!(matches!(disposition, Disposition::Failed { .. }));
        assert_eq!(stage.failures_recorded.load(Ordering::SeqCst), 0);
        assert_eq!(q.depth().await.unwrap(), Default::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_respects_cap_and_drains_on_shutdown() {
        let q = queue();
        for _ in 0..6 {
            enqueue_object(&q).await;
        }
        let mut stage = ScriptedStage::new(vec![]);
        stage.delay = Duration::from_millis(200);
        let (worker, _) = worker(stage, q.clone());
        let governor = worker.governor().clone();

        let token = CancellationToken::new();
        let handle = tokio::spawn(worker.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(2)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(governor.peak(), 2);
        assert_eq!(governor.in_flight(), 0);
        assert_eq!(q.depth().await.unwrap(), Default::default());
    }
}
