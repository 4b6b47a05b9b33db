//! Pipeline orchestration: object-created events flow through one queue per
//! stage, each drained by a bounded [`StageWorker`], with the ledger as the
//! only shared record of progress.
//!
//! ```text
//! customer/input/*      -> preparation queue -> PreparationStage -> internal/batch_input/*.jsonl
//! batch_input/*.jsonl   -> submission queue  -> SubmissionStage  -> inference service
//! batch_output/*.out    -> harvest queue     -> HarvestStage     -> results table + customer/output/*
//! ```

pub mod harvest;
pub mod preparation;
pub mod submission;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{BucketLayout, PipelineSettings, QueueSettings};
use crate::models::job::{JobRecord, Stage, StageKind, StageUpdate};
use crate::models::work_item::ObjectRef;
use crate::services::governor::ConcurrencyGovernor;
use crate::services::inference::InferenceService;
use crate::services::ledger::{JobLedger, LedgerError};
use crate::services::notifications::{ArtifactError, ArtifactWriter, NotificationRule, ResultWatcher, WriteOutcome};
use crate::services::queue::{QueueError, RedisQueue, WorkQueue};
use crate::services::results::ResultSink;
use crate::services::storage::ObjectStore;

use harvest::{HarvestStage, PendingHarvest, RESULT_SUFFIX};
use preparation::PreparationStage;
use submission::{SubmissionStage, BATCH_SUFFIX};
use worker::{Disposition, StageWorker};

/// Ledger row id of one record within a batch.
pub fn row_id(batch_id: &str, record_id: &str) -> String {
    format!("{batch_id}#{record_id}")
}

/// Move every non-terminal row to `FAILED`. Rows that moved concurrently are skipped.
pub async fn fail_open_rows(
    ledger: &dyn JobLedger,
    rows: &[JobRecord],
    reason: &str,
) -> Result<usize, LedgerError> {
    let mut failed = 0;
    for row in rows.iter().filter(|row| !row.stage.is_terminal()) {
        let update = StageUpdate::new(row.stage, Stage::Failed).with_error(reason);
        if ledger.transition(&row.id, update).await?.is_applied() {
            failed += 1;
        }
    }
    Ok(failed)
}

/// One queue per stage.
#[derive(Clone)]
pub struct StageQueues {
    pub preparation: Arc<dyn WorkQueue>,
    pub submission: Arc<dyn WorkQueue>,
    pub harvest: Arc<dyn WorkQueue>,
}

impl StageQueues {
    /// Redis-backed queues named after their stage under `prefix`.
    pub fn connect_redis(redis_url: &str, prefix: &str, settings: &QueueSettings) -> Result<Self, QueueError> {
        let queue = |kind: StageKind| -> Result<Arc<dyn WorkQueue>, QueueError> {
            Ok(Arc::new(RedisQueue::new(redis_url, prefix, &kind.to_string(), settings.clone())?))
        };
        Ok(Self {
            preparation: queue(StageKind::Preparation)?,
            submission: queue(StageKind::Submission)?,
            harvest: queue(StageKind::Harvest)?,
        })
    }

    pub fn for_stage(&self, kind: StageKind) -> &Arc<dyn WorkQueue> {
        match kind {
            StageKind::Preparation => &self.preparation,
            StageKind::Submission => &self.submission,
            StageKind::Harvest => &self.harvest,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (StageKind, &Arc<dyn WorkQueue>)> {
        [
            (StageKind::Preparation, &self.preparation),
            (StageKind::Submission, &self.submission),
            (StageKind::Harvest, &self.harvest),
        ]
        .into_iter()
    }
}

/// Notification topology: which object prefixes feed which queue.
pub fn notification_rules(layout: &BucketLayout, queues: &StageQueues) -> Vec<NotificationRule> {
    vec![
        NotificationRule::new(
            layout.customer_bucket.clone(),
            layout.customer_input_folder.clone(),
            queues.preparation.clone(),
        ),
        NotificationRule::new(
            layout.internal_bucket.clone(),
            layout.batch_input_folder.clone(),
            queues.submission.clone(),
        )
        .with_suffix(BATCH_SUFFIX),
        NotificationRule::new(
            layout.internal_bucket.clone(),
            layout.batch_output_folder.clone(),
            queues.harvest.clone(),
        )
        .with_suffix(RESULT_SUFFIX),
    ]
}

/// The three stage workers wired to shared storage, ledger and queues.
pub struct Pipeline {
    settings: PipelineSettings,
    queues: StageQueues,
    ledger: Arc<dyn JobLedger>,
    writer: ArtifactWriter,
    preparation: StageWorker<PreparationStage>,
    submission: StageWorker<SubmissionStage>,
    harvest: StageWorker<HarvestStage>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        store: Arc<dyn ObjectStore>,
        queues: StageQueues,
        ledger: Arc<dyn JobLedger>,
        sink: Arc<dyn ResultSink>,
        inference: Arc<dyn InferenceService>,
    ) -> Self {
        let writer = ArtifactWriter::new(store, notification_rules(&settings.layout, &queues));
        let governor = |kind: StageKind| ConcurrencyGovernor::new(kind, settings.concurrency.for_stage(kind));

        let preparation = StageWorker::new(
            Arc::new(PreparationStage::new(
                settings.preparation.clone(),
                settings.layout.clone(),
                writer.clone(),
                ledger.clone(),
            )),
            queues.preparation.clone(),
            governor(StageKind::Preparation),
            settings.worker.clone(),
        );
        let submission = StageWorker::new(
            Arc::new(SubmissionStage::new(
                settings.submission.clone(),
                settings.layout.clone(),
                inference,
                ledger.clone(),
            )),
            queues.submission.clone(),
            governor(StageKind::Submission),
            settings.worker.clone(),
        );
        let harvest = StageWorker::new(
            Arc::new(HarvestStage::new(
                settings.harvest.clone(),
                settings.layout.clone(),
                writer.clone(),
                ledger.clone(),
                sink,
            )),
            queues.harvest.clone(),
            governor(StageKind::Harvest),
            settings.worker.clone(),
        );

        Self {
            settings,
            queues,
            ledger,
            writer,
            preparation,
            submission,
            harvest,
        }
    }

    pub fn queues(&self) -> &StageQueues {
        &self.queues
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    pub fn writer(&self) -> &ArtifactWriter {
        &self.writer
    }

    pub fn preparation(&self) -> &StageWorker<PreparationStage> {
        &self.preparation
    }

    pub fn submission(&self) -> &StageWorker<SubmissionStage> {
        &self.submission
    }

    pub fn harvest(&self) -> &StageWorker<HarvestStage> {
        &self.harvest
    }

    /// Store a customer source file under the input folder, which triggers preparation.
    pub async fn ingest(&self, file_name: &str, data: &[u8], content_type: &str) -> Result<ObjectRef, ArtifactError> {
        let layout = &self.settings.layout;
        let object = ObjectRef::new(
            layout.customer_bucket.clone(),
            format!("{}/{}", layout.customer_input_folder, file_name),
        );
        let outcome = self.writer.write(&object, data, content_type).await?;
        if outcome == WriteOutcome::Unchanged {
            tracing::info!(object = %object, "Source already ingested, notified again");
        }
        Ok(object)
    }

    /// Watcher that notifies harvest about result objects written by the inference service.
    pub fn result_watcher(&self, interval: Duration) -> ResultWatcher {
        ResultWatcher::new(
            self.writer.clone(),
            self.settings.layout.internal_bucket.clone(),
            self.settings.layout.batch_output_folder.clone(),
            RESULT_SUFFIX,
            interval,
        )
        .with_gate(Arc::new(PendingHarvest::new(self.ledger.clone())))
    }

    /// Process at most one item of `kind` inline.
    pub async fn poll_once(&self, kind: StageKind) -> Result<Option<Disposition>, QueueError> {
        match kind {
            StageKind::Preparation => self.preparation.poll_once().await,
            StageKind::Submission => self.submission.poll_once().await,
            StageKind::Harvest => self.harvest.poll_once().await,
        }
    }

    /// Run the selected stage workers, plus the result watcher when an interval
    /// is given, until `token` is cancelled and every worker has drained.
    pub async fn run(&self, stages: &[StageKind], result_poll: Option<Duration>, token: CancellationToken) {
        let mut tasks = JoinSet::new();
        for kind in stages {
            match kind {
                StageKind::Preparation => tasks.spawn(self.preparation.clone().run(token.clone())),
                StageKind::Submission => tasks.spawn(self.submission.clone().run(token.clone())),
                StageKind::Harvest => tasks.spawn(self.harvest.clone().run(token.clone())),
            };
        }
        if let Some(interval) = result_poll {
            tasks.spawn(self.result_watcher(interval).run(token.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Pipeline task panicked");
            }
        }
    }
}
