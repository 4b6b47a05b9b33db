use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{BucketLayout, SubmissionSettings};
use crate::models::job::{Stage, StageKind, StageUpdate};
use crate::models::work_item::ObjectRef;
use crate::pipeline::fail_open_rows;
use crate::pipeline::worker::{StageHandler, StageError, StageOutcome};
use crate::services::inference::{InferenceError, InferenceService, JobSubmission, SubmittedJob};
use crate::services::ledger::JobLedger;

pub const BATCH_SUFFIX: &str = ".jsonl";

/// Starts one managed inference job per prepared batch.
pub struct SubmissionStage {
    settings: SubmissionSettings,
    layout: BucketLayout,
    inference: Arc<dyn InferenceService>,
    ledger: Arc<dyn JobLedger>,
}

impl SubmissionStage {
    pub fn new(
        settings: SubmissionSettings,
        layout: BucketLayout,
        inference: Arc<dyn InferenceService>,
        ledger: Arc<dyn JobLedger>,
    ) -> Self {
        Self {
            settings,
            layout,
            inference,
            ledger,
        }
    }

    pub fn job_name(&self, batch_id: &str) -> String {
        format!("{}-{}", self.settings.job_prefix, batch_id)
    }

    /// Submit, resolving a duplicate-name conflict to the job that already exists.
    async fn submit(&self, job: &JobSubmission) -> Result<SubmittedJob, StageError> {
        match self.inference.submit(job).await {
            Ok(submitted) => {
                metrics::counter!("inference_jobs_submitted_total").increment(1);
                Ok(submitted)
            }
            Err(InferenceError::AlreadySubmitted(detail)) => {
                tracing::info!(job_name = %job.job_name, "Job already exists, looking it up");
                self.inference
                    .lookup(&job.job_name)
                    .await?
                    .ok_or(StageError::Inference(InferenceError::AlreadySubmitted(detail)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn batch_id_of(object: &ObjectRef) -> Result<&str, StageError> {
    object
        .file_name()
        .strip_suffix(BATCH_SUFFIX)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| StageError::Unsupported(format!("{object} is not a batch artifact")))
}

#[async_trait]
impl StageHandler for SubmissionStage {
    fn kind(&self) -> StageKind {
        StageKind::Submission
    }

    async fn process(&self, object: &ObjectRef) -> Result<StageOutcome, StageError> {
        let batch_id = batch_id_of(object)?;
        let rows = self.ledger.list_batch(batch_id).await?;
        if rows.is_empty() {
            return Err(StageError::Malformed(format!("no ledger rows for batch {batch_id}")));
        }
        if rows.iter().any(|row| row.stage == Stage::Preparing) {
            return Err(StageError::NotReady(format!("batch {batch_id} is still being prepared")));
        }
        let pending: Vec<_> = rows
            .iter()
            .filter(|row| row.stage == Stage::Submitted)
            .collect();
        if pending.is_empty() {
            return Ok(StageOutcome::AlreadyHandled {
                reason: format!("batch {batch_id} already submitted"),
            });
        }

        let job = JobSubmission {
            job_name: self.job_name(batch_id),
            model_id: self.settings.model_id.clone(),
            role_arn: self.settings.role_arn.clone(),
            input_uri: object.uri(),
            output_uri: format!(
                "s3://{}/{}/",
                self.layout.internal_bucket, self.layout.batch_output_folder
            ),
        };
        let submitted = self.submit(&job).await?;
        tracing::info!(
            batch_id = %batch_id,
            job_name = %job.job_name,
            job_arn = %submitted.job_arn,
            "Batch inference job submitted"
        );

        let mut advanced = 0;
        for row in pending {
            let update = StageUpdate::new(Stage::Submitted, Stage::InProgress)
                .with_inference_job(submitted.job_arn.clone());
            if self.ledger.transition(&row.id, update).await?.is_applied() {
                advanced += 1;
            }
        }

        Ok(StageOutcome::Submitted {
            batch_id: batch_id.to_string(),
            job_id: submitted.short_id().to_string(),
            records: advanced,
        })
    }

    async fn record_failure(&self, object: &ObjectRef, error: &StageError) -> Result<(), StageError> {
        let Ok(batch_id) = batch_id_of(object) else {
            return Ok(());
        };
        let rows = self.ledger.list_batch(batch_id).await?;
        fail_open_rows(self.ledger.as_ref(), &rows, &error.to_string()).await?;
        Ok(())
    }

    async fn record_retry(&self, object: &ObjectRef, error: &StageError) -> Result<(), StageError> {
        let batch_id = batch_id_of(object)?;
        for row in self.ledger.list_batch(batch_id).await? {
            if !row.stage.is_terminal() {
                self.ledger.record_attempt(&row.id, &error.to_string()).await?;
            }
        }
        Ok(())
    }
}
