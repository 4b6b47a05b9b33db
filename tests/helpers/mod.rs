//! In-memory pipeline harness for end-to-end tests.
#![allow(dead_code)]

use async_trait::async_trait;
use batch_classify::config::PipelineSettings;
use batch_classify::models::job::JobRecord;
use batch_classify::models::work_item::ObjectRef;
use batch_classify::pipeline::{Pipeline, StageQueues};
use batch_classify::services::inference::{InferenceError, InferenceService, JobSubmission, SubmittedJob};
use batch_classify::services::ledger::MemoryLedger;
use batch_classify::services::memory_queue::MemoryQueue;
use batch_classify::services::queue::WorkQueue;
use batch_classify::models::classification::ClassificationResult;
use batch_classify::services::results::{MemoryResultSink, ResultSink, SinkError};
use batch_classify::services::storage::{MemoryObjectStore, ObjectStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::fixtures;

/// Inference service that throttles a fixed number of calls, then accepts.
pub struct ScriptedInference {
    throttles_left: AtomicUsize,
    delay: Duration,
    jobs: Mutex<HashMap<String, SubmittedJob>>,
    submit_calls: AtomicUsize,
}

impl ScriptedInference {
    pub fn new(throttles: usize) -> Self {
        Self {
            throttles_left: AtomicUsize::new(throttles),
            delay: Duration::ZERO,
            jobs: Mutex::new(HashMap::new()),
            submit_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Jobs accepted so far.
    pub fn accepted(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceService for ScriptedInference {
    async fn submit(&self, job: &JobSubmission) -> Result<SubmittedJob, InferenceError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let throttled = self
            .throttles_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(InferenceError::Throttled("Too many requests".to_string()));
        }

        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.job_name) {
            return Err(InferenceError::AlreadySubmitted(job.job_name.clone()));
        }
        let submitted = SubmittedJob {
            job_arn: format!(
                "arn:aws:bedrock:us-east-1:123456789012:model-invocation-job/job{:03}",
                jobs.len() + 1
            ),
        };
        jobs.insert(job.job_name.clone(), submitted.clone());
        Ok(submitted)
    }

    async fn lookup(&self, job_name: &str) -> Result<Option<SubmittedJob>, InferenceError> {
        Ok(self.jobs.lock().unwrap().get(job_name).cloned())
    }
}

/// Result sink whose write fails once after a number of successful upserts.
pub struct FlakySink {
    inner: Arc<MemoryResultSink>,
    fail_after: usize,
    upserts: AtomicUsize,
}

impl FlakySink {
    pub fn new(inner: Arc<MemoryResultSink>, fail_after: usize) -> Self {
        Self {
            inner,
            fail_after,
            upserts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ResultSink for FlakySink {
    async fn upsert(&self, row_id: &str, result: &ClassificationResult) -> Result<(), SinkError> {
        if self.upserts.fetch_add(1, Ordering::SeqCst) == self.fail_after {
            return Err(SinkError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.upsert(row_id, result).await
    }

    async fn get(&self, row_id: &str) -> Result<Option<ClassificationResult>, SinkError> {
        self.inner.get(row_id).await
    }
}

pub struct TestPipeline {
    pub settings: PipelineSettings,
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<MemoryObjectStore>,
    pub queues: StageQueues,
    pub ledger: Arc<MemoryLedger>,
    pub sink: Arc<MemoryResultSink>,
    pub inference: Arc<ScriptedInference>,
}

impl TestPipeline {
    pub fn new(inference: ScriptedInference) -> Self {
        Self::with_settings(fixtures::settings(), inference)
    }

    pub fn with_settings(settings: PipelineSettings, inference: ScriptedInference) -> Self {
        Self::build(settings, inference, None)
    }

    /// Harness whose result sink fails once after `fail_after` upserts.
    pub fn with_flaky_sink(inference: ScriptedInference, fail_after: usize) -> Self {
        Self::build(fixtures::settings(), inference, Some(fail_after))
    }

    fn build(settings: PipelineSettings, inference: ScriptedInference, fail_sink_after: Option<usize>) -> Self {
        let store = Arc::new(MemoryObjectStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let sink = Arc::new(MemoryResultSink::new());
        let stage_sink: Arc<dyn ResultSink> = match fail_sink_after {
            Some(fail_after) => Arc::new(FlakySink::new(sink.clone(), fail_after)),
            None => sink.clone(),
        };
        let inference = Arc::new(inference);
        let queue = |name: &str| -> Arc<dyn WorkQueue> { Arc::new(MemoryQueue::new(name, settings.queue.clone())) };
        let queues = StageQueues {
            preparation: queue("preparation"),
            submission: queue("submission"),
            harvest: queue("harvest"),
        };

        let pipeline = Pipeline::new(
            settings.clone(),
            store.clone(),
            queues.clone(),
            ledger.clone(),
            stage_sink,
            inference.clone(),
        );

        Self {
            settings,
            pipeline: Arc::new(pipeline),
            store,
            queues,
            ledger,
            sink,
            inference,
        }
    }

    /// Keys of prepared batch artifacts, sorted.
    pub async fn batch_artifacts(&self) -> Vec<String> {
        let prefix = format!("{}/", self.settings.layout.batch_input_folder);
        self.store.list(fixtures::INTERNAL_BUCKET, &prefix).await.unwrap()
    }

    pub async fn rows(&self) -> Vec<JobRecord> {
        self.ledger.all().await
    }

    /// Write the result artifact the inference service would produce for a
    /// submitted batch, under the job's output folder. Returns the result object.
    pub async fn complete_inference(&self, batch_key: &str, garbled: Option<usize>) -> ObjectRef {
        let batch = ObjectRef::new(fixtures::INTERNAL_BUCKET, batch_key);
        let body = self.store.get(&batch).await.unwrap();
        let batch_id = batch.file_name().trim_end_matches(".jsonl").to_string();

        let rows = self.ledger.all().await;
        let job_arn = rows
            .iter()
            .filter(|row| row.batch_id == batch_id)
            .find_map(|row| row.inference_job_id.clone())
            .expect("batch has not been submitted");
        let short_id = job_arn.rsplit('/').next().unwrap().to_string();

        let result = ObjectRef::new(
            fixtures::INTERNAL_BUCKET,
            format!(
                "{}/{}/{}.jsonl.out",
                self.settings.layout.batch_output_folder, short_id, batch_id
            ),
        );
        self.store
            .put(&result, &fixtures::result_artifact(&body, garbled), "application/jsonl")
            .await
            .unwrap();
        result
    }

    /// Let a visibility timeout lapse on the paused test clock.
    pub async fn expire_visibility(&self) {
        tokio::time::advance(fixtures::VISIBILITY_TIMEOUT + Duration::from_secs(1)).await;
    }
}
