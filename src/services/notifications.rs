use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::models::work_item::ObjectRef;
use crate::services::queue::{QueueError, WorkQueue};
use crate::services::storage::{ObjectStore, StorageError};

/// Routes object-created notifications for `bucket/prefix/...[suffix]` to a queue.
#[derive(Clone)]
pub struct NotificationRule {
    pub bucket: String,
    pub prefix: String,
    pub suffix: Option<String>,
    pub queue: Arc<dyn WorkQueue>,
}

impl NotificationRule {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            suffix: None,
            queue,
        }
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn matches(&self, object: &ObjectRef) -> bool {
        if object.bucket != self.bucket {
            return false;
        }
        let Some(rest) = object
            .key
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return false;
        };
        !rest.is_empty() && self.suffix.as_deref().map_or(true, |suffix| rest.ends_with(suffix))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    /// The key already held the same bytes.
    Unchanged,
}

/// Write-once artifact store that emits notifications on creation.
///
/// Writing identical bytes to an existing key is accepted and notifies again,
/// so a retried producer always re-triggers its consumer. Different bytes are
/// rejected with [`StorageError::ArtifactConflict`].
#[derive(Clone)]
pub struct ArtifactWriter {
    store: Arc<dyn ObjectStore>,
    rules: Vec<NotificationRule>,
}

impl ArtifactWriter {
    pub fn new(store: Arc<dyn ObjectStore>, rules: Vec<NotificationRule>) -> Self {
        Self { store, rules }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub async fn write(
        &self,
        object: &ObjectRef,
        data: &[u8],
        content_type: &str,
    ) -> Result<WriteOutcome, ArtifactError> {
        let outcome = match self.store.get_optional(object).await? {
            Some(existing) if existing == data => WriteOutcome::Unchanged,
            Some(_) => return Err(StorageError::ArtifactConflict(object.to_string()).into()),
            None => {
                self.store.put(object, data, content_type).await?;
                WriteOutcome::Created
            }
        };

        tracing::debug!(object = %object, ?outcome, bytes = data.len(), "Artifact written");
        self.notify(object).await?;
        Ok(outcome)
    }

    /// Enqueue a notification on every queue whose rule matches `object`.
    pub async fn notify(&self, object: &ObjectRef) -> Result<usize, ArtifactError> {
        let mut notified = 0;
        for rule in self.rules.iter().filter(|rule| rule.matches(object)) {
            rule.queue.enqueue_object(object).await?;
            tracing::debug!(object = %object, queue = rule.queue.name(), "Notification sent");
            notified += 1;
        }
        Ok(notified)
    }
}

/// Decides whether a detected result object still needs processing.
#[async_trait]
pub trait ResultGate: Send + Sync {
    async fn is_pending(&self, object: &ObjectRef) -> bool;
}

/// Notifies a queue about result objects written outside the pipeline.
///
/// The inference service writes result artifacts directly to the store, so
/// they never pass through an [`ArtifactWriter`]. The watcher lists the result
/// prefix on an interval and notifies each key at most once while it stays
/// listed. With a [`ResultGate`], results that need no further work are
/// skipped, so a restarted watcher does not replay history.
pub struct ResultWatcher {
    writer: ArtifactWriter,
    bucket: String,
    prefix: String,
    suffix: String,
    interval: Duration,
    gate: Option<Arc<dyn ResultGate>>,
    seen: HashSet<String>,
}

impl ResultWatcher {
    pub fn new(
        writer: ArtifactWriter,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            writer,
            bucket: bucket.into(),
            prefix: prefix.into(),
            suffix: suffix.into(),
            interval,
            gate: None,
            seen: HashSet::new(),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn ResultGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Keys currently remembered as handled.
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }

    /// List once and notify unseen, pending result objects. Returns how many were notified.
    pub async fn scan(&mut self) -> Result<usize, ArtifactError> {
        let listing_prefix = format!("{}/", self.prefix);
        let keys: HashSet<String> = self
            .writer
            .store()
            .list(&self.bucket, &listing_prefix)
            .await?
            .into_iter()
            .filter(|key| key.ends_with(&self.suffix))
            .collect();

        // Keys gone from the listing can never be seen again.
        self.seen.retain(|key| keys.contains(key));

        let mut fresh = 0;
        for key in keys {
            if self.seen.contains(&key) {
                continue;
            }
            let object = ObjectRef::new(self.bucket.clone(), key.clone());
            let pending = match &self.gate {
                Some(gate) => gate.is_pending(&object).await,
                None => true,
            };
            if pending {
                self.writer.notify(&object).await?;
                tracing::info!(object_key = %key, "Result object detected");
                fresh += 1;
            }
            self.seen.insert(key);
        }
        Ok(fresh)
    }

    pub async fn run(mut self, token: CancellationToken) {
        tracing::info!(bucket = %self.bucket, prefix = %self.prefix, "Result watcher started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        tracing::warn!(error = %e, "Result scan failed");
                    }
                }
            }
        }
        tracing::info!("Result watcher stopped");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::services::memory_queue::MemoryQueue;
    use crate::services::storage::MemoryObjectStore;

    fn setup() -> (ArtifactWriter, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::new("submission", QueueSettings::default()));
        let rule = NotificationRule::new("internal", "batch_input", queue.clone()).with_suffix(".jsonl");
        let writer = ArtifactWriter::new(Arc::new(MemoryObjectStore::new()), vec![rule]);
        (writer, queue)
    }

    #[test]
    fn test_rule_matching() {
        let queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new("q", QueueSettings::default()));
        let rule = NotificationRule::new("internal", "batch_output", queue).with_suffix(".jsonl.out");

        assert!(rule.matches(&ObjectRef::new("internal", "batch_output/job/b.jsonl.out")));
        assert!(!rule.matches(&ObjectRef::new("internal", "batch_output/job/b.jsonl")));
        assert!(!rule.matches(&ObjectRef::new("internal", "batch_output_old/b.jsonl.out")));
        assert!(!rule.matches(&ObjectRef::new("customer", "batch_output/b.jsonl.out")));
    }

    #[tokio::test]
    async fn test_write_notifies_matching_queue() {
        let (writer, queue) = setup();
        let object = ObjectRef::new("internal", "batch_input/p/p-batch1.jsonl");

        let outcome = writer.write(&object, b"{}\n", "application/jsonl").await.unwrap();
        assert_eq!(outcome, WriteOutcome::Created);

        let items = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].object().unwrap(), object);
    }

    #[tokio::test]
    async fn test_identical_rewrite_renotifies() {
        let (writer, queue) = setup();
        let object = ObjectRef::new("internal", "batch_input/p/p-batch1.jsonl");

        writer.write(&object, b"same", "application/jsonl").await.unwrap();
        let outcome = writer.write(&object, b"same", "application/jsonl").await.unwrap();
        assert_eq!(outcome, WriteOutcome::Unchanged);
        assert_eq!(queue.depth().await.unwrap().visible, 2);
    }

    #[tokio::test]
    async fn test_different_bytes_conflict() {
        let (writer, queue) = setup();
        let object = ObjectRef::new("internal", "batch_input/p/p-batch1.jsonl");

        writer.write(&object, b"first", "application/jsonl").await.unwrap();
        let err = writer.write(&object, b"second", "application/jsonl").await.unwrap_err();
        assert!(matches!(
            err,
            ArtifactError::Storage(StorageError::ArtifactConflict(_))
        ));
        assert_eq!(writer.store().get(&object).await.unwrap(), b"first");
        assert_eq!(queue.depth().await.unwrap().visible, 1);
    }

    #[tokio::test]
    async fn test_watcher_notifies_each_result_once() {
        let queue = Arc::new(MemoryQueue::new("harvest", QueueSettings::default()));
        let rule = NotificationRule::new("internal", "batch_output", queue.clone()).with_suffix(".jsonl.out");
        let store = Arc::new(MemoryObjectStore::new());
        let writer = ArtifactWriter::new(store.clone(), vec![rule]);
        let mut watcher = ResultWatcher::new(
            writer,
            "internal",
            "batch_output",
            ".jsonl.out",
            Duration::from_secs(30),
        );

        store
            .put(&ObjectRef::new("internal", "batch_output/job1/b.jsonl.out"), b"x", "application/jsonl")
            .await
            .unwrap();
        store
            .put(&ObjectRef::new("internal", "batch_output/job1/manifest.json.out"), b"x", "application/json")
            .await
            .unwrap();

        assert_eq!(watcher.scan().await.unwrap(), 1);
        assert_eq!(watcher.scan().await.unwrap(), 0);
        assert_eq!(queue.depth().await.unwrap().visible, 1);
    }

    struct SkipKeys(Vec<&'static str>);

    #[async_trait]
    impl ResultGate for SkipKeys {
        async fn is_pending(&self, object: &ObjectRef) -> bool {
            !self.0.contains(&object.key.as_str())
        }
    }

    #[tokio::test]
    async fn test_watcher_skips_handled_results_and_forgets_removed_keys() {
        let queue = Arc::new(MemoryQueue::new("harvest", QueueSettings::default()));
        let rule = NotificationRule::new("internal", "batch_output", queue.clone()).with_suffix(".jsonl.out");
        let store = Arc::new(MemoryObjectStore::new());
        let writer = ArtifactWriter::new(store.clone(), vec![rule]);
        let mut watcher = ResultWatcher::new(
            writer,
            "internal",
            "batch_output",
            ".jsonl.out",
            Duration::from_secs(30),
        )
        .with_gate(Arc::new(SkipKeys(vec!["batch_output/job1/old.jsonl.out"])));

        let old = ObjectRef::new("internal", "batch_output/job1/old.jsonl.out");
        let new = ObjectRef::new("internal", "batch_output/job2/new.jsonl.out");
        store.put(&old, b"x", "application/jsonl").await.unwrap();
        store.put(&new, b"x", "application/jsonl").await.unwrap();

        assert_eq!(watcher.scan().await.unwrap(), 1);
        assert_eq!(watcher.tracked(), 2);
        let items = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].object().unwrap(), new);

        assert!(store.remove(&old));
        assert_eq!(watcher.scan().await.unwrap(), 0);
        assert_eq!(watcher.tracked(), 1);
    }
}
