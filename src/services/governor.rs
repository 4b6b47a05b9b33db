use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use crate::models::job::StageKind;

/// Per-stage cap on simultaneously in-flight work items.
///
/// Each stage owns its own governor, so a backlog in one stage never takes
/// slots from another.
#[derive(Clone)]
pub struct ConcurrencyGovernor {
    stage: StageKind,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    peak: Arc<AtomicUsize>,
}

/// Slot held for the lifetime of one invocation.
pub struct GovernorPermit {
    stage: StageKind,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    _permit: OwnedSemaphorePermit,
}

impl Drop for GovernorPermit {
    fn drop(&mut self) {
        // The semaphore permit is released after this body runs, hence the -1.
        let in_flight = self
            .max_concurrency
            .saturating_sub(self.semaphore.available_permits() + 1);
        metrics::gauge!("pipeline_in_flight", "stage" => self.stage.to_string()).set(in_flight as f64);
    }
}

impl ConcurrencyGovernor {
    pub fn new(stage: StageKind, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            stage,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<GovernorPermit, AcquireError> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        let in_flight = self.in_flight();
        self.peak.fetch_max(in_flight, Ordering::Relaxed);
        metrics::gauge!("pipeline_in_flight", "stage" => self.stage.to_string()).set(in_flight as f64);
        Ok(GovernorPermit {
            stage: self.stage,
            semaphore: self.semaphore.clone(),
            max_concurrency: self.max_concurrency,
            _permit: permit,
        })
    }

    /// Wait until every outstanding permit has been returned.
    pub async fn drain(&self) -> Result<(), AcquireError> {
        let all = self.semaphore.acquire_many(self.max_concurrency as u32).await?;
        drop(all);
        Ok(())
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrency - self.semaphore.available_permits()
    }

    /// Highest in-flight count observed since creation.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}
