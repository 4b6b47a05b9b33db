use std::sync::Arc;
use std::time::Duration;

use crate::pipeline::StageQueues;
use crate::services::ledger::JobLedger;

/// Shared state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn JobLedger>,
    pub queues: StageQueues,
    /// Age past which a non-terminal ledger row is reported as stuck.
    pub stale_after: Duration,
}

impl AppState {
    pub fn new(ledger: Arc<dyn JobLedger>, queues: StageQueues, stale_after: Duration) -> Self {
        Self {
            ledger,
            queues,
            stale_after,
        }
    }
}
