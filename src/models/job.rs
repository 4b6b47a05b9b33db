use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Lifecycle stage of a ledger row.
///
/// The order is `Preparing -> Submitted -> InProgress -> {Completed, Failed}`.
/// `Failed` is reachable from every non-terminal stage; nothing leaves a
/// terminal stage.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, EnumString, Display, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Preparing,
    Submitted,
    InProgress,
    Completed,
    Failed,
}

impl Stage {
    /// Position in the partial order. Both terminal stages share the top rank.
    pub fn rank(self) -> u8 {
        match self {
            Stage::Preparing => 0,
            Stage::Submitted => 1,
            Stage::InProgress => 2,
            Stage::Completed | Stage::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: Stage) -> bool {
        match (self, next) {
            (Stage::Preparing, Stage::Submitted) => true,
            (Stage::Submitted, Stage::InProgress) => true,
            (Stage::InProgress, Stage::Completed) => true,
            (from, Stage::Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// True when a row observed in `self` has already moved past `target`
    /// (or reached it), so a write aiming at `target` has nothing left to do.
    pub fn has_reached(self, target: Stage) -> bool {
        self == target || self.rank() > target.rank() || self.is_terminal()
    }
}

/// Pipeline stage worker identity (which queue a worker consumes).
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, EnumString, Display, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StageKind {
    Preparation,
    Submission,
    Harvest,
}

/// One ledger row: the lifecycle of a single record within a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub parent_id: String,
    pub batch_id: String,
    pub stage: Stage,
    pub input_ref: String,
    pub output_ref: Option<String>,
    pub inference_job_id: Option<String>,
    pub attempts: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row inserted when a record first enters preparation.
#[derive(Debug, Clone)]
pub struct NewJobRecord {
    pub id: String,
    pub parent_id: String,
    pub batch_id: String,
    pub input_ref: String,
}

impl NewJobRecord {
    pub fn into_record(self, now: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id: self.id,
            parent_id: self.parent_id,
            batch_id: self.batch_id,
            stage: Stage::Preparing,
            input_ref: self.input_ref,
            output_ref: None,
            inference_job_id: None,
            attempts: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A conditional stage write: applied only while the stored stage equals
/// `expected`.
#[derive(Debug, Clone)]
pub struct StageUpdate {
    pub expected: Stage,
    pub next: Stage,
    pub output_ref: Option<String>,
    pub inference_job_id: Option<String>,
    pub error: Option<String>,
}

impl StageUpdate {
    pub fn new(expected: Stage, next: Stage) -> Self {
        Self {
            expected,
            next,
            output_ref: None,
            inference_job_id: None,
            error: None,
        }
    }

    pub fn with_output_ref(mut self, output_ref: impl Into<String>) -> Self {
        self.output_ref = Some(output_ref.into());
        self
    }

    pub fn with_inference_job(mut self, job_id: impl Into<String>) -> Self {
        self.inference_job_id = Some(job_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Apply the update to a row already known to be in `expected`.
    pub fn apply(&self, record: &mut JobRecord, now: DateTime<Utc>) {
        record.stage = self.next;
        if let Some(output_ref) = &self.output_ref {
            record.output_ref = Some(output_ref.clone());
        }
        if let Some(job_id) = &self.inference_job_id {
            record.inference_job_id = Some(job_id.clone());
        }
        if let Some(error) = &self.error {
            record.error = Some(error.clone());
        }
        record.updated_at = now;
    }
}

/// Per-stage row counts for a batch or parent.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StageCounts {
    pub preparing: usize,
    pub submitted: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StageCounts {
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut counts = Self::default();
        for record in records {
            match record.stage {
                Stage::Preparing => counts.preparing += 1,
                Stage::Submitted => counts.submitted += 1,
                Stage::InProgress => counts.in_progress += 1,
                Stage::Completed => counts.completed += 1,
                Stage::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.preparing + self.submitted + self.in_progress + self.completed + self.failed
    }

    pub fn all_terminal(&self) -> bool {
        self.total() > 0 && self.completed + self.failed == self.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_forward_edges() {
        assert!(Stage::Preparing.can_transition_to(Stage::Submitted));
        assert!(Stage::Submitted.can_transition_to(Stage::InProgress));
        assert!(Stage::InProgress.can_transition_to(Stage::Completed));
        assert!(!Stage::Preparing.can_transition_to(Stage::InProgress));
        assert!(!Stage::Submitted.can_transition_to(Stage::Completed));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal() {
        for stage in Stage::iter().filter(|s| !s.is_terminal()) {
            assert!(stage.can_transition_to(Stage::Failed), "{stage} -> FAILED");
        }
    }

    #[test]
    fn test_terminal_stages_never_regress() {
        for from in [Stage::Completed, Stage::Failed] {
            for to in Stage::iter() {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn test_no_edge_goes_backwards() {
        for from in Stage::iter() {
            for to in Stage::iter() {
                if from.can_transition_to(to) {
                    assert!(to.rank() > from.rank());
                }
            }
        }
    }

    #[test]
    fn test_has_reached() {
        assert!(Stage::InProgress.has_reached(Stage::Submitted));
        assert!(Stage::Failed.has_reached(Stage::InProgress));
        assert!(Stage::Submitted.has_reached(Stage::Submitted));
        assert!(!Stage::Preparing.has_reached(Stage::Submitted));
    }

    #[test]
    fn test_string_forms() {
        assert_eq!(Stage::InProgress.to_string(), "IN_PROGRESS");
        assert_eq!(Stage::from_str("COMPLETED").unwrap(), Stage::Completed);
        assert_eq!(
            serde_json::to_string(&Stage::Preparing).unwrap(),
            "\"PREPARING\""
        );
        assert_eq!(StageKind::from_str("harvest").unwrap(), StageKind::Harvest);
    }

    #[test]
    fn test_stage_counts() {
        let now = Utc::now();
        let mut done = NewJobRecord {
            id: "b#1".into(),
            parent_id: "p".into(),
            batch_id: "b".into(),
            input_ref: "s3://x/y".into(),
        }
        .into_record(now);
        done.stage = Stage::Completed;
        let mut failed = done.clone();
        failed.stage = Stage::Failed;

        let counts = StageCounts::tally([&done, &failed]);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert!(counts.all_terminal());
        assert!(!StageCounts::default().all_terminal());
    }
}
