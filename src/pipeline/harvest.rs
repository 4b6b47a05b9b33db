use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{BucketLayout, HarvestSettings, OutputFormat};
use crate::models::classification::{ClassificationResponse, ClassificationResult};
use crate::models::job::{JobRecord, Stage, StageCounts, StageKind, StageUpdate};
use crate::models::work_item::ObjectRef;
use crate::pipeline::worker::{StageHandler, StageError, StageOutcome};
use crate::pipeline::{fail_open_rows, row_id};
use crate::services::ledger::JobLedger;
use crate::services::notifications::{ArtifactWriter, ResultGate};
use crate::services::results::ResultSink;

pub const RESULT_SUFFIX: &str = ".jsonl.out";

const UNCLASSIFIED: &str = "Classification was not successful.";
const NO_RATIONALE: &str = "No rationale found.";

/// Per-record verdict parsed from one result line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Classified(ClassificationResult),
    Failed { record_id: String, reason: String },
    /// Not even a record id could be recovered.
    Unreadable { line: usize, reason: String },
}

/// Reads a finished result artifact back into the customer-visible store.
pub struct HarvestStage {
    settings: HarvestSettings,
    layout: BucketLayout,
    writer: ArtifactWriter,
    ledger: Arc<dyn JobLedger>,
    sink: Arc<dyn ResultSink>,
}

impl HarvestStage {
    pub fn new(
        settings: HarvestSettings,
        layout: BucketLayout,
        writer: ArtifactWriter,
        ledger: Arc<dyn JobLedger>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            settings,
            layout,
            writer,
            ledger,
            sink,
        }
    }

    async fn write_outputs(
        &self,
        parent_id: &str,
        batch_id: &str,
        classified: &[(String, ClassificationResult)],
    ) -> Result<ObjectRef, StageError> {
        for (row_id, result) in classified {
            self.sink.upsert(row_id, result).await?;
        }
        let results: Vec<&ClassificationResult> = classified.iter().map(|(_, r)| r).collect();

        let format = self.settings.output_format;
        let customer = ObjectRef::new(
            self.layout.customer_bucket.clone(),
            format!(
                "{}/{}/{}.{}",
                self.layout.customer_output_folder,
                parent_id,
                batch_id,
                format.extension()
            ),
        );
        let (body, content_type) = match format {
            OutputFormat::Csv => (render_csv(&results)?, "text/csv"),
            OutputFormat::Json => (render_json_lines(&results)?, "application/json"),
        };
        self.writer.write(&customer, &body, content_type).await?;

        let internal = ObjectRef::new(
            self.layout.internal_bucket.clone(),
            format!("{}/{}/{}.json", self.layout.processed_folder, parent_id, batch_id),
        );
        self.writer
            .write(&internal, &render_json_lines(&results)?, "application/json")
            .await?;

        Ok(customer)
    }

    async fn check_parent(&self, parent_id: &str) -> Result<(), StageError> {
        let counts = StageCounts::tally(&self.ledger.list_parent(parent_id).await?);
        if counts.all_terminal() {
            metrics::counter!("pipeline_parents_completed_total").increment(1);
            tracing::info!(
                parent_id = %parent_id,
                completed = counts.completed,
                failed = counts.failed,
                "All batches for parent finished"
            );
        }
        Ok(())
    }
}

/// Result objects are pending while their batch has rows left to finish.
pub struct PendingHarvest {
    ledger: Arc<dyn JobLedger>,
}

impl PendingHarvest {
    pub fn new(ledger: Arc<dyn JobLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ResultGate for PendingHarvest {
    async fn is_pending(&self, object: &ObjectRef) -> bool {
        let Ok(batch_id) = batch_id_of(object) else {
            return false;
        };
        match self.ledger.list_batch(batch_id).await {
            Ok(rows) => !rows.is_empty() && !rows.iter().all(|row| row.stage.is_terminal()),
            // Harvest is idempotent, so an unanswered check errs towards notifying.
            Err(e) => {
                tracing::warn!(object = %object, error = %e, "Ledger check failed, notifying anyway");
                true
            }
        }
    }
}

fn batch_id_of(object: &ObjectRef) -> Result<&str, StageError> {
    object
        .file_name()
        .strip_suffix(RESULT_SUFFIX)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| StageError::Unsupported(format!("{object} is not a result artifact")))
}

#[async_trait]
impl StageHandler for HarvestStage {
    fn kind(&self) -> StageKind {
        StageKind::Harvest
    }

    async fn process(&self, object: &ObjectRef) -> Result<StageOutcome, StageError> {
        let batch_id = batch_id_of(object)?;
        let rows = self.ledger.list_batch(batch_id).await?;
        let Some(parent_id) = rows.first().map(|row| row.parent_id.clone()) else {
            return Err(StageError::Malformed(format!("no ledger rows for batch {batch_id}")));
        };
        if rows
            .iter()
            .any(|row| matches!(row.stage, Stage::Preparing | Stage::Submitted))
        {
            return Err(StageError::NotReady(format!("batch {batch_id} has rows not yet in progress")));
        }
        if rows.iter().all(|row| row.stage.is_terminal()) {
            return Ok(StageOutcome::AlreadyHandled {
                reason: format!("batch {batch_id} already harvested"),
            });
        }

        let bytes = self.writer.store().get(object).await?;
        let text = String::from_utf8_lossy(&bytes);
        let verdicts = resolve_rows(batch_id, &rows, parse_results(&text));

        // Outputs land before the ledger goes terminal, so a terminal batch
        // always has its customer files.
        let classified: Vec<(String, ClassificationResult)> = verdicts
            .iter()
            .filter_map(|(row_id, verdict)| match verdict {
                RowVerdict::Completed(result) => Some((row_id.clone(), result.clone())),
                RowVerdict::Failed(_) => None,
            })
            .collect();
        let customer = self.write_outputs(&parent_id, batch_id, &classified).await?;

        let (mut completed, mut failed) = (0, 0);
        for (row_id, verdict) in &verdicts {
            let update = match verdict {
                RowVerdict::Completed(_) => {
                    StageUpdate::new(Stage::InProgress, Stage::Completed)
                        .with_output_ref(customer.uri())
                }
                RowVerdict::Failed(reason) => {
                    StageUpdate::new(Stage::InProgress, Stage::Failed).with_error(reason.clone())
                }
            };
            if !self.ledger.transition(row_id, update).await?.is_applied() {
                continue;
            }
            match verdict {
                RowVerdict::Completed(_) => completed += 1,
                RowVerdict::Failed(_) => failed += 1,
            }
        }
        metrics::counter!("harvest_records_total", "outcome" => "completed").increment(completed as u64);
        metrics::counter!("harvest_records_total", "outcome" => "failed").increment(failed as u64);

        self.check_parent(&parent_id).await?;

        Ok(StageOutcome::Harvested {
            batch_id: batch_id.to_string(),
            completed,
            failed,
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
}

#[derive(Debug, Clone)]
enum RowVerdict {
    Completed(ClassificationResult),
    Failed(String),
}

/// Match parsed lines to every row of the batch, in row order.
///
/// Rows already terminal are kept so the rendered outputs do not depend on how
/// far an earlier delivery got; their transitions simply come back stale.
fn resolve_rows(batch_id: &str, rows: &[JobRecord], lines: Vec<LineOutcome>) -> Vec<(String, RowVerdict)> {
    let mut by_row: HashMap<String, RowVerdict> = HashMap::new();
    for line in lines {
        let (record_id, verdict) = match line {
            LineOutcome::Classified(result) => (result.id.clone(), RowVerdict::Completed(result)),
            LineOutcome::Failed { record_id, reason } => (record_id, RowVerdict::Failed(reason)),
            LineOutcome::Unreadable { line, reason } => {
                tracing::warn!(batch_id = %batch_id, line, reason = %reason, "Unreadable result line");
                continue;
            }
        };
        by_row.entry(row_id(batch_id, &record_id)).or_insert(verdict);
    }

    rows.iter()
        .map(|row| {
            let verdict = by_row
                .remove(&row.id)
                .unwrap_or_else(|| RowVerdict::Failed("missing from results".to_string()));
            (row.id.clone(), verdict)
        })
        .collect()
}

/// Parse every non-blank line of a result artifact.
pub fn parse_results(text: &str) -> Vec<LineOutcome> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| parse_line(index + 1, line))
        .collect()
}

fn parse_line(line_number: usize, line: &str) -> LineOutcome {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return LineOutcome::Unreadable {
                line: line_number,
                reason: e.to_string(),
            }
        }
    };
    let Some(record_id) = value.get("recordId").and_then(Value::as_str).map(str::to_string) else {
        return LineOutcome::Unreadable {
            line: line_number,
            reason: "no recordId".to_string(),
        };
    };
    let failed = |reason: String| LineOutcome::Failed {
        record_id: record_id.clone(),
        reason,
    };

    let response: ClassificationResponse = match serde_json::from_value(value) {
        Ok(response) => response,
        Err(e) => return failed(format!("malformed result: {e}")),
    };
    if let Some(error) = response.error {
        return failed(format!(
            "inference error {}: {}",
            error.error_code.map(|c| c.to_string()).unwrap_or_default(),
            error.error_message.unwrap_or_default()
        ));
    }

    let input_text = response
        .model_input
        .as_ref()
        .and_then(|input| input.messages.first())
        .and_then(|message| message.content.first())
        .map(|block| block.text.clone());
    let Some(input_text) = input_text else {
        return failed("result is missing the input text".to_string());
    };
    let output = response
        .model_output
        .as_ref()
        .and_then(|output| output.content.first())
        .map(|block| block.text.as_str());
    let Some(output) = output else {
        return failed("result is missing the model output".to_string());
    };

    let (class, rationale) = extract_class(output);
    LineOutcome::Classified(ClassificationResult {
        id: record_id,
        input_text,
        class,
        rationale,
    })
}

/// Split `<class>X</class> rationale` into its parts.
pub fn extract_class(output: &str) -> (String, String) {
    let parsed = output.split_once("<class>").and_then(|(_, rest)| rest.split_once("</class>"));
    match parsed {
        Some((class, rationale)) => (class.trim().to_string(), rationale.trim().to_string()),
        None => (UNCLASSIFIED.to_string(), NO_RATIONALE.to_string()),
    }
}

fn render_csv(results: &[&ClassificationResult]) -> Result<Vec<u8>, StageError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(["id", "input_text", "class", "rationale"])
        .map_err(|e| StageError::Malformed(format!("CSV output: {e}")))?;
    for result in results {
        writer
            .serialize(result)
            .map_err(|e| StageError::Malformed(format!("CSV output: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| StageError::Malformed(format!("CSV output: {e}")))
}

fn render_json_lines(results: &[&ClassificationResult]) -> Result<Vec<u8>, StageError> {
    let mut body = Vec::new();
    for result in results {
        serde_json::to_writer(&mut body, result)
            .map_err(|e| StageError::Malformed(format!("JSON output: {e}")))?;
        body.push(b'\n');
    }
    Ok(body)
}
