use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{BucketLayout, PreparationSettings};
use crate::models::classification::ClassificationRequest;
use crate::models::job::{JobRecord, NewJobRecord, Stage, StageKind, StageUpdate};
use crate::models::work_item::ObjectRef;
use crate::pipeline::worker::{StageHandler, StageError, StageOutcome};
use crate::pipeline::{fail_open_rows, row_id};
use crate::services::ledger::JobLedger;
use crate::services::notifications::ArtifactWriter;

const BOM: char = '\u{feff}';

/// One usable record from a customer source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub id: String,
    pub text: String,
}

/// Turns a raw customer file into write-once batch artifacts and ledger rows.
pub struct PreparationStage {
    settings: PreparationSettings,
    layout: BucketLayout,
    writer: ArtifactWriter,
    ledger: Arc<dyn JobLedger>,
}

impl PreparationStage {
    pub fn new(
        settings: PreparationSettings,
        layout: BucketLayout,
        writer: ArtifactWriter,
        ledger: Arc<dyn JobLedger>,
    ) -> Self {
        Self {
            settings,
            layout,
            writer,
            ledger,
        }
    }

    async fn write_batch(
        &self,
        source: &ObjectRef,
        parent_id: &str,
        batch_id: &str,
        records: &[SourceRecord],
    ) -> Result<(), StageError> {
        for record in records {
            self.ledger
                .create(NewJobRecord {
                    id: row_id(batch_id, &record.id),
                    parent_id: parent_id.to_string(),
                    batch_id: batch_id.to_string(),
                    input_ref: source.uri(),
                })
                .await?;
        }

        // Rows become SUBMITTED before the artifact exists, so the submission
        // stage never observes a batch whose rows are still PREPARING.
        for record in records {
            let update = StageUpdate::new(Stage::Preparing, Stage::Submitted);
            self.ledger.transition(&row_id(batch_id, &record.id), update).await?;
        }

        let body = render_batch(records, &self.settings.prompt)?;
        let artifact = ObjectRef::new(
            self.layout.internal_bucket.clone(),
            format!("{}/{}/{}.jsonl", self.layout.batch_input_folder, parent_id, batch_id),
        );
        self.writer.write(&artifact, &body, "application/jsonl").await?;

        tracing::info!(
            parent_id = %parent_id,
            batch_id = %batch_id,
            records = records.len(),
            artifact = %artifact,
            "Batch artifact written"
        );
        Ok(())
    }
}

#[async_trait]
impl StageHandler for PreparationStage {
    fn kind(&self) -> StageKind {
        StageKind::Preparation
    }

    async fn process(&self, object: &ObjectRef) -> Result<StageOutcome, StageError> {
        let bytes = self.writer.store().get(object).await?;
        let records = parse_source(object, &bytes, &self.settings.id_field, &self.settings.text_field)?;

        if records.len() < self.settings.minimum_records_per_batch {
            return Err(StageError::Malformed(format!(
                "{} usable records, fewer than the minimum of {}",
                records.len(),
                self.settings.minimum_records_per_batch
            )));
        }

        let parent_id = parent_id(object, &bytes);
        let batches = partition(&records, self.settings.batch_size);
        for (index, batch) in batches.iter().enumerate() {
            let batch_id = format!("{parent_id}-batch{}", index + 1);
            self.write_batch(object, &parent_id, &batch_id, batch).await?;
        }

        Ok(StageOutcome::Prepared {
            parent_id,
            batches: batches.len(),
            records: records.len(),
        })
    }

    async fn record_failure(&self, object: &ObjectRef, error: &StageError) -> Result<(), StageError> {
        let bytes = self.writer.store().get_optional(object).await?.unwrap_or_default();
        let parent_id = parent_id(object, &bytes);
        let rows = self.ledger.list_parent(&parent_id).await?;
        if !rows.is_empty() {
            // Rows past PREPARING belong to a delivery that finished its batch.
            let unfinished: Vec<JobRecord> = rows
                .into_iter()
                .filter(|row| row.stage == Stage::Preparing)
                .collect();
            fail_open_rows(self.ledger.as_ref(), &unfinished, &error.to_string()).await?;
            return Ok(());
        }

        // Nothing was partitioned; record the source itself.
        self.ledger
            .create(NewJobRecord {
                id: parent_id.clone(),
                parent_id: parent_id.clone(),
                batch_id: parent_id.clone(),
                input_ref: object.uri(),
            })
            .await?;
        self.ledger
            .transition(
                &parent_id,
                StageUpdate::new(Stage::Preparing, Stage::Failed).with_error(error.to_string()),
            )
            .await?;
        Ok(())
    }
}

/// Deterministic id for everything derived from one version of a source object.
///
/// Overwriting a key with new content yields a new parent, so a corrected
/// upload never collides with the batches of the previous one.
pub fn parent_id(source: &ObjectRef, bytes: &[u8]) -> String {
    let content = Uuid::new_v5(&Uuid::NAMESPACE_OID, bytes);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{}@{content}", source.uri()).as_bytes()).to_string()
}

fn derived_record_id(source: &ObjectRef, index: usize) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{}#{index}", source.uri()).as_bytes()).to_string()
}

/// Parse a `.csv` or `.json` source into records.
///
/// Records without text are skipped. A missing id is derived from the source
/// location and row index; repeated ids keep their first occurrence.
pub fn parse_source(
    source: &ObjectRef,
    bytes: &[u8],
    id_field: &str,
    text_field: &str,
) -> Result<Vec<SourceRecord>, StageError> {
    let extension = source
        .file_name()
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    let raw = match extension.as_str() {
        "csv" => parse_csv(bytes, id_field, text_field)?,
        "json" => parse_json(bytes, id_field, text_field)?,
        other => {
            return Err(StageError::Unsupported(format!(
                "file type '{other}' for {source}"
            )))
        }
    };

    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(raw.len());
    for (index, (id, text)) in raw.into_iter().enumerate() {
        let Some(text) = text else {
            tracing::warn!(source = %source, row = index, field = text_field, "Skipping record without text");
            continue;
        };
        let id = id.unwrap_or_else(|| derived_record_id(source, index));
        if !seen.insert(id.clone()) {
            tracing::warn!(source = %source, record_id = %id, "Skipping duplicate record id");
            continue;
        }
        records.push(SourceRecord { id, text });
    }
    Ok(records)
}

type RawRecord = (Option<String>, Option<String>);

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_csv(bytes: &[u8], id_field: &str, text_field: &str) -> Result<Vec<RawRecord>, StageError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| StageError::Malformed(format!("CSV header: {e}")))?
        .clone();

    let column = |field: &str| {
        headers
            .iter()
            .position(|h| h.trim_start_matches(BOM).trim() == field)
    };
    let text_column = column(text_field)
        .ok_or_else(|| StageError::Malformed(format!("CSV has no '{text_field}' column")))?;
    let id_column = column(id_field);

    let mut out = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| StageError::Malformed(format!("CSV row: {e}")))?;
        let id = id_column.and_then(|i| row.get(i)).and_then(non_empty);
        let text = row.get(text_column).and_then(non_empty);
        out.push((id, text));
    }
    Ok(out)
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_json(bytes: &[u8], id_field: &str, text_field: &str) -> Result<Vec<RawRecord>, StageError> {
    let rows: Vec<serde_json::Map<String, Value>> = serde_json::from_slice(bytes)
        .map_err(|e| StageError::Malformed(format!("JSON source must be an array of objects: {e}")))?;
    let bom_id_field = format!("{BOM}{id_field}");

    Ok(rows
        .iter()
        .map(|row| {
            let id = row
                .get(id_field)
                .or_else(|| row.get(&bom_id_field))
                .and_then(scalar_string);
            let text = row.get(text_field).and_then(scalar_string);
            (id, text)
        })
        .collect())
}

/// Split into `ceil(n / batch_size)` batches whose sizes differ by at most one.
pub fn partition<T>(records: &[T], batch_size: usize) -> Vec<&[T]> {
    if records.is_empty() {
        return Vec::new();
    }
    let batch_size = batch_size.max(1);
    let count = records.len().div_ceil(batch_size);
    let base = records.len() / count;
    let larger = records.len() % count;

    let mut batches = Vec::with_capacity(count);
    let mut start = 0;
    for index in 0..count {
        let len = base + usize::from(index < larger);
        batches.push(&records[start..start + len]);
        start += len;
    }
    batches
}

/// Render a batch as JSON lines of classification requests.
pub fn render_batch(records: &[SourceRecord], prompt: &str) -> Result<Vec<u8>, StageError> {
    let mut body = Vec::new();
    for record in records {
        let request = ClassificationRequest::new(record.id.clone(), record.text.clone(), prompt);
        serde_json::to_writer(&mut body, &request)
            .map_err(|e| StageError::Malformed(format!("record {}: {e}", record.id)))?;
        body.push(b'\n');
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(key: &str) -> ObjectRef {
        ObjectRef::new("customer", key)
    }

    #[test]
    fn test_partition_is_balanced_and_bounded() {
        let records: Vec<usize> = (0..450).collect();
        let sizes: Vec<usize> = partition(&records, 200).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![150, 150, 150]);

        let records: Vec<usize> = (0..401).collect();
        let sizes: Vec<usize> = partition(&records, 200).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![134, 134, 133]);

        let records: Vec<usize> = (0..150).collect();
        assert_eq!(partition(&records, 200).len(), 1);
        assert!(partition::<usize>(&[], 200).is_empty());
    }

    #[test]
    fn test_partition_never_breaks_minimum() {
        let (batch_size, minimum) = (200, 100);
        for n in minimum..=1_000 {
            let records: Vec<usize> = (0..n).collect();
            let batches = partition(&records, batch_size);
            assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), n);
            for batch in batches {
                assert!(batch.len() >= minimum && batch.len() <= batch_size, "n = {n}");
            }
        }
    }

    #[test]
    fn test_parse_csv_with_bom_header() {
        let body = "\u{feff}conversation_id,conversation\n1,hello\n2,\n3,world\n1,again\n";
        let records = parse_source(&source("input_data/a.csv"), body.as_bytes(), "conversation_id", "conversation")
            .unwrap();
        assert_eq!(
            records,
            vec![
                SourceRecord { id: "1".into(), text: "hello".into() },
                SourceRecord { id: "3".into(), text: "world".into() },
            ]
        );
    }

    #[test]
    fn test_parse_json_derives_missing_ids_deterministically() {
        let body = r#"[{"conversation":"a"},{"conversation_id":7,"conversation":"b"},{"other":"c"}]"#;
        let object = source("input_data/a.json");
        let first = parse_source(&object, body.as_bytes(), "conversation_id", "conversation").unwrap();
        let second = parse_source(&object, body.as_bytes(), "conversation_id", "conversation").unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first[1].id, "7");
        assert_eq!(first, second);
        assert_ne!(first[0].id, "");
    }

    #[test]
    fn test_unsupported_and_malformed_sources_are_terminal() {
        let err = parse_source(&source("input_data/a.xlsx"), b"", "id", "text").unwrap_err();
        assert!(matches!(err, StageError::Unsupported(_)));
        assert!(err.is_terminal());

        let err = parse_source(&source("input_data/a.json"), b"{\"not\":\"an array\"}", "id", "text").unwrap_err();
        assert!(matches!(err, StageError::Malformed(_)));

        let err = parse_source(&source("input_data/a.csv"), b"id,body\n1,x\n", "id", "text").unwrap_err();
        assert!(matches!(err, StageError::Malformed(_)));
    }

    #[test]
    fn test_render_batch_lines() {
        let records = vec![
            SourceRecord { id: "1".into(), text: "hello".into() },
            SourceRecord { id: "2".into(), text: "world".into() },
        ];
        let body = render_batch(&records, "Classify.").unwrap();
        let text = String::from_utf8(body).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["recordId"], "1");
        assert_eq!(first["modelInput"]["system"], "Classify.");
        assert_eq!(first["modelInput"]["max_tokens"], 2048);
        assert_eq!(first["modelInput"]["messages"][0]["content"][0]["text"], "hello");
    }

    #[test]
    fn test_parent_id_is_stable() {
        let a = parent_id(&source("input_data/a.csv"), b"id,text\n1,x\n");
        assert_eq!(a, parent_id(&source("input_data/a.csv"), b"id,text\n1,x\n"));
        assert_ne!(a, parent_id(&source("input_data/b.csv"), b"id,text\n1,x\n"));
    }

    #[test]
    fn test_parent_id_changes_with_content() {
        let object = source("input_data/a.csv");
        assert_ne!(parent_id(&object, b"id,text\n1,x\n"), parent_id(&object, b"id,text\n1,y\n"));
    }
}
