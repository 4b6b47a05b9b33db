//! Source files, result artifacts and settings shared by the pipeline tests.
#![allow(dead_code)]

use batch_classify::config::{
    BucketLayout, ConcurrencySettings, HarvestSettings, OutputFormat, PipelineSettings, PreparationSettings,
    QueueSettings, SubmissionSettings, WorkerSettings,
};
use batch_classify::models::classification::ClassificationRequest;
use serde_json::json;
use std::time::Duration;

pub const CUSTOMER_BUCKET: &str = "customer-requests";
pub const INTERNAL_BUCKET: &str = "internal-classifications";
pub const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        layout: BucketLayout {
            customer_bucket: CUSTOMER_BUCKET.to_string(),
            internal_bucket: INTERNAL_BUCKET.to_string(),
            customer_input_folder: "input_data".to_string(),
            customer_output_folder: "classified_data".to_string(),
            batch_input_folder: "batch_input".to_string(),
            batch_output_folder: "batch_output".to_string(),
            processed_folder: "processed_data".to_string(),
        },
        preparation: PreparationSettings {
            id_field: "conversation_id".to_string(),
            text_field: "conversation".to_string(),
            prompt: "Classify the conversation as <class>billing</class> or <class>support</class>.".to_string(),
            batch_size: 200,
            minimum_records_per_batch: 100,
        },
        submission: SubmissionSettings {
            role_arn: "arn:aws:iam::123456789012:role/batch-inference".to_string(),
            model_id: "anthropic.claude-3-5-haiku-20241022-v1:0".to_string(),
            job_prefix: "classify".to_string(),
            timeout: Duration::from_secs(10),
        },
        harvest: HarvestSettings {
            output_format: OutputFormat::Csv,
        },
        queue: QueueSettings {
            visibility_timeout: VISIBILITY_TIMEOUT,
            max_receive_count: 3,
            poll_interval: Duration::from_millis(100),
        },
        worker: WorkerSettings {
            receive_wait: Duration::ZERO,
            execution_budget: Duration::from_secs(10),
        },
        concurrency: ConcurrencySettings {
            preparation: 2,
            submission: 2,
            harvest: 2,
        },
    }
}

pub fn conversation(index: usize) -> String {
    format!("Customer {index} asks why their invoice doubled this month")
}

/// CSV source with `count` records, ids `c0001..`.
pub fn csv_source(count: usize) -> Vec<u8> {
    let mut body = String::from("conversation_id,conversation\n");
    for index in 1..=count {
        body.push_str(&format!("c{index:04},\"{}\"\n", conversation(index)));
    }
    body.into_bytes()
}

/// JSON array source with `count` records, ids `j0001..`.
pub fn json_source(count: usize) -> Vec<u8> {
    let records: Vec<_> = (1..=count)
        .map(|index| json!({"conversation_id": format!("j{index:04}"), "conversation": conversation(index)}))
        .collect();
    serde_json::to_vec(&records).unwrap()
}

/// One successful result line, echoing the request the way the inference service does.
pub fn result_line(request: &ClassificationRequest, class: &str) -> String {
    json!({
        "recordId": request.record_id,
        "modelInput": request.model_input,
        "modelOutput": {
            "content": [{"type": "text", "text": format!("<class>{class}</class> The customer mentions an invoice.")}]
        }
    })
    .to_string()
}

/// Result artifact for a prepared batch. Line `garbled`, when set, is replaced by invalid JSON.
pub fn result_artifact(batch: &[u8], garbled: Option<usize>) -> Vec<u8> {
    let text = String::from_utf8_lossy(batch);
    let lines: Vec<String> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            if Some(index) == garbled {
                return "{\"recordId\": \"trunc".to_string();
            }
            let request: ClassificationRequest = serde_json::from_str(line).unwrap();
            result_line(&request, "billing")
        })
        .collect();
    let mut body = lines.join("\n");
    body.push('\n');
    body.into_bytes()
}
