use garde::Validate;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumString};

use crate::models::job::StageKind;

const BUCKET_ARN_PREFIX: &str = "arn:aws:s3:::";

/// Customer-facing output file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Json,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Operations server bind address. Ignored by the worker process.
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// PostgreSQL connection string (ledger and result tables)
    #[garde(length(min = 1))]
    pub database_url: String,

    /// Redis connection string for the stage queues
    #[garde(length(min = 1))]
    pub redis_url: String,

    /// S3-compatible endpoint URL
    #[garde(length(min = 1))]
    pub s3_endpoint: String,

    #[serde(default = "default_region")]
    #[garde(length(min = 1))]
    pub s3_region: String,

    #[garde(length(min = 1))]
    pub s3_access_key: String,

    #[garde(length(min = 1))]
    pub s3_secret_key: String,

    /// Bucket receiving raw customer requests and classified output
    #[garde(length(min = 1))]
    pub customer_bucket_arn: String,

    /// Bucket holding batch and result artifacts
    #[garde(length(min = 1))]
    pub internal_bucket_arn: String,

    #[serde(default = "default_customer_input_folder")]
    #[garde(custom(valid_folder))]
    pub customer_input_folder: String,

    #[serde(default = "default_customer_output_folder")]
    #[garde(custom(valid_folder))]
    pub customer_output_folder: String,

    #[serde(default = "default_output_format")]
    #[garde(skip)]
    pub output_format: OutputFormat,

    #[serde(default = "default_batch_input_folder")]
    #[garde(custom(valid_folder))]
    pub batch_input_folder: String,

    #[serde(default = "default_batch_output_folder")]
    #[garde(custom(valid_folder))]
    pub batch_output_folder: String,

    #[serde(default = "default_processed_folder")]
    #[garde(custom(valid_folder))]
    pub processed_folder: String,

    /// Source column holding the record id
    #[garde(length(min = 1, max = 128))]
    pub input_mapping_id_field: String,

    /// Source column holding the text to classify
    #[garde(length(min = 1, max = 128))]
    pub input_mapping_text_field: String,

    /// System prompt sent with every classification request
    #[garde(length(min = 1))]
    pub prompt: String,

    #[serde(default = "default_batch_size")]
    #[garde(range(min = 1, max = 50_000))]
    pub batch_size: usize,

    #[serde(default = "default_minimum_records_per_batch")]
    #[garde(range(min = 1))]
    pub minimum_records_per_batch: usize,

    #[serde(default = "default_job_status_table")]
    #[garde(pattern(r"^[a-z_][a-z0-9_]{0,62}$"))]
    pub job_status_table: String,

    #[serde(default = "default_results_table")]
    #[garde(pattern(r"^[a-z_][a-z0-9_]{0,62}$"))]
    pub results_table: String,

    /// Base URL of the managed batch inference service
    #[garde(length(min = 1))]
    pub inference_endpoint: String,

    #[garde(length(min = 1))]
    pub inference_api_token: String,

    /// Delegated execution role passed with every job submission
    #[garde(length(min = 1))]
    pub inference_role_arn: String,

    #[garde(length(min = 1))]
    pub inference_model_id: String,

    #[serde(default = "default_job_prefix")]
    #[garde(length(min = 1, max = 32))]
    pub inference_job_prefix: String,

    #[serde(default = "default_inference_timeout_secs")]
    #[garde(range(min = 1))]
    pub inference_timeout_secs: u64,

    #[serde(default = "default_queue_prefix")]
    #[garde(length(min = 1))]
    pub queue_prefix: String,

    #[serde(default = "default_max_receive_count")]
    #[garde(range(min = 1, max = 1000))]
    pub max_receive_count: u32,

    #[serde(default = "default_visibility_timeout_secs")]
    #[garde(range(min = 1))]
    pub visibility_timeout_secs: u64,

    #[serde(default = "default_receive_wait_secs")]
    #[garde(range(min = 1, max = 20))]
    pub receive_wait_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    #[garde(range(min = 10))]
    pub queue_poll_interval_ms: u64,

    #[serde(default = "default_max_concurrency")]
    #[garde(range(min = 1, max = 1000))]
    pub preparation_max_concurrency: usize,

    #[serde(default = "default_max_concurrency")]
    #[garde(range(min = 1, max = 1000))]
    pub submission_max_concurrency: usize,

    #[serde(default = "default_max_concurrency")]
    #[garde(range(min = 1, max = 1000))]
    pub harvest_max_concurrency: usize,

    /// Execution budget of a single stage invocation
    #[serde(default = "default_stage_timeout_secs")]
    #[garde(range(min = 1))]
    pub stage_timeout_secs: u64,

    /// Age after which a non-terminal ledger row is reported as stuck
    #[serde(default = "default_stale_after_secs")]
    #[garde(range(min = 60))]
    pub stale_after_secs: u64,

    #[serde(default = "default_result_poll_interval_secs")]
    #[garde(range(min = 1))]
    pub result_poll_interval_secs: u64,

    /// Comma-separated stage names run by this worker process
    #[serde(default = "default_worker_stages")]
    #[garde(length(min = 1))]
    pub worker_stages: String,

    /// Prometheus scrape address exposed by the worker process
    #[serde(default = "default_worker_metrics_addr")]
    #[garde(length(min = 1))]
    pub worker_metrics_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_region() -> String {
    "auto".to_string()
}

fn default_customer_input_folder() -> String {
    "input_data".to_string()
}

fn default_customer_output_folder() -> String {
    "classified_data".to_string()
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Csv
}

fn default_batch_input_folder() -> String {
    "batch_input".to_string()
}

fn default_batch_output_folder() -> String {
    "batch_output".to_string()
}

fn default_processed_folder() -> String {
    "processed_data".to_string()
}

fn default_batch_size() -> usize {
    200
}

fn default_minimum_records_per_batch() -> usize {
    100
}

fn default_job_status_table() -> String {
    "job_status".to_string()
}

fn default_results_table() -> String {
    "classification_results".to_string()
}

fn default_job_prefix() -> String {
    "classify".to_string()
}

fn default_inference_timeout_secs() -> u64 {
    30
}

fn default_queue_prefix() -> String {
    "batch_classify".to_string()
}

fn default_max_receive_count() -> u32 {
    3
}

fn default_visibility_timeout_secs() -> u64 {
    180
}

fn default_receive_wait_secs() -> u64 {
    20
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_concurrency() -> usize {
    2
}

fn default_stage_timeout_secs() -> u64 {
    60
}

fn default_stale_after_secs() -> u64 {
    24 * 60 * 60
}

fn default_result_poll_interval_secs() -> u64 {
    30
}

fn default_worker_stages() -> String {
    "preparation,submission,harvest".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn valid_folder(value: &str, _ctx: &()) -> garde::Result {
    if value.is_empty() || value.starts_with('/') || value.ends_with('/') {
        return Err(garde::Error::new(
            "folder must be non-empty without leading or trailing '/'",
        ));
    }
    Ok(())
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.check()?;
        Ok(config)
    }

    /// Field-level and cross-field validation.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|report| ConfigError::Invalid(report.to_string()))?;
        check_batch_bounds(self.batch_size, self.minimum_records_per_batch)?;
        bucket_name(&self.customer_bucket_arn)?;
        bucket_name(&self.internal_bucket_arn)?;
        self.check_folders()?;
        if self.stage_timeout_secs >= self.visibility_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "STAGE_TIMEOUT_SECS ({}) must be below VISIBILITY_TIMEOUT_SECS ({})",
                self.stage_timeout_secs, self.visibility_timeout_secs
            )));
        }
        self.stages()?;
        Ok(())
    }

    /// Folders sharing a bucket must not overlap, or one stage's output would
    /// match another stage's notification rule.
    fn check_folders(&self) -> Result<(), ConfigError> {
        let customer = self.customer_bucket()?;
        let internal = self.internal_bucket()?;
        let folders = [
            (&customer, "CUSTOMER_INPUT_FOLDER", &self.customer_input_folder),
            (&customer, "CUSTOMER_OUTPUT_FOLDER", &self.customer_output_folder),
            (&internal, "BATCH_INPUT_FOLDER", &self.batch_input_folder),
            (&internal, "BATCH_OUTPUT_FOLDER", &self.batch_output_folder),
            (&internal, "PROCESSED_FOLDER", &self.processed_folder),
        ];
        for (i, (bucket_a, name_a, a)) in folders.iter().enumerate() {
            for (bucket_b, name_b, b) in &folders[i + 1..] {
                if bucket_a == bucket_b && folders_overlap(a, b) {
                    return Err(ConfigError::Invalid(format!(
                        "{name_a} ({a}) and {name_b} ({b}) overlap in bucket {bucket_a}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn customer_bucket(&self) -> Result<String, ConfigError> {
        bucket_name(&self.customer_bucket_arn)
    }

    pub fn internal_bucket(&self) -> Result<String, ConfigError> {
        bucket_name(&self.internal_bucket_arn)
    }

    /// Stages this worker process runs.
    pub fn stages(&self) -> Result<Vec<StageKind>, ConfigError> {
        self.worker_stages
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| StageKind::from_str(s).map_err(|_| ConfigError::UnknownStage(s.to_string())))
            .collect()
    }

    pub fn settings(&self) -> Result<PipelineSettings, ConfigError> {
        let customer_bucket = self.customer_bucket()?;
        let internal_bucket = self.internal_bucket()?;
        Ok(PipelineSettings {
            layout: BucketLayout {
                customer_bucket,
                internal_bucket,
                customer_input_folder: self.customer_input_folder.clone(),
                customer_output_folder: self.customer_output_folder.clone(),
                batch_input_folder: self.batch_input_folder.clone(),
                batch_output_folder: self.batch_output_folder.clone(),
                processed_folder: self.processed_folder.clone(),
            },
            preparation: PreparationSettings {
                id_field: strip_bom(&self.input_mapping_id_field),
                text_field: strip_bom(&self.input_mapping_text_field),
                prompt: self.prompt.clone(),
                batch_size: self.batch_size,
                minimum_records_per_batch: self.minimum_records_per_batch,
            },
            submission: SubmissionSettings {
                role_arn: self.inference_role_arn.clone(),
                model_id: self.inference_model_id.clone(),
                job_prefix: self.inference_job_prefix.clone(),
                timeout: Duration::from_secs(self.inference_timeout_secs),
            },
            harvest: HarvestSettings {
                output_format: self.output_format,
            },
            queue: QueueSettings {
                visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
                max_receive_count: self.max_receive_count,
                poll_interval: Duration::from_millis(self.queue_poll_interval_ms),
            },
            worker: WorkerSettings {
                receive_wait: Duration::from_secs(self.receive_wait_secs),
                execution_budget: Duration::from_secs(self.stage_timeout_secs),
            },
            concurrency: ConcurrencySettings {
                preparation: self.preparation_max_concurrency,
                submission: self.submission_max_concurrency,
                harvest: self.harvest_max_concurrency,
            },
        })
    }
}

/// Every balanced split of `n >= minimum` records into `ceil(n / batch_size)`
/// batches stays within both bounds only while `minimum <= (batch_size + 1) / 2`.
pub fn check_batch_bounds(batch_size: usize, minimum: usize) -> Result<(), ConfigError> {
    if minimum == 0 || batch_size == 0 || minimum > (batch_size + 1) / 2 {
        return Err(ConfigError::BatchBounds { batch_size, minimum });
    }
    Ok(())
}

/// Extract the bucket name from `arn:aws:s3:::bucket-name`.
pub fn bucket_name(arn: &str) -> Result<String, ConfigError> {
    match arn.strip_prefix(BUCKET_ARN_PREFIX) {
        Some(name) if !name.is_empty() && !name.contains('/') => Ok(name.to_string()),
        _ => Err(ConfigError::BucketArn(arn.to_string())),
    }
}

/// True when one folder equals or contains the other.
fn folders_overlap(a: &str, b: &str) -> bool {
    let nested = |outer: &str, inner: &str| {
        inner
            .strip_prefix(outer)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    };
    nested(a, b) || nested(b, a)
}

fn strip_bom(field: &str) -> String {
    field.replace('\u{feff}', "").trim().to_string()
}

/// Where each stage reads and writes.
#[derive(Debug, Clone)]
pub struct BucketLayout {
    pub customer_bucket: String,
    pub internal_bucket: String,
    pub customer_input_folder: String,
    pub customer_output_folder: String,
    pub batch_input_folder: String,
    pub batch_output_folder: String,
    pub processed_folder: String,
}

#[derive(Debug, Clone)]
pub struct PreparationSettings {
    pub id_field: String,
    pub text_field: String,
    pub prompt: String,
    pub batch_size: usize,
    pub minimum_records_per_batch: usize,
}

#[derive(Debug, Clone)]
pub struct SubmissionSettings {
    pub role_arn: String,
    pub model_id: String,
    pub job_prefix: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HarvestSettings {
    pub output_format: OutputFormat,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(default_visibility_timeout_secs()),
            max_receive_count: default_max_receive_count(),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub receive_wait: Duration,
    pub execution_budget: Duration,
}

#[derive(Debug, Clone)]
pub struct ConcurrencySettings {
    pub preparation: usize,
    pub submission: usize,
    pub harvest: usize,
}

impl ConcurrencySettings {
    pub fn for_stage(&self, kind: StageKind) -> usize {
        match kind {
            StageKind::Preparation => self.preparation,
            StageKind::Submission => self.submission,
            StageKind::Harvest => self.harvest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub layout: BucketLayout,
    pub preparation: PreparationSettings,
    pub submission: SubmissionSettings,
    pub harvest: HarvestSettings,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub concurrency: ConcurrencySettings,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("MINIMUM_RECORDS_PER_BATCH ({minimum}) must be at least 1 and at most half of BATCH_SIZE ({batch_size}) rounded up")]
    BatchBounds { batch_size: usize, minimum: usize },

    #[error("Invalid S3 bucket ARN format. Expected 'arn:aws:s3:::bucket-name', got {0}")]
    BucketArn(String),

    #[error("Unknown stage in WORKER_STAGES: {0}")]
    UnknownStage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_env() -> Vec<(String, String)> {
        [
            ("DATABASE_URL", "postgres://localhost/classify"),
            ("REDIS_URL", "redis://localhost"),
            ("S3_ENDPOINT", "http://localhost:9000"),
            ("S3_ACCESS_KEY", "key"),
            ("S3_SECRET_KEY", "secret"),
            ("CUSTOMER_BUCKET_ARN", "arn:aws:s3:::customer-requests"),
            ("INTERNAL_BUCKET_ARN", "arn:aws:s3:::internal-classifications"),
            ("INPUT_MAPPING_ID_FIELD", "\u{feff}conversation_id"),
            ("INPUT_MAPPING_TEXT_FIELD", "conversation"),
            ("PROMPT", "Classify the conversation."),
            ("INFERENCE_ENDPOINT", "http://localhost:8080"),
            ("INFERENCE_API_TOKEN", "token"),
            ("INFERENCE_ROLE_ARN", "arn:aws:iam::123456789012:role/batch-inference"),
            ("INFERENCE_MODEL_ID", "anthropic.claude-3-5-haiku-20241022-v1:0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn load(extra: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let mut env = sample_env();
        env.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        let config: AppConfig = envy::from_iter(env)?;
        config.check()?;
        Ok(config)
    }

    #[test]
    fn test_defaults_applied() {
        let config = load(&[]).unwrap();
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.minimum_records_per_batch, 100);
        assert_eq!(config.max_receive_count, 3);
        assert_eq!(config.output_format, OutputFormat::Csv);
        assert_eq!(
            config.stages().unwrap(),
            vec![StageKind::Preparation, StageKind::Submission, StageKind::Harvest]
        );
    }

    #[test]
    fn test_settings_projection() {
        let config = load(&[("OUTPUT_FORMAT", "json"), ("HARVEST_MAX_CONCURRENCY", "7")]).unwrap();
        let settings = config.settings().unwrap();
        assert_eq!(settings.layout.customer_bucket, "customer-requests");
        assert_eq!(settings.layout.internal_bucket, "internal-classifications");
        assert_eq!(settings.preparation.id_field, "conversation_id");
        assert_eq!(settings.harvest.output_format, OutputFormat::Json);
        assert_eq!(settings.concurrency.for_stage(StageKind::Harvest), 7);
        assert_eq!(settings.queue.visibility_timeout, Duration::from_secs(180));
    }

    #[test]
    fn test_missing_required_variable() {
        let env: Vec<(String, String)> = sample_env()
            .into_iter()
            .filter(|(k, _)| k != "PROMPT")
            .collect();
        assert!(envy::from_iter::<_, AppConfig>(env).is_err());
    }

    #[test]
    fn test_batch_bounds() {
        assert!(check_batch_bounds(200, 100).is_ok());
        assert!(check_batch_bounds(201, 101).is_ok());
        assert!(check_batch_bounds(200, 101).is_err());
        assert!(check_batch_bounds(200, 0).is_err());
        assert!(matches!(
            load(&[("MINIMUM_RECORDS_PER_BATCH", "150")]),
            Err(ConfigError::BatchBounds { .. })
        ));
    }

    #[test]
    fn test_bucket_arn() {
        assert_eq!(bucket_name("arn:aws:s3:::my-bucket").unwrap(), "my-bucket");
        assert!(bucket_name("my-bucket").is_err());
        assert!(bucket_name("arn:aws:s3:::").is_err());
        assert!(matches!(
            load(&[("CUSTOMER_BUCKET_ARN", "s3://nope")]),
            Err(ConfigError::BucketArn(_))
        ));
    }

    #[test]
    fn test_rejects_bad_table_and_stage() {
        assert!(matches!(
            load(&[("JOB_STATUS_TABLE", "job-status; drop")]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            load(&[("WORKER_STAGES", "preparation,polishing")]),
            Err(ConfigError::UnknownStage(_))
        ));
    }

    #[test]
    fn test_input_and_output_folders_must_differ() {
        assert!(matches!(
            load(&[("CUSTOMER_INPUT_FOLDER", "data"), ("CUSTOMER_OUTPUT_FOLDER", "data")]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_nested_folders_rejected() {
        assert!(matches!(
            load(&[("CUSTOMER_INPUT_FOLDER", "input_data"), ("CUSTOMER_OUTPUT_FOLDER", "input_data/classified")]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            load(&[("BATCH_INPUT_FOLDER", "batch"), ("BATCH_OUTPUT_FOLDER", "batch/out")]),
            Err(ConfigError::Invalid(_))
        ));
        // Sibling names sharing a prefix are fine
        assert!(load(&[("CUSTOMER_INPUT_FOLDER", "data"), ("CUSTOMER_OUTPUT_FOLDER", "data_out")]).is_ok());

        // One shared bucket puts every folder in the same namespace
        let shared = [
            ("INTERNAL_BUCKET_ARN", "arn:aws:s3:::customer-requests"),
            ("BATCH_INPUT_FOLDER", "input_data/batches"),
        ];
        assert!(matches!(load(&shared), Err(ConfigError::Invalid(_))));
        assert!(load(&[("INTERNAL_BUCKET_ARN", "arn:aws:s3:::customer-requests")]).is_ok());
    }

    #[test]
    fn test_stage_timeout_must_stay_below_visibility_timeout() {
        assert!(matches!(
            load(&[("STAGE_TIMEOUT_SECS", "600"), ("VISIBILITY_TIMEOUT_SECS", "30")]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            load(&[("STAGE_TIMEOUT_SECS", "30"), ("VISIBILITY_TIMEOUT_SECS", "30")]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(load(&[("STAGE_TIMEOUT_SECS", "29"), ("VISIBILITY_TIMEOUT_SECS", "30")]).is_ok());
    }
}
