use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Batch inference job request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSubmission {
    /// Unique per batch; doubles as the idempotency key.
    pub job_name: String,
    pub model_id: String,
    /// Delegated execution role the service assumes to read and write the artifacts.
    pub role_arn: String,
    pub input_uri: String,
    pub output_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedJob {
    pub job_arn: String,
}

impl SubmittedJob {
    /// Trailing segment of the job identifier; names the result folder.
    pub fn short_id(&self) -> &str {
        self.job_arn.rsplit('/').next().unwrap_or(&self.job_arn)
    }
}

/// Managed batch inference service.
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn submit(&self, job: &JobSubmission) -> Result<SubmittedJob, InferenceError>;

    /// Find an existing job by its exact name.
    async fn lookup(&self, job_name: &str) -> Result<Option<SubmittedJob>, InferenceError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobRequest<'a> {
    job_name: &'a str,
    role_arn: &'a str,
    model_id: &'a str,
    input_data_config: InputDataConfig<'a>,
    output_data_config: OutputDataConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InputDataConfig<'a> {
    s3_input_data_config: S3Location<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputDataConfig<'a> {
    s3_output_data_config: S3Location<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct S3Location<'a> {
    s3_uri: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobResponse {
    job_arn: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListJobsResponse {
    #[serde(default)]
    invocation_job_summaries: Vec<JobSummary>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobSummary {
    job_arn: String,
    job_name: String,
}

/// HTTP client for the batch inference control plane.
pub struct HttpInferenceClient {
    http: Client,
    endpoint: String,
    api_token: String,
}

impl HttpInferenceClient {
    pub fn new(endpoint: &str, api_token: String, timeout: Duration) -> Result<Self, InferenceError> {
        let http = Client::builder().timeout(timeout).build().map_err(InferenceError::Http)?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_token,
        })
    }
}

/// Map a non-success status to the error taxonomy used by the stage workers.
fn status_error(status: StatusCode, body: String) -> InferenceError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => InferenceError::Throttled(body),
        StatusCode::CONFLICT => InferenceError::AlreadySubmitted(body),
        s if s.is_server_error() => InferenceError::Unavailable {
            status: s.as_u16(),
            body,
        },
        s => InferenceError::Rejected {
            status: s.as_u16(),
            body,
        },
    }
}

fn request_error(e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout
    } else {
        InferenceError::Http(e)
    }
}

#[async_trait]
impl InferenceService for HttpInferenceClient {
    async fn submit(&self, job: &JobSubmission) -> Result<SubmittedJob, InferenceError> {
        let url = format!("{}/model-invocation-job", self.endpoint);
        let request = CreateJobRequest {
            job_name: &job.job_name,
            role_arn: &job.role_arn,
            model_id: &job.model_id,
            input_data_config: InputDataConfig {
                s3_input_data_config: S3Location { s3_uri: &job.input_uri },
            },
            output_data_config: OutputDataConfig {
                s3_output_data_config: S3Location { s3_uri: &job.output_uri },
            },
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&request)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let created: CreateJobResponse = response.json().await.map_err(request_error)?;
        Ok(SubmittedJob {
            job_arn: created.job_arn,
        })
    }

    async fn lookup(&self, job_name: &str) -> Result<Option<SubmittedJob>, InferenceError> {
        let url = format!("{}/model-invocation-jobs", self.endpoint);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .query(&[("nameContains", job_name)])
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let listed: ListJobsResponse = response.json().await.map_err(request_error)?;
        Ok(listed
            .invocation_job_summaries
            .into_iter()
            .find(|summary| summary.job_name == job_name)
            .map(|summary| SubmittedJob {
                job_arn: summary.job_arn,
            }))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inference request timed out")]
    Timeout,

    #[error("Inference service throttled the request: {0}")]
    Throttled(String),

    #[error("Inference service unavailable ({status}): {body}")]
    Unavailable { status: u16, body: String },

    #[error("Inference service rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("A job with this name already exists: {0}")]
    AlreadySubmitted(String),
}

impl InferenceError {
    /// Whether a redelivery may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, InferenceError::Rejected { .. })
    }
}
