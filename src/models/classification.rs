use serde::{Deserialize, Serialize};

pub const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
pub const MAX_TOKENS: u32 = 2048;

/// One line of a prepared batch artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRequest {
    pub record_id: String,
    pub model_input: ModelInput,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInput {
    pub anthropic_version: String,
    pub max_tokens: u32,
    pub messages: Vec<Message>,
    pub system: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ClassificationRequest {
    pub fn new(record_id: impl Into<String>, text: impl Into<String>, prompt: &str) -> Self {
        Self {
            record_id: record_id.into(),
            model_input: ModelInput {
                anthropic_version: ANTHROPIC_VERSION.to_string(),
                max_tokens: MAX_TOKENS,
                messages: vec![Message {
                    role: "user".to_string(),
                    content: vec![ContentBlock {
                        kind: "text".to_string(),
                        text: text.into(),
                    }],
                }],
                system: prompt.to_string(),
            },
        }
    }
}

/// One line of a result artifact written by the inference service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResponse {
    pub record_id: String,
    pub model_input: Option<ModelInput>,
    pub model_output: Option<ModelOutput>,
    pub error: Option<ResponseError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelOutput {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseError {
    pub error_code: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

/// Customer-visible classification of one record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassificationResult {
    pub id: String,
    pub input_text: String,
    pub class: String,
    pub rationale: String,
}
