//! Request and response bodies of the Ollama HTTP API.

use serde::{Deserialize, Serialize};

use partgen_shared::GenerationConfig;

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Shape the service is asked to answer in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseFormat {
    #[default]
    Text,
    /// Constrain the reply to a single JSON value.
    Json,
}

impl ResponseFormat {
    pub(crate) fn as_wire(self) -> Option<&'static str> {
        match self {
            Self::Text => None,
            Self::Json => Some("json"),
        }
    }
}

/// Sampling options sent as the request's `options` object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub seed: i64,
    /// Maximum tokens to generate.
    pub num_predict: u32,
    #[serde(skip)]
    pub format: ResponseFormat,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

impl From<&GenerationConfig> for GenerationOptions {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            repeat_penalty: config.repeat_penalty,
            seed: config.seed,
            num_predict: config.max_output_tokens,
            format: ResponseFormat::Text,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<&'static str>,
    pub options: &'a GenerationOptions,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    pub message: ResponseMessage,
    #[serde(default)]
    pub eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseMessage {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagsResponse {
    #[serde(default)]
    pub models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModelTag {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct PullRequest<'a> {
    pub model: &'a str,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PullResponse {
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: String,
}
