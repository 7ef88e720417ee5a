//! Client for the text-generation service.
//!
//! The pipeline only ever talks to a [`ChatBackend`]: send a conversation plus
//! sampling options, get free-form text back. [`OllamaClient`] implements it
//! over the Ollama HTTP API (`/api/chat`, `/api/tags`, `/api/pull`), always in
//! non-streaming mode.

mod wire;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, instrument, warn};
use url::Url;

use partgen_shared::{OllamaConfig, PartGenError, Result};

pub use wire::{ChatMessage, GenerationOptions, ResponseFormat, Role};

use wire::{ChatRequest, ChatResponse, ErrorBody, PullRequest, PullResponse, TagsResponse};

/// User-Agent string for generation requests.
const USER_AGENT: &str = concat!("PartGen/", env!("CARGO_PKG_VERSION"));

/// Timeout for the tags listing used by setup checks.
const LIST_TIMEOUT_SECS: u64 = 10;

/// Model pulls download gigabytes; they get their own generous limit.
const PULL_TIMEOUT_SECS: u64 = 60 * 60;

/// Token budget of the connectivity probe.
const PROBE_MAX_TOKENS: u32 = 10;

// ---------------------------------------------------------------------------
// ChatBackend
// ---------------------------------------------------------------------------

/// The opaque generation capability consumed by the pipeline.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Run one chat completion and return the assistant text.
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String>;

    /// Names of the locally available models.
    async fn list_models(&self) -> Result<Vec<String>>;

    /// Download a model. Returns whether the service reported success.
    async fn pull_model(&self, name: &str) -> bool;

    /// Whether a minimal completion against the configured model succeeds.
    async fn test_connection(&self) -> bool;
}

// ---------------------------------------------------------------------------
// OllamaClient
// ---------------------------------------------------------------------------

/// [`ChatBackend`] over the Ollama HTTP API.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: Url,
    model: String,
}

impl OllamaClient {
    /// Build a client from the `[ollama]` config section.
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.base_url).map_err(|e| {
            PartGenError::config(format!("invalid Ollama base URL '{}': {e}", config.base_url))
        })?;
        // `Url::join` replaces the last path segment unless it ends in a slash.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                PartGenError::Connectivity(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url,
            model: config.model.clone(),
        })
    }

    /// Model used by [`ChatBackend::test_connection`].
    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| PartGenError::config(format!("invalid endpoint {path}: {e}")))
    }
}

#[async_trait]
impl ChatBackend for OllamaClient {
    #[instrument(skip_all, fields(model = %model, messages = messages.len()))]
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String> {
        let url = self.endpoint("api/chat")?;
        let request = ChatRequest {
            model,
            messages,
            stream: false,
            format: options.format.as_wire(),
            options,
        };

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response).await);
        }

        let body: ChatResponse = response.json().await.map_err(|e| {
            PartGenError::Generation(format!("invalid chat response body: {e}"))
        })?;

        debug!(
            chars = body.message.content.len(),
            eval_count = body.eval_count,
            "chat completion received"
        );

        Ok(body.message.content)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = self.endpoint("api/tags")?;
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(LIST_TIMEOUT_SECS))
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, response).await);
        }

        let tags: TagsResponse = response.json().await.map_err(|e| {
            PartGenError::Generation(format!("invalid model listing: {e}"))
        })?;

        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    #[instrument(skip(self))]
    async fn pull_model(&self, name: &str) -> bool {
        let url = match self.endpoint("api/pull") {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "cannot build pull endpoint");
                return false;
            }
        };

        info!("pulling model");
        let result = self
            .client
            .post(url)
            .timeout(Duration::from_secs(PULL_TIMEOUT_SECS))
            .json(&PullRequest {
                model: name,
                stream: false,
            })
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "model pull request failed");
                return false;
            }
        };

        if !response.status().is_success() {
            let err = status_error(response.status(), response).await;
            warn!(error = %err, "model pull rejected");
            return false;
        }

        match response.json::<PullResponse>().await {
            Ok(body) if body.status == "success" => {
                info!("model pulled");
                true
            }
            Ok(body) => {
                warn!(status = %body.status, "model pull did not report success");
                false
            }
            Err(e) => {
                warn!(error = %e, "invalid pull response");
                false
            }
        }
    }

    async fn test_connection(&self) -> bool {
        let messages = [ChatMessage::user("Hello")];
        let options = GenerationOptions {
            num_predict: PROBE_MAX_TOKENS,
            ..GenerationOptions::default()
        };

        match self.chat(&self.model, &messages, &options).await {
            Ok(_) => true,
            Err(e) => {
                warn!(model = %self.model, error = %e, "connection test failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Transport failures: unreachable service vs. anything else.
fn request_error(e: reqwest::Error) -> PartGenError {
    if e.is_connect() {
        PartGenError::Connectivity(format!("cannot reach Ollama: {e}"))
    } else if e.is_timeout() {
        PartGenError::Generation(format!("request timed out: {e}"))
    } else {
        PartGenError::Generation(format!("request failed: {e}"))
    }
}

/// Non-2xx responses, using Ollama's `{"error": ...}` body when present.
async fn status_error(status: StatusCode, response: reqwest::Response) -> PartGenError {
    let text = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or_else(|_| text.chars().take(200).collect());

    PartGenError::Generation(format!("HTTP {status}: {detail}"))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn config_for(server: &MockServer) -> OllamaConfig {
        OllamaConfig {
            base_url: server.uri(),
            model: "llama3.1:8b".into(),
            request_timeout_secs: 5,
            connect_timeout_secs: 2,
        }
    }

    fn chat_body(content: &str) -> serde_json::Value {
        json!({
            "model": "llama3.1:8b",
            "created_at": "2024-01-01T00:00:00Z",
            "message": { "role": "assistant", "content": content },
            "done": true,
            "eval_count": 12
        })
    }

    #[tokio::test]
    async fn chat_sends_deterministic_options() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({
                "model": "llama3.1:8b",
                "stream": false,
                "options": { "seed": 42, "num_predict": 2500 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("Title: Foo")))
            .expect(1)
            .mount(&server)
            .await;

        let client = OllamaClient::new(&config_for(&server)).unwrap();
        let messages = [ChatMessage::system("rules"), ChatMessage::user("X100")];
        let text = client
            .chat("llama3.1:8b", &messages, &GenerationOptions::default())
            .await
            .unwrap();

        assert_eq!(text, "Title: Foo");
    }

    #[tokio::test]
    async fn base_url_path_prefix_is_kept() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/ollama/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("Title: Foo")))
            .expect(1)
            .mount(&server)
            .await;

        let config = OllamaConfig {
            base_url: format!("{}/ollama", server.uri()),
            ..config_for(&server)
        };
        let client = OllamaClient::new(&config).unwrap();
        let text = client
            .chat("llama3.1:8b", &[ChatMessage::user("X100")], &GenerationOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "Title: Foo");
    }

    #[tokio::test]
    async fn chat_json_format_is_requested() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({ "format": "json" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("{}")))
            .expect(1)
            .mount(&server)
            .await;

        let client = OllamaClient::new(&config_for(&server)).unwrap();
        let options = GenerationOptions {
            format: ResponseFormat::Json,
            ..GenerationOptions::default()
        };
        let text = client
            .chat("llama3.1:8b", &[ChatMessage::user("cols")], &options)
            .await
            .unwrap();
        assert_eq!(text, "{}");
    }

    #[tokio::test]
    async fn chat_surfaces_service_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({ "error": "model 'nope' not found" })),
            )
            .mount(&server)
            .await;

        let client = OllamaClient::new(&config_for(&server)).unwrap();
        let err = client
            .chat("nope", &[ChatMessage::user("hi")], &GenerationOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PartGenError::Generation(_)));
        assert!(err.to_string().contains("model 'nope' not found"));
    }

    #[tokio::test]
    async fn unreachable_service_is_connectivity_error() {
        let config = OllamaConfig {
            base_url: "http://127.0.0.1:1".into(),
            connect_timeout_secs: 1,
            ..OllamaConfig::default()
        };
        let client = OllamaClient::new(&config).unwrap();
        let err = client
            .chat("m", &[ChatMessage::user("hi")], &GenerationOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PartGenError::Connectivity(_)));
        assert!(!client.test_connection().await);
    }

    #[tokio::test]
    async fn list_models_reads_names() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [
                    { "name": "llama3.1:8b", "size": 1 },
                    { "name": "mistral:7b", "size": 2 }
                ]
            })))
            .mount(&server)
            .await;

        let client = OllamaClient::new(&config_for(&server)).unwrap();
        let models = client.list_models().await.unwrap();
        assert_eq!(models, vec!["llama3.1:8b", "mistral:7b"]);
    }

    #[tokio::test]
    async fn pull_model_reports_success() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .and(body_partial_json(json!({ "model": "llama3.1:8b", "stream": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "success" })))
            .mount(&server)
            .await;

        let client = OllamaClient::new(&config_for(&server)).unwrap();
        assert!(client.pull_model("llama3.1:8b").await);
    }

    #[tokio::test]
    async fn pull_model_failure_is_false() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
            .mount(&server)
            .await;

        let client = OllamaClient::new(&config_for(&server)).unwrap();
        assert!(!client.pull_model("llama3.1:8b").await);
    }

    #[tokio::test]
    async fn test_connection_uses_small_probe() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({ "options": { "num_predict": 10 } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("Hi!")))
            .expect(1)
            .mount(&server)
            .await;

        let client = OllamaClient::new(&config_for(&server)).unwrap();
        assert!(client.test_connection().await);
    }

    #[test]
    fn invalid_base_url_rejected() {
        let config = OllamaConfig {
            base_url: "::not-a-url".into(),
            ..OllamaConfig::default()
        };
        assert!(matches!(
            OllamaClient::new(&config),
            Err(PartGenError::Config { .. })
        ));
    }
}
