//! Title/description generation with bounded retries and a local fallback.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use partgen_ollama::{ChatBackend, GenerationOptions};
use partgen_shared::{AppConfig, GenerationConfig, GenerationResult, SpecMap};

use crate::parser::{self, ParseError};
use crate::prompt::{build_messages, prompt_fingerprint};
use crate::title::compact;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Attempts per generation and the back-off between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub initial_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_secs(config.retry_delay_secs),
        }
    }

    /// Delay after failed attempt `attempt` (1-based): 2s, 4s, 8s, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay.saturating_mul(1 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&GenerationConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why a generation fell back to the local result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationFailure {
    #[error("no usable reply after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("reply could not be parsed: {0}")]
    Unparseable(#[from] ParseError),
}

/// Result of one generation call. Both variants carry a usable result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Generated(GenerationResult),
    Fallback {
        result: GenerationResult,
        reason: GenerationFailure,
    },
}

impl GenerationOutcome {
    pub fn result(&self) -> &GenerationResult {
        match self {
            Self::Generated(result) | Self::Fallback { result, .. } => result,
        }
    }

    pub fn into_result(self) -> GenerationResult {
        match self {
            Self::Generated(result) | Self::Fallback { result, .. } => result,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Remove surrounding whitespace and anything outside the Basic
/// Multilingual Plane.
pub fn sanitize(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| (*c as u32) < 0x10000)
        .collect()
}

/// Generation client shared by all row workers.
pub struct Generator {
    backend: Arc<dyn ChatBackend>,
    model: String,
    options: GenerationOptions,
    retry: RetryPolicy,
    title_max_len: usize,
}

impl Generator {
    pub fn new(backend: Arc<dyn ChatBackend>, config: &AppConfig) -> Self {
        Self {
            backend,
            model: config.ollama.model.clone(),
            options: GenerationOptions::from(&config.generation),
            retry: RetryPolicy::from_config(&config.generation),
            title_max_len: config.generation.title_max_len,
        }
    }

    /// Override the retry policy (tests use zero delays).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn options(&self) -> &GenerationOptions {
        &self.options
    }

    /// Generate a title and description for one product.
    ///
    /// Never fails: exhausted retries and unparseable replies produce the
    /// fallback result. The title always respects the configured limit.
    pub async fn generate(&self, part_number: &str, manufacturer: &str, specs: &SpecMap) -> GenerationOutcome {
        let messages = build_messages(part_number, manufacturer, specs);
        let fingerprint = prompt_fingerprint(&messages);

        debug!(
            part_number,
            fingerprint = %fingerprint,
            model = %self.model,
            temperature = self.options.temperature,
            seed = self.options.seed,
            specs = specs.len(),
            "generation request"
        );

        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts {
            match self.backend.chat(&self.model, &messages, &self.options).await {
                Ok(raw) => {
                    let text = sanitize(&raw);
                    if !text.is_empty() {
                        return self.finish(part_number, manufacturer, &text);
                    }
                    last_error = "empty response".into();
                }
                Err(e) => last_error = e.to_string(),
            }

            warn!(part_number, attempt, error = %last_error, "generation attempt failed");
            if attempt < self.retry.max_attempts {
                tokio::time::sleep(self.retry.delay_after(attempt)).await;
            }
        }

        self.fallback(
            part_number,
            manufacturer,
            GenerationFailure::Exhausted {
                attempts: self.retry.max_attempts,
                last_error,
            },
        )
    }

    fn finish(&self, part_number: &str, manufacturer: &str, text: &str) -> GenerationOutcome {
        match parser::parse(text) {
            Ok(parsed) => {
                let title = compact(&parsed.title, self.title_max_len);
                info!(part_number, strategy = ?parsed.strategy, title_len = title.chars().count(), "generated");
                GenerationOutcome::Generated(GenerationResult {
                    title,
                    description: parsed.description,
                })
            }
            Err(e) => self.fallback(part_number, manufacturer, e.into()),
        }
    }

    fn fallback(&self, part_number: &str, manufacturer: &str, reason: GenerationFailure) -> GenerationOutcome {
        warn!(part_number, %reason, "using fallback content");
        let mut result = GenerationResult::fallback(part_number, manufacturer);
        result.title = compact(&result.title, self.title_max_len);
        GenerationOutcome::Fallback { result, reason }
    }
}
