//! Application configuration for PartGen.
//!
//! User config lives at `~/.partgen/partgen.toml`.
//! Environment variables override config file values, CLI flags override both.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PartGenError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "partgen.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".partgen";

// ---------------------------------------------------------------------------
// Config structs (matching partgen.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Generation service connection settings.
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// Sampling parameters and retry policy.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Batch processing and file locations.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// `[ollama]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL of the Ollama HTTP API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used for generation and column analysis.
    #[serde(default = "default_model")]
    pub model: String,

    /// Per-request timeout; also the hard limit of the single-item test path.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// TCP connect timeout.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:11434".into()
}
fn default_model() -> String {
    "llama3.1:8b".into()
}
fn default_request_timeout() -> u64 {
    600
}
fn default_connect_timeout() -> u64 {
    10
}

/// `[generation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    #[serde(default = "default_seed")]
    pub seed: i64,

    /// Upper bound on generated tokens per request.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Attempts per generation call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubled for each further retry.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Hard title length limit.
    #[serde(default = "default_title_max_len")]
    pub title_max_len: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            seed: default_seed(),
            max_output_tokens: default_max_output_tokens(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay(),
            title_max_len: default_title_max_len(),
        }
    }
}

fn default_temperature() -> f32 {
    0.0
}
fn default_top_p() -> f32 {
    0.9
}
fn default_repeat_penalty() -> f32 {
    1.1
}
fn default_seed() -> i64 {
    42
}
fn default_max_output_tokens() -> u32 {
    2500
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    2
}
fn default_title_max_len() -> usize {
    crate::types::MAX_TITLE_LEN
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Rows per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batches processed at the same time.
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,

    /// Rows processed at the same time inside one batch.
    #[serde(default = "default_max_concurrent_rows")]
    pub max_concurrent_rows_per_batch: usize,

    /// Directory for auto-named output files.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Optional specifications table queried by part number.
    #[serde(default = "default_specs_path")]
    pub specs_path: String,

    /// Ask the model to identify the part number / manufacturer columns.
    #[serde(default = "default_true")]
    pub infer_columns: bool,

    /// Field delimiter of input and output tables.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_batches: default_max_concurrent_batches(),
            max_concurrent_rows_per_batch: default_max_concurrent_rows(),
            output_dir: default_output_dir(),
            specs_path: default_specs_path(),
            infer_columns: true,
            delimiter: default_delimiter(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}
fn default_max_concurrent_batches() -> usize {
    4
}
fn default_max_concurrent_rows() -> usize {
    2
}
fn default_output_dir() -> String {
    "output".into()
}
fn default_specs_path() -> String {
    "specifications.csv".into()
}
fn default_true() -> bool {
    true
}
fn default_delimiter() -> char {
    ','
}

// ---------------------------------------------------------------------------
// Overrides & validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Apply the process environment on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup (environment-shaped).
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OLLAMA_MODEL") {
            self.ollama.model = v;
        }
        if let Some(v) = get("OLLAMA_HOST") {
            self.ollama.base_url = if v.contains("://") {
                v
            } else {
                format!("http://{v}")
            };
        }
        if let Some(v) = get("REQUEST_TIMEOUT") {
            self.ollama.request_timeout_secs = parse_env("REQUEST_TIMEOUT", &v)?;
        }
        if let Some(v) = get("TEMPERATURE") {
            self.generation.temperature = parse_env("TEMPERATURE", &v)?;
        }
        if let Some(v) = get("TOP_P") {
            self.generation.top_p = parse_env("TOP_P", &v)?;
        }
        if let Some(v) = get("REPEAT_PENALTY") {
            self.generation.repeat_penalty = parse_env("REPEAT_PENALTY", &v)?;
        }
        if let Some(v) = get("SEED") {
            self.generation.seed = parse_env("SEED", &v)?;
        }
        if let Some(v) = get("MAX_RETRIES") {
            self.generation.max_attempts = parse_env("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("RETRY_DELAY") {
            self.generation.retry_delay_secs = parse_env("RETRY_DELAY", &v)?;
        }
        if let Some(v) = get("BATCH_SIZE") {
            self.pipeline.batch_size = parse_env("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("OUTPUT_DIR") {
            self.pipeline.output_dir = v;
        }
        if let Some(v) = get("SPECS_CSV_PATH") {
            self.pipeline.specs_path = v;
        }
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.ollama.base_url).map_err(|e| {
            PartGenError::config(format!("invalid ollama.base_url '{}': {e}", self.ollama.base_url))
        })?;
        if self.ollama.model.trim().is_empty() {
            return Err(PartGenError::config("ollama.model must not be empty"));
        }
        if self.ollama.request_timeout_secs == 0 {
            return Err(PartGenError::config("ollama.request_timeout_secs must be positive"));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(PartGenError::config("generation.temperature must be within 0.0..=2.0"));
        }
        if !(0.0..=1.0).contains(&self.generation.top_p) {
            return Err(PartGenError::config("generation.top_p must be within 0.0..=1.0"));
        }
        if self.generation.max_attempts == 0 {
            return Err(PartGenError::config("generation.max_attempts must be at least 1"));
        }
        if self.generation.title_max_len == 0 {
            return Err(PartGenError::config("generation.title_max_len must be at least 1"));
        }
        if self.pipeline.batch_size == 0 {
            return Err(PartGenError::config("pipeline.batch_size must be at least 1"));
        }
        if self.pipeline.max_concurrent_batches == 0 || self.pipeline.max_concurrent_rows_per_batch == 0 {
            return Err(PartGenError::config("pipeline concurrency limits must be at least 1"));
        }
        if !self.pipeline.delimiter.is_ascii() {
            return Err(PartGenError::config("pipeline.delimiter must be an ASCII character"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| PartGenError::config(format!("invalid {key}='{value}': {e}")))
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.partgen/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PartGenError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.partgen/partgen.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the config from disk (defaults if absent), then apply the environment.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    let mut config = if path.exists() {
        load_config_from(&path)?
    } else {
        tracing::debug!(?path, "config file not found, using defaults");
        AppConfig::default()
    };

    config.apply_env_overrides()?;
    Ok(config)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PartGenError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PartGenError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PartGenError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PartGenError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PartGenError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("llama3.1:8b"));
        assert!(toml_str.contains("batch_size"));
    }

    #[test]
    fn defaults_match_deterministic_profile() {
        let config: AppConfig = toml::from_str("").expect("empty config");
        assert_eq!(config.generation.temperature, 0.0);
        assert_eq!(config.generation.top_p, 0.9);
        assert_eq!(config.generation.repeat_penalty, 1.1);
        assert_eq!(config.generation.seed, 42);
        assert_eq!(config.generation.max_attempts, 3);
        assert_eq!(config.pipeline.batch_size, 10);
        assert_eq!(config.pipeline.max_concurrent_batches, 4);
        assert_eq!(config.pipeline.max_concurrent_rows_per_batch, 2);
        assert_eq!(config.ollama.request_timeout_secs, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let toml_str = r#"
[pipeline]
batch_size = 25
specs_path = "/data/specs.csv"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pipeline.batch_size, 25);
        assert_eq!(config.pipeline.specs_path, "/data/specs.csv");
        assert_eq!(config.pipeline.max_concurrent_batches, 4);
        assert_eq!(config.ollama.model, "llama3.1:8b");
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("OLLAMA_MODEL", "mistral:7b"),
            ("OLLAMA_HOST", "gpu-box:11434"),
            ("BATCH_SIZE", "5"),
            ("SEED", "7"),
            ("SPECS_CSV_PATH", ""),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_overrides_from(|k| env.get(k).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(config.ollama.model, "mistral:7b");
        assert_eq!(config.ollama.base_url, "http://gpu-box:11434");
        assert_eq!(config.pipeline.batch_size, 5);
        assert_eq!(config.generation.seed, 7);
        // Blank values are ignored
        assert_eq!(config.pipeline.specs_path, "specifications.csv");
    }

    #[test]
    fn env_override_rejects_garbage() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides_from(|k| (k == "BATCH_SIZE").then(|| "ten".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("BATCH_SIZE"));
    }

    #[test]
    fn validation_rejects_zero_batch() {
        let mut config = AppConfig::default();
        config.pipeline.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.ollama.base_url = "not a url".into();
        assert!(config.validate().is_err());
    }
}
