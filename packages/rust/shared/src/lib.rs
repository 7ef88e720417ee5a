//! Shared types, error model, and configuration for PartGen.
//!
//! This crate is the foundation depended on by all other PartGen crates.
//! It provides:
//! - [`PartGenError`] for the unified error type
//! - Domain types ([`Row`], [`ColumnMapping`], [`SpecMap`], [`GenerationResult`], [`ProcessingStats`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, GenerationConfig, OllamaConfig, PipelineConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from,
};
pub use error::{PartGenError, Result};
pub use types::{
    ColumnMapping, DEFAULT_MANUFACTURER_COLUMN, DEFAULT_PART_NUMBER_COLUMN, ERROR_MARKER,
    GenerationResult, MAX_TITLE_LEN, ProcessingStats, Row, RunId, SKIPPED_MARKER, SpecMap,
    StatsSnapshot, UNKNOWN_MANUFACTURER, UNNAMED_COLUMN_PREFIX, WEB_DESCRIPTION_COLUMN,
    WEB_TITLE_COLUMN, is_artifact_column, is_null_token, is_output_column,
};
