//! Error types for PartGen.
//!
//! Library crates use [`PartGenError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all PartGen operations.
#[derive(Debug, thiserror::Error)]
pub enum PartGenError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// No identity column could be resolved for the input table.
    #[error("schema error: {message}")]
    Schema { message: String },

    /// The generation service could not be reached.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// The generation service answered with an error or unusable content.
    #[error("generation error: {0}")]
    Generation(String),

    /// Free-form model output could not be turned into a title/description.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// A bounded wait elapsed before the operation finished.
    #[error("timed out after {secs}s: {message}")]
    Timeout { secs: u64, message: String },

    /// Delimited-table reading or writing error.
    #[error("table error: {0}")]
    Table(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad input structure, invalid value, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PartGenError>;

impl PartGenError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a schema error from any displayable message.
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this is an I/O permission failure.
    pub fn is_permission_denied(&self) -> bool {
        self.io_kind() == Some(std::io::ErrorKind::PermissionDenied)
    }

    /// Whether this is an I/O failure on a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        self.io_kind() == Some(std::io::ErrorKind::NotFound)
    }

    fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Self::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}
