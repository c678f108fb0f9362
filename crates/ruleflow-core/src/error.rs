//! Error types for ruleflow core
//!
//! - Rule documents that fail to validate or decode
//! - Configuration files that cannot be loaded

use std::path::PathBuf;

/// Rule decoding errors
///
/// A rule failing with any of these is inert; it never stops the registry.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// Document violates the rule schema
    #[error("rule document is invalid: {}", .0.join("; "))]
    InvalidDocument(Vec<String>),

    /// Document passed the schema but could not be decoded
    #[error("failed to decode rule: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error during file read
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or shape error
    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// YAML syntax or shape error
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Unsupported file extension
    #[error("unsupported config format: {0}")]
    UnsupportedFormat(PathBuf),

    /// A value failed validation
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}

impl ConfigError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
