//! Error types for the rule engine
//!
//! Split by where they stop:
//! - [`ExecutionError`]: one item, caught at the watcher's per-item boundary
//! - [`RegistryError`]: one rule, which becomes inert
//! - [`EngineError`]: one credential's instance

use ruleflow_core::{ConfigError, PathError, PointerError, RuleError, RuleId};
use ruleflow_store::StoreError;

/// Schema compilation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchemaError {
    /// Schema is not a valid JSON Schema
    #[error("schema does not compile: {0}")]
    Compile(String),
}

/// Template errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// Template text is malformed
    #[error("invalid template '{template}': {message}")]
    Parse { template: String, message: String },

    /// Template calls a helper that is not registered
    #[error("unknown helper '{0}'")]
    UnknownHelper(String),

    /// Referenced field is absent from the data
    #[error("'{0}' not defined in item")]
    Missing(String),

    /// Helper rejected its arguments
    #[error("helper '{helper}' failed: {message}")]
    Helper { helper: String, message: String },
}

impl TemplateError {
    /// Create parse error
    pub fn parse(template: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            template: template.to_string(),
            message: message.into(),
        }
    }

    /// Create helper error
    pub fn helper(helper: &str, message: impl Into<String>) -> Self {
        Self::Helper {
            helper: helper.to_string(),
            message: message.into(),
        }
    }
}

/// Failure while running a rule on one item
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Store read or write failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Template could not be rendered for this item
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// Rendered destination is not a usable path
    #[error("invalid destination: {0}")]
    Destination(#[from] PathError),

    /// Job reference could not be injected
    #[error("invalid job pointer: {0}")]
    Pointer(#[from] PointerError),

    /// Item has no `_id`, so nothing can link to it
    #[error("item {0} is not a standalone resource")]
    NotAResource(String),

    /// Rendered job names no usable service
    #[error("job service {0:?} is not a single path segment")]
    InvalidService(String),
}

impl ExecutionError {
    /// Check if a later delivery of the same item may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_retryable() || err.is_not_found(),
            _ => false,
        }
    }
}

/// Failure to bring up or tear down a rule
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Rule document is malformed
    #[error("invalid rule: {0}")]
    InvalidRule(#[from] RuleError),

    /// Rule schema does not compile
    #[error("invalid rule schema: {0}")]
    Schema(#[from] SchemaError),

    /// Destination or job template does not compile
    #[error("invalid rule template: {0}")]
    Template(#[from] TemplateError),

    /// Watch on the rule's list could not be started
    #[error("failed to watch list of rule {rule}: {source}")]
    Subscribe {
        rule: RuleId,
        #[source]
        source: StoreError,
    },

    /// Watch on the rule's list could not be released
    #[error("failed to release watch of rule {rule}: {source}")]
    Unsubscribe {
        rule: RuleId,
        #[source]
        source: StoreError,
    },

    /// A watcher task panicked or was aborted
    #[error("watcher task of rule {rule} failed: {message}")]
    Task { rule: RuleId, message: String },
}

impl RegistryError {
    /// Whether the rule definition itself is at fault
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRule(_) | Self::Schema(_) | Self::Template(_)
        )
    }
}

/// Failure of a whole instance
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration is unusable
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Store or feed failed outside any rule
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Rule teardown failed during shutdown
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
