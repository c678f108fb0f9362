//! Engine configuration
//!
//! Every field has a default, so a config file only needs the values it
//! changes. Files are TOML (`.toml`) or YAML (`.yaml`, `.yml`).

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ConfigError;
use crate::path::ResourcePath;
use crate::tree::Tree;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the resource store API
    pub api_url: String,
    /// Access tokens; one isolated engine instance runs per token
    pub tokens: Vec<String>,
    /// Collection holding the rule documents
    pub rules_path: ResourcePath,
    /// Shape materialised for `rules_path` at start-up
    pub rules_tree: Tree,
    /// Sub-path below an item's `_meta` where completion markers live
    pub meta_path: ResourcePath,
    /// Root of the per-service job queues
    pub services_path: ResourcePath,
    /// Check the completion marker for added items too
    pub check_marker_on_add: bool,
    /// Expose the item's `_meta` to schemas and templates
    pub attach_meta: bool,
    /// Polling interval of the HTTP change feed, in milliseconds
    pub poll_interval_ms: u64,
    /// Capacity of each rule's serialization queue
    pub queue_capacity: usize,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With API base URL
    #[inline]
    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// With access tokens
    #[inline]
    #[must_use]
    pub fn with_tokens(mut self, tokens: Vec<String>) -> Self {
        self.tokens = tokens;
        self
    }

    /// With rules collection path
    #[inline]
    #[must_use]
    pub fn with_rules_path(mut self, rules_path: ResourcePath) -> Self {
        self.rules_path = rules_path;
        self
    }

    /// With marker sub-path
    #[inline]
    #[must_use]
    pub fn with_meta_path(mut self, meta_path: ResourcePath) -> Self {
        self.meta_path = meta_path;
        self
    }

    /// With marker check on added items enabled or disabled
    #[inline]
    #[must_use]
    pub fn with_check_marker_on_add(mut self, check: bool) -> Self {
        self.check_marker_on_add = check;
        self
    }

    /// With polling interval
    #[inline]
    #[must_use]
    pub fn with_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.poll_interval_ms = interval_ms;
        self
    }

    /// Load configuration from a TOML or YAML file
    ///
    /// # Errors
    /// - `ConfigError::Io` if the file cannot be read
    /// - `ConfigError::Toml`/`ConfigError::Yaml` if it cannot be parsed
    /// - `ConfigError::UnsupportedFormat` for other extensions
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::io_error(path, e))?;

        let config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&raw).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?,
            Some("yaml" | "yml") => {
                serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidValue` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tokens.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "tokens",
                message: "at least one token is required".into(),
            });
        }
        if self.rules_path.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "rules_path",
                message: "the rules collection cannot be the store root".into(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue_capacity",
                message: "must be greater than zero".into(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_ms",
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_url: "https://localhost".to_string(),
            tokens: vec!["god".to_string()],
            rules_path: ResourcePath::new(
                ["bookmarks", "services", "ruleflow", "rules"]
                    .map(String::from)
                    .to_vec(),
            ),
            rules_tree: default_rules_tree(),
            meta_path: ResourcePath::new(
                ["services", "ruleflow", "rules"].map(String::from).to_vec(),
            ),
            services_path: ResourcePath::new(["bookmarks", "services"].map(String::from).to_vec()),
            check_marker_on_add: true,
            attach_meta: true,
            poll_interval_ms: 1000,
            queue_capacity: 1024,
        }
    }
}

/// Tree materialised above and at the default rules collection
#[must_use]
pub fn default_rules_tree() -> Tree {
    Tree::new(json!({
        "bookmarks": {
            "_type": "application/vnd.oada.bookmarks.1+json",
            "services": {
                "_type": "application/vnd.oada.services.1+json",
                "_rev": 0,
                "ruleflow": {
                    "_type": "application/vnd.oada.service.1+json",
                    "_rev": 0,
                    "rules": {
                        "_type": "application/vnd.ruleflow.rules.1+json",
                        "_rev": 0,
                        "*": {
                            "_type": "application/vnd.ruleflow.rule.1+json",
                            "_rev": 0
                        }
                    }
                }
            }
        }
    }))
}
