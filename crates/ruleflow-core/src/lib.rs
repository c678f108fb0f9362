//! ruleflow core
//!
//! Shared vocabulary of the rule engine:
//! - Identifiers and [`ResourcePath`] addressing
//! - The [`Rule`] model with its closed [`RuleAction`] sum type
//! - [`ChangeEvent`]s delivered by watches
//! - Structural hints ([`Tree`], [`ItemsPattern`])
//! - [`EngineConfig`]
//!
//! # Example
//!
//! ```rust
//! use ruleflow_core::{Rule, RuleAction};
//! use serde_json::json;
//!
//! let rule = Rule::from_document(&json!({
//!     "list": "/docs",
//!     "schema": { "type": "object", "required": ["foo"] },
//!     "type": "reindex",
//!     "destination": "/out/{{foo}}"
//! }))
//! .unwrap();
//!
//! assert!(matches!(rule.action, RuleAction::Reindex { .. }));
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod json;
pub mod path;
pub mod rule;
pub mod tree;

// Re-exports
pub use config::EngineConfig;
pub use error::{ConfigError, RuleError};
pub use event::ChangeEvent;
pub use ids::{ItemKey, ResourceId, Revision, RuleId};
pub use json::PointerError;
pub use path::{PathError, ResourcePath, META_SEGMENT};
pub use rule::{Rule, RuleAction};
pub use tree::{ItemsPattern, PatternError, Tree, WILDCARD};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
