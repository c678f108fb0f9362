//! ruleflow engine
//!
//! Rule lifecycle and execution:
//! - [`RuleRegistry`]: one [`RuleWatcher`] per active rule
//! - [`RuleWatcher`]: per-rule serialization of change events
//! - [`RuleExecutor`]: schema gate, action, completion marker
//! - [`MarkerStore`]: completion markers in item metadata
//! - [`SchemaCompiler`] / [`TemplateEngine`]: pluggable capabilities
//! - [`Instance`]: everything above for one credential
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ruleflow_core::EngineConfig;
//! use ruleflow_engine::Instance;
//! use ruleflow_store::MemoryStore;
//!
//! # async fn run() -> ruleflow_engine::EngineResult<()> {
//! let store = MemoryStore::new();
//! let instance = Instance::new(
//!     EngineConfig::default(),
//!     Arc::new(store.clone()),
//!     Arc::new(store),
//! );
//! instance.run(async { let _ = tokio::signal::ctrl_c().await; }).await
//! # }
//! ```

pub mod error;
pub mod executor;
pub mod instance;
pub mod marker;
pub mod metrics;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod template;
pub mod watcher;

// Re-exports
pub use error::{
    EngineError, EngineResult, ExecutionError, RegistryError, SchemaError, TemplateError,
};
pub use executor::{CompiledRule, Item, Outcome, RuleExecutor};
pub use instance::Instance;
pub use marker::MarkerStore;
pub use registry::RuleRegistry;
pub use resolver::{DestinationResolver, JobTemplate};
pub use schema::{ItemPredicate, JsonSchemaCompiler, SchemaCompiler};
pub use template::{DateHelper, Helper, StrictTemplates, Template, TemplateEngine};
pub use watcher::{RuleWatcher, WatcherContext, WatcherStats};
