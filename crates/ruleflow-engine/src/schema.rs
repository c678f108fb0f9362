//! Schema validation capability
//!
//! A rule's JSON Schema is compiled once, at registration, into an
//! [`ItemPredicate`] that is then applied to every candidate item.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::SchemaError;

/// Compiled check over item data
pub trait ItemPredicate: Send + Sync + fmt::Debug {
    /// Whether `item` satisfies the schema
    fn matches(&self, item: &Value) -> bool;

    /// Human-readable reasons `item` does not satisfy the schema
    fn violations(&self, item: &Value) -> Vec<String>;
}

/// Turns a schema document into a predicate
pub trait SchemaCompiler: Send + Sync {
    /// Compile `schema`
    ///
    /// # Errors
    /// `SchemaError::Compile` if `schema` is not a valid schema
    fn compile(&self, schema: &Value) -> Result<Arc<dyn ItemPredicate>, SchemaError>;
}

/// JSON Schema compiler backed by `jsonschema`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSchemaCompiler;

impl SchemaCompiler for JsonSchemaCompiler {
    fn compile(&self, schema: &Value) -> Result<Arc<dyn ItemPredicate>, SchemaError> {
        let validator =
            jsonschema::validator_for(schema).map_err(|e| SchemaError::Compile(e.to_string()))?;
        Ok(Arc::new(CompiledSchema { validator }))
    }
}

struct CompiledSchema {
    validator: jsonschema::Validator,
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema").finish_non_exhaustive()
    }
}

impl ItemPredicate for CompiledSchema {
    fn matches(&self, item: &Value) -> bool {
        self.validator.is_valid(item)
    }

    fn violations(&self, item: &Value) -> Vec<String> {
        self.validator
            .iter_errors(item)
            .map(|err| {
                let at = err.instance_path.to_string();
                if at.is_empty() {
                    err.to_string()
                } else {
                    format!("{at}: {err}")
                }
            })
            .collect()
    }
}
